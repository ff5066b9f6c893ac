use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::ExitError;

/// Result of running a subprocess.
#[derive(Debug)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl RunOutput {
    /// Returns true if the process exited successfully.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout and stderr joined, for failure comments and classification.
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end()),
            (false, true) => self.stdout.trim_end().to_string(),
            (true, _) => self.stderr.trim_end().to_string(),
        }
    }
}

/// Builder for running external CLIs (`gh`, `git`, generation backends, test commands).
#[derive(Debug, Clone)]
pub struct Tool {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
}

impl Tool {
    /// Create a new tool invocation.
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            timeout: None,
            cwd: None,
            env: Vec::new(),
        }
    }

    /// Add a single argument.
    pub fn arg(mut self, arg: &str) -> Self {
        self.args.push(arg.to_string());
        self
    }

    /// Add multiple arguments.
    pub fn args(mut self, args: &[&str]) -> Self {
        self.args.extend(args.iter().map(|s| (*s).to_string()));
        self
    }

    /// Set a timeout for the subprocess. The child is killed on expiry.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Run the tool with `dir` as its working directory.
    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    /// Run the tool, capturing stdout and stderr.
    pub fn run(&self) -> anyhow::Result<RunOutput> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(ref dir) = self.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        tracing::debug!(program = %self.program, args = self.args.len(), "spawning");

        let output: Output = if let Some(timeout) = self.timeout {
            run_with_timeout(&mut cmd, timeout, &self.program)?
        } else {
            cmd.output().map_err(|e| self.not_found_or_other(e))?
        };

        Ok(RunOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    /// Run the tool and return an error if it fails.
    pub fn run_ok(&self) -> anyhow::Result<RunOutput> {
        let output = self.run()?;
        if output.success() {
            Ok(output)
        } else {
            Err(ExitError::ToolFailed {
                tool: self.program.clone(),
                code: output.exit_code,
                message: output.stderr.trim().to_string(),
            }
            .into())
        }
    }

    fn not_found_or_other(&self, e: std::io::Error) -> anyhow::Error {
        if e.kind() == std::io::ErrorKind::NotFound {
            ExitError::ToolNotFound {
                tool: self.program.clone(),
            }
            .into()
        } else {
            anyhow::Error::new(e).context(format!("running {}", self.program))
        }
    }
}

fn run_with_timeout(
    cmd: &mut Command,
    timeout: Duration,
    tool_name: &str,
) -> anyhow::Result<Output> {
    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            anyhow::Error::from(ExitError::ToolNotFound {
                tool: tool_name.to_string(),
            })
        } else {
            anyhow::Error::new(e).context(format!("spawning {tool_name}"))
        }
    })?;

    // Pipes are drained while the child runs so a chatty process cannot fill
    // the pipe buffer and stall until the timeout.
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                return Ok(Output {
                    status,
                    stdout: join(stdout),
                    stderr: join(stderr),
                });
            }
            Ok(None) => {
                if start.elapsed() >= timeout {
                    kill(&mut child);
                    return Err(ExitError::Timeout {
                        tool: tool_name.to_string(),
                        timeout_secs: timeout.as_secs(),
                    }
                    .into());
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                kill(&mut child);
                return Err(anyhow::Error::new(e).context(format!("waiting for {tool_name}")));
            }
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut reader| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = reader.read_to_end(&mut buf);
            buf
        })
    })
}

fn join(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_echo() {
        let output = Tool::new("echo").arg("hello").run().unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[test]
    fn run_false_fails() {
        let output = Tool::new("false").run().unwrap();
        assert!(!output.success());
    }

    #[test]
    fn run_ok_returns_tool_failed() {
        let err = Tool::new("false").run_ok().unwrap_err();
        let exit_err = err.downcast_ref::<ExitError>().unwrap();
        assert!(matches!(exit_err, ExitError::ToolFailed { .. }));
    }

    #[test]
    fn run_not_found() {
        let err = Tool::new("nonexistent-tool-xyz").run().unwrap_err();
        let exit_err = err.downcast_ref::<ExitError>().unwrap();
        assert!(matches!(exit_err, ExitError::ToolNotFound { .. }));
    }

    #[test]
    fn timeout_kills_slow_process() {
        let err = Tool::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(200))
            .run()
            .unwrap_err();
        let exit_err = err.downcast_ref::<ExitError>().unwrap();
        assert!(matches!(exit_err, ExitError::Timeout { .. }));
    }

    #[test]
    fn timeout_collects_output_of_fast_process() {
        let output = Tool::new("echo")
            .arg("fast")
            .timeout(Duration::from_secs(5))
            .run()
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "fast");
    }

    #[test]
    fn runs_in_requested_directory() {
        let dir = tempfile::tempdir().unwrap();
        let output = Tool::new("pwd").current_dir(dir.path()).run().unwrap();
        let reported = std::fs::canonicalize(output.stdout.trim()).unwrap();
        assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[test]
    fn combined_joins_both_streams() {
        let output = RunOutput {
            stdout: "out\n".to_string(),
            stderr: "err\n".to_string(),
            exit_code: 1,
        };
        assert_eq!(output.combined(), "out\nerr");
    }

    #[test]
    fn env_reaches_the_child() {
        let output = Tool::new("sh")
            .args(&["-c", "printf %s \"$RELAY_PROBE\""])
            .env("RELAY_PROBE", "set")
            .run()
            .unwrap();
        assert_eq!(output.stdout, "set");
    }
}
