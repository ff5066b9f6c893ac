//! Local verification: configured checks, then the test command, in a worktree.

use std::path::Path;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::{CheckCommand, LifecycleConfig};
use crate::error::ExitError;
use crate::subprocess::Tool;

/// Output kept for feedback and comments.
const TAIL_CHARS: usize = 4_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Passed,
    Failed { step: String, output: String },
}

impl Verification {
    /// Feedback text handed to the backend on the next attempt.
    pub fn feedback(&self) -> Option<String> {
        match self {
            Self::Passed => None,
            Self::Failed { step, output } => Some(format!("`{step}` failed:\n\n```\n{output}\n```")),
        }
    }
}

/// Run every check in order and stop at the first failure.
///
/// A step that times out counts as a failed step; a missing program is an error.
pub fn run(dir: &Path, lifecycle: &LifecycleConfig) -> anyhow::Result<Verification> {
    let timeout = Duration::from_secs(lifecycle.command_timeout_secs);
    let test = CheckCommand {
        name: "tests".to_string(),
        command: lifecycle.test_command.clone(),
    };
    for check in lifecycle.checks.iter().chain(std::iter::once(&test)) {
        let Some((program, args)) = check.command.split_first() else {
            continue;
        };
        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        debug!(step = %check.name, "running");
        let result = Tool::new(program)
            .args(&argv)
            .current_dir(dir)
            .timeout(timeout)
            .run();
        let output = match result {
            Ok(output) => output,
            Err(e) => match e.downcast_ref::<ExitError>() {
                Some(ExitError::Timeout { timeout_secs, .. }) => {
                    return Ok(Verification::Failed {
                        step: check.name.clone(),
                        output: format!("timed out after {timeout_secs}s"),
                    });
                }
                _ => return Err(e),
            },
        };
        if !output.success() {
            info!(step = %check.name, code = output.exit_code, "verification failed");
            return Ok(Verification::Failed {
                step: check.name.clone(),
                output: tail(&output.combined(), TAIL_CHARS),
            });
        }
    }
    Ok(Verification::Passed)
}

/// Last `max` characters of `text`, marked when cut.
pub fn tail(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    let cut: String = text.chars().skip(count - max).collect();
    format!("[... truncated ...]\n{cut}")
}
