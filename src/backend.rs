//! Generation backend: the coding CLI that writes specs, tests, code, and reviews.
//!
//! Output is opaque text. Only the reviewer and spec-writer look inside it,
//! through [`crate::verdict`].

use std::path::Path;
use std::time::Duration;

use tracing::{debug, instrument};

use crate::config::{BackendConfig, BackendKind};
use crate::error::ExitError;
use crate::template::{self, Prompt, PromptContext};
use crate::subprocess::Tool;

/// Tools the backend may use when it edits a worktree.
const EDIT_TOOLS: &str = "Edit,Write,Read,Glob,Grep,Bash";

/// Turn a story into a spec, or revise an existing one against feedback.
#[derive(Debug, Clone, Copy)]
pub struct SpecRequest<'a> {
    pub story: &'a str,
    pub current: Option<&'a str>,
    pub feedback: Option<&'a str>,
}

/// Work on one ticket inside a worktree.
#[derive(Debug, Clone, Copy)]
pub struct Request<'a> {
    pub number: u64,
    pub title: &'a str,
    pub spec: &'a str,
    pub feedback: Option<&'a str>,
    pub test_dir: &'a str,
    pub work_dir: &'a Path,
}

pub trait Generator {
    fn create_spec(&self, request: &SpecRequest<'_>) -> anyhow::Result<String>;
    fn review_spec(&self, spec: &str) -> anyhow::Result<String>;
    /// Write tests into `request.work_dir` before any implementation exists.
    fn generate_tests(&self, request: &Request<'_>) -> anyhow::Result<String>;
    fn generate_implementation(&self, request: &Request<'_>) -> anyhow::Result<String>;
    fn review_change(&self, spec: &str, diff: &str) -> anyhow::Result<String>;
}

/// Drives `codex exec` or `claude -p` as a subprocess under a hard timeout.
#[derive(Debug, Clone)]
pub struct CliGenerator {
    kind: BackendKind,
    program: String,
    repo: String,
    timeout: Duration,
    review_timeout: Duration,
}

impl CliGenerator {
    pub fn new(config: &BackendConfig, repo: &str) -> Self {
        Self {
            kind: config.kind,
            program: config.cli().to_string(),
            repo: repo.to_string(),
            timeout: Duration::from_secs(config.timeout_secs),
            review_timeout: Duration::from_secs(config.review_timeout_secs),
        }
    }

    /// The argv for one invocation, without the program name.
    fn command_args(&self, prompt: &str, edits: bool) -> Vec<String> {
        let mut args = match self.kind {
            BackendKind::Codex => vec!["exec".to_string(), prompt.to_string()],
            BackendKind::Claude => vec!["-p".to_string(), prompt.to_string()],
        };
        if edits {
            match self.kind {
                BackendKind::Codex => args.push("--full-auto".to_string()),
                BackendKind::Claude => {
                    args.push("--allowedTools".to_string());
                    args.push(EDIT_TOOLS.to_string());
                }
            }
        }
        args
    }

    fn invoke(&self, prompt: &str, work_dir: Option<&Path>, edits: bool, timeout: Duration) -> anyhow::Result<String> {
        let args = self.command_args(prompt, edits);
        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        let mut tool = Tool::new(&self.program).args(&argv).timeout(timeout);
        if let Some(dir) = work_dir {
            tool = tool.current_dir(dir);
        }
        debug!(program = %self.program, prompt_len = prompt.len(), "invoking backend");
        let out = tool.run()?;
        if !out.success() {
            return Err(ExitError::ToolFailed {
                tool: self.program.clone(),
                code: out.exit_code,
                message: out.combined(),
            }
            .into());
        }
        Ok(out.stdout)
    }

    fn context<'a>(&'a self, request: &Request<'a>) -> PromptContext<'a> {
        PromptContext {
            repo: &self.repo,
            number: Some(request.number),
            title: Some(request.title),
            spec: Some(request.spec),
            feedback: request.feedback,
            test_dir: Some(request.test_dir),
            ..PromptContext::default()
        }
    }
}

impl Generator for CliGenerator {
    #[instrument(skip_all)]
    fn create_spec(&self, request: &SpecRequest<'_>) -> anyhow::Result<String> {
        let prompt = template::render(
            Prompt::Spec,
            &PromptContext {
                repo: &self.repo,
                story: Some(request.story),
                current: request.current,
                feedback: request.feedback,
                ..PromptContext::default()
            },
        )?;
        self.invoke(&prompt, None, false, self.timeout)
    }

    #[instrument(skip_all)]
    fn review_spec(&self, spec: &str) -> anyhow::Result<String> {
        let prompt = template::render(
            Prompt::SpecReview,
            &PromptContext {
                repo: &self.repo,
                spec: Some(spec),
                ..PromptContext::default()
            },
        )?;
        self.invoke(&prompt, None, false, self.review_timeout)
    }

    #[instrument(skip_all, fields(issue = request.number))]
    fn generate_tests(&self, request: &Request<'_>) -> anyhow::Result<String> {
        let prompt = template::render(Prompt::Tests, &self.context(request))?;
        self.invoke(&prompt, Some(request.work_dir), true, self.timeout)
    }

    #[instrument(skip_all, fields(issue = request.number))]
    fn generate_implementation(&self, request: &Request<'_>) -> anyhow::Result<String> {
        let prompt = template::render(Prompt::Implement, &self.context(request))?;
        self.invoke(&prompt, Some(request.work_dir), true, self.timeout)
    }

    #[instrument(skip_all)]
    fn review_change(&self, spec: &str, diff: &str) -> anyhow::Result<String> {
        let prompt = template::render(
            Prompt::Review,
            &PromptContext {
                repo: &self.repo,
                spec: Some(spec),
                diff: Some(diff),
                ..PromptContext::default()
            },
        )?;
        self.invoke(&prompt, None, false, self.review_timeout)
    }
}
