use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ExitError;
use crate::store::MergeMethod;

/// Config file name constants.
pub const CONFIG_TOML: &str = ".relay.toml";
pub const CONFIG_JSON: &str = ".relay.json";

/// Find the config file in `dir`, preferring .relay.toml over .relay.json.
/// Returns None if neither exists.
pub fn find_config(dir: &Path) -> Option<PathBuf> {
    let toml_path = dir.join(CONFIG_TOML);
    if toml_path.exists() {
        return Some(toml_path);
    }
    let json_path = dir.join(CONFIG_JSON);
    if json_path.exists() {
        return Some(json_path);
    }
    None
}

/// Top-level `.relay.toml`.
///
/// Constructed once at process start and passed by reference into every
/// component; nothing reads configuration from globals.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Remote repository as `owner/name`.
    pub repo: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Sleep after a cycle fails unexpectedly. Defaults to three poll intervals.
    #[serde(default)]
    pub backoff_secs: Option<u64>,
    /// Root for mirrors and worktrees. Defaults to `~/.relay`.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub review: ReviewConfig,
    #[serde(default)]
    pub git: GitConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Codex,
    Claude,
}

/// Generation backend CLI.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,
    #[serde(default = "default_codex_cli")]
    pub codex_cli: String,
    #[serde(default = "default_claude_cli")]
    pub claude_cli: String,
    /// Hard timeout for spec, test, and implementation generation.
    #[serde(default = "default_timeout_600")]
    pub timeout_secs: u64,
    #[serde(default = "default_timeout_300")]
    pub review_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StoreConfig {
    #[serde(default = "default_gh_cli")]
    pub gh_cli: String,
}

/// Lock protocol timing. These are empirical; see DESIGN.md.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LockConfig {
    /// Pause between broadcasting a claim and resolving the race.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Claims considered competitors when resolving a race.
    #[serde(default = "default_race_window_secs")]
    pub race_window_secs: u64,
    /// Claims by another agent younger than this block a new claim outright.
    #[serde(default = "default_freshness_window_secs")]
    pub freshness_window_secs: u64,
    /// In-progress labels older than this are force-unlocked.
    #[serde(default = "default_stale_timeout_minutes")]
    pub stale_timeout_minutes: u64,
}

/// A named local check run in the worktree before the test command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CheckCommand {
    pub name: String,
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LifecycleConfig {
    #[serde(default = "default_retries")]
    pub max_local_retries: u32,
    #[serde(default = "default_retries")]
    pub max_ci_retries: u32,
    #[serde(default = "default_retries")]
    pub max_review_retries: u32,
    #[serde(default = "default_retries")]
    pub max_spec_revisions: u32,
    #[serde(default = "default_timeout_600")]
    pub ci_wait_timeout_secs: u64,
    #[serde(default = "default_ci_poll_interval")]
    pub ci_poll_interval_secs: u64,
    /// Directory (relative to the repo root) where generated tests land.
    #[serde(default = "default_test_dir")]
    pub test_dir: String,
    #[serde(default = "default_test_command")]
    pub test_command: Vec<String>,
    #[serde(default)]
    pub checks: Vec<CheckCommand>,
    /// Timeout for each local check and the test command.
    #[serde(default = "default_timeout_300")]
    pub command_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ReviewConfig {
    #[serde(default)]
    pub auto_merge: bool,
    #[serde(default)]
    pub merge_method: MergeMethod,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GitConfig {
    #[serde(default = "default_git")]
    pub program: String,
    /// Clone URL; defaults to `https://github.com/<repo>.git`.
    #[serde(default)]
    pub remote_url: Option<String>,
    /// Base branch; defaults to the remote's default branch.
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub author_email: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            codex_cli: default_codex_cli(),
            claude_cli: default_claude_cli(),
            timeout_secs: default_timeout_600(),
            review_timeout_secs: default_timeout_300(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            gh_cli: default_gh_cli(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay_ms(),
            race_window_secs: default_race_window_secs(),
            freshness_window_secs: default_freshness_window_secs(),
            stale_timeout_minutes: default_stale_timeout_minutes(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_local_retries: default_retries(),
            max_ci_retries: default_retries(),
            max_review_retries: default_retries(),
            max_spec_revisions: default_retries(),
            ci_wait_timeout_secs: default_timeout_600(),
            ci_poll_interval_secs: default_ci_poll_interval(),
            test_dir: default_test_dir(),
            test_command: default_test_command(),
            checks: Vec::new(),
            command_timeout_secs: default_timeout_300(),
        }
    }
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            program: default_git(),
            remote_url: None,
            base_branch: None,
            author_name: None,
            author_email: None,
        }
    }
}

fn default_poll_interval() -> u64 { 300 }
fn default_codex_cli() -> String { "codex".into() }
fn default_claude_cli() -> String { "claude".into() }
fn default_gh_cli() -> String { "gh".into() }
fn default_git() -> String { "git".into() }
fn default_timeout_300() -> u64 { 300 }
fn default_timeout_600() -> u64 { 600 }
fn default_settle_delay_ms() -> u64 { 2_000 }
fn default_race_window_secs() -> u64 { 30 }
fn default_freshness_window_secs() -> u64 { 30 * 60 }
fn default_stale_timeout_minutes() -> u64 { 30 }
fn default_retries() -> u32 { 3 }
fn default_ci_poll_interval() -> u64 { 30 }
fn default_test_dir() -> String { "tests".into() }
fn default_test_command() -> Vec<String> { vec!["cargo".into(), "test".into()] }

impl LockConfig {
    pub const fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub const fn race_window(&self) -> Duration {
        Duration::from_secs(self.race_window_secs)
    }

    pub const fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.freshness_window_secs)
    }

    pub const fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_minutes * 60)
    }
}

impl BackendConfig {
    /// CLI program for the selected backend.
    pub fn cli(&self) -> &str {
        match self.kind {
            BackendKind::Codex => &self.codex_cli,
            BackendKind::Claude => &self.claude_cli,
        }
    }
}

impl Config {
    /// Load config from a file (TOML or JSON, auto-detected by extension).
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let config = match ext {
            "json" => Self::parse_json(&contents)?,
            "toml" => Self::parse_toml(&contents)?,
            _ => Self::parse_toml(&contents).or_else(|_| Self::parse_json(&contents))?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse config from a TOML string.
    pub fn parse_toml(toml_str: &str) -> anyhow::Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| ExitError::Config(format!("invalid {CONFIG_TOML}: {e}")).into())
    }

    /// Parse config from a JSON string.
    pub fn parse_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| ExitError::Config(format!("invalid {CONFIG_JSON}: {e}")).into())
    }

    /// Reject values the agents cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        let problem = if self.repo.split('/').filter(|p| !p.is_empty()).count() != 2
            || self.repo.matches('/').count() != 1
        {
            Some(format!("repo must be owner/name, got {:?}", self.repo))
        } else if self.poll_interval_secs == 0 {
            Some("poll_interval_secs must be > 0".to_string())
        } else if self.lock.stale_timeout_minutes == 0 {
            Some("lock.stale_timeout_minutes must be > 0".to_string())
        } else if self.lock.race_window_secs == 0 {
            Some("lock.race_window_secs must be > 0".to_string())
        } else if self.lifecycle.test_command.is_empty() {
            Some("lifecycle.test_command must not be empty".to_string())
        } else if self.lifecycle.checks.iter().any(|c| c.command.is_empty()) {
            Some("every lifecycle.checks entry needs a command".to_string())
        } else {
            None
        };
        match problem {
            Some(message) => Err(ExitError::Config(message).into()),
            None => Ok(()),
        }
    }

    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs.unwrap_or(self.poll_interval_secs * 3))
    }

    pub fn work_dir(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(".relay")
        })
    }

    pub fn remote_url(&self) -> String {
        self.git
            .remote_url
            .clone()
            .unwrap_or_else(|| format!("https://github.com/{}.git", self.repo))
    }

    /// Minimal config for tests and `relay config check` examples.
    pub fn for_repo(repo: &str) -> Self {
        Self {
            repo: repo.to_string(),
            poll_interval_secs: default_poll_interval(),
            backoff_secs: None,
            work_dir: None,
            backend: BackendConfig::default(),
            store: StoreConfig::default(),
            lock: LockConfig::default(),
            lifecycle: LifecycleConfig::default(),
            review: ReviewConfig::default(),
            git: GitConfig::default(),
        }
    }
}
