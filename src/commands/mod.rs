pub mod config;
pub mod doctor;
pub mod plan;
pub mod run;
pub mod schema;
pub mod sweep;

use std::path::Path;

use anyhow::Context;

use crate::backend::CliGenerator;
use crate::clock::SystemClock;
use crate::config::{self as cfg, Config};
use crate::error::ExitError;
use crate::git::Git;
use crate::identity::AgentId;
use crate::lifecycle::Services;
use crate::store::github::GhStore;
use crate::workspace::WorkspaceManager;

/// Load `--config`, or find `.relay.toml`/`.relay.json` in the current directory.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    if let Some(path) = path {
        return Config::load(path);
    }
    let cwd = std::env::current_dir().context("could not determine current directory")?;
    match cfg::find_config(&cwd) {
        Some(found) => Config::load(&found),
        None => Err(ExitError::Config(format!(
            "no {} or {} in {}; pass --config",
            cfg::CONFIG_TOML,
            cfg::CONFIG_JSON,
            cwd.display()
        ))
        .into()),
    }
}

/// The production collaborators, built once per invocation.
pub struct Runtime {
    pub config: Config,
    pub store: GhStore,
    pub clock: SystemClock,
    pub generator: CliGenerator,
}

impl Runtime {
    pub fn new(config: Config) -> Self {
        Self {
            store: GhStore::new(&config.repo, &config.store.gh_cli),
            clock: SystemClock,
            generator: CliGenerator::new(&config.backend, &config.repo),
            config,
        }
    }

    pub fn services<'a>(&'a self, agent: &'a AgentId) -> Services<'a> {
        Services {
            store: &self.store,
            clock: &self.clock,
            generator: &self.generator,
            config: &self.config,
            agent,
        }
    }

    pub fn workspace(&self, agent: &AgentId) -> WorkspaceManager {
        let git = &self.config.git;
        let mut client = Git::new(&git.program);
        if let (Some(name), Some(email)) = (&git.author_name, &git.author_email) {
            client = client.with_author(name, email);
        }
        WorkspaceManager::new(
            client,
            &self.config.remote_url(),
            &self.config.work_dir(),
            &self.config.repo,
            agent.id(),
        )
    }
}
