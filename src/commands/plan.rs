use std::io::IsTerminal;
use std::path::Path;

use anyhow::Context;
use clap::Args;

use super::{Runtime, load_config};
use crate::error::ExitError;
use crate::identity::{AgentId, Role};
use crate::lifecycle::planner::Planner;

#[derive(Debug, Args)]
pub struct PlanArgs {
    /// Free-text user story
    pub story: String,
    /// File the ticket without asking for confirmation
    #[arg(long)]
    pub yes: bool,
}

impl PlanArgs {
    pub fn execute(&self, config_path: Option<&Path>) -> anyhow::Result<()> {
        let runtime = Runtime::new(load_config(config_path)?);
        let agent = AgentId::generate(Role::SpecWriter);
        let planner = Planner::new(runtime.services(&agent));

        let draft = planner.draft(&self.story)?;
        println!("# {}\n\n{}", draft.title, draft.body);

        if !self.yes {
            if !std::io::stdin().is_terminal() {
                return Err(ExitError::Other("not a terminal; pass --yes to file without confirming".into()).into());
            }
            let confirmed = dialoguer::Confirm::new()
                .with_prompt(format!("File this as a ticket in {}?", runtime.config.repo))
                .default(true)
                .interact()
                .context("reading user confirmation")?;
            if !confirmed {
                println!("Not filed.");
                return Ok(());
            }
        }

        let number = planner.file(&draft)?;
        println!("Filed #{number}, awaiting spec review.");
        Ok(())
    }
}
