use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Args;
use tracing::warn;

use super::{Runtime, load_config};
use crate::agent::{LoopOptions, run_loop};
use crate::identity::{AgentId, Role};
use crate::lifecycle::planner::Planner;
use crate::lifecycle::reviewer::Reviewer;
use crate::lifecycle::worker::Implementer;

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Role to run
    #[arg(value_enum)]
    pub role: Role,
    /// Run a single poll cycle and exit
    #[arg(long)]
    pub once: bool,
    /// Instance id override (default: generated, e.g. worker-1a2b3c4d)
    #[arg(long)]
    pub agent: Option<String>,
}

impl RunArgs {
    pub fn execute(&self, config_path: Option<&Path>) -> anyhow::Result<()> {
        let runtime = Runtime::new(load_config(config_path)?);
        let agent = match &self.agent {
            Some(id) => AgentId::new(self.role, id)?,
            None => AgentId::generate(self.role),
        };
        let services = runtime.services(&agent);
        let config = &runtime.config;
        let options = LoopOptions {
            poll_interval: config.poll_interval(),
            backoff: config.backoff(),
            once: self.once,
        };

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)) {
            warn!("could not install interrupt handler: {e}");
        }

        match self.role {
            Role::Implementer => {
                let workspace = runtime.workspace(&agent);
                let mut implementer = Implementer::new(services, &workspace);
                run_loop(&mut implementer, &runtime.clock, options, &shutdown)
            }
            Role::Reviewer => run_loop(&mut Reviewer::new(services), &runtime.clock, options, &shutdown),
            Role::SpecWriter => run_loop(&mut Planner::new(services), &runtime.clock, options, &shutdown),
        }
    }
}
