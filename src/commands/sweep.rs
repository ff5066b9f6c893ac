use std::path::Path;

use clap::Args;

use super::{Runtime, load_config};
use crate::identity::{AgentId, Role};

#[derive(Debug, Args)]
pub struct SweepArgs {
    /// Role whose in-progress statuses are swept
    #[arg(value_enum)]
    pub role: Role,
}

impl SweepArgs {
    /// One stale-lock sweep, without claiming anything.
    pub fn execute(&self, config_path: Option<&Path>) -> anyhow::Result<()> {
        let runtime = Runtime::new(load_config(config_path)?);
        let agent = AgentId::generate(self.role);
        let recovered = runtime.services(&agent).sweep_stale()?;
        if recovered.is_empty() {
            println!("No stale {} locks.", self.role);
        }
        for r in &recovered {
            println!("#{}: {} -> {} (held {}m)", r.item, r.from, r.to, r.age.num_minutes());
        }
        Ok(())
    }
}
