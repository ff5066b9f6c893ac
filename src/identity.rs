use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::status::Status;

/// The three cooperating agent roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    SpecWriter,
    Implementer,
    Reviewer,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SpecWriter => "spec-writer",
            Self::Implementer => "implementer",
            Self::Reviewer => "reviewer",
        }
    }

    /// In-progress statuses this role takes locks into, and therefore sweeps for staleness.
    pub const fn held_statuses(self) -> &'static [Status] {
        match self {
            Self::SpecWriter => &[Status::SpecReviewing],
            Self::Implementer => &[Status::Implementing],
            Self::Reviewer => &[Status::InReview],
        }
    }

    const fn short(self) -> &'static str {
        match self {
            Self::SpecWriter => "spec",
            Self::Implementer => "worker",
            Self::Reviewer => "reviewer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spec-writer" => Ok(Self::SpecWriter),
            "implementer" => Ok(Self::Implementer),
            "reviewer" => Ok(Self::Reviewer),
            other => anyhow::bail!("unknown role {other:?}"),
        }
    }
}

/// A running agent: its role plus an instance id unique to this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentId {
    role: Role,
    id: String,
}

impl AgentId {
    /// Fresh identity for a new process, e.g. `worker-1a2b3c4d`.
    pub fn generate(role: Role) -> Self {
        let suffix: u32 = rand::random();
        Self {
            role,
            id: format!("{}-{suffix:08x}", role.short()),
        }
    }

    /// Use an explicit instance id (from `--agent` or tests).
    pub fn new(role: Role, id: &str) -> anyhow::Result<Self> {
        validate_id(id)?;
        Ok(Self {
            role,
            id: id.to_string(),
        })
    }

    pub const fn role(&self) -> Role {
        self.role
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Agent ids end up inside `ACK:<role>:<id>:<ms>` and in mirror directory names.
fn validate_id(id: &str) -> anyhow::Result<()> {
    if id.is_empty()
        || id.len() > 64
        || id.starts_with('-')
        || !id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        anyhow::bail!("invalid agent id {id:?}: must match [A-Za-z0-9_-]+, max 64 chars");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_carry_role_prefix() {
        let agent = AgentId::generate(Role::Implementer);
        assert!(agent.id().starts_with("worker-"));
        assert_eq!(agent.id().len(), "worker-".len() + 8);
        assert_eq!(agent.role(), Role::Implementer);
    }

    #[test]
    fn generated_ids_differ_between_processes() {
        let a = AgentId::generate(Role::Reviewer);
        let b = AgentId::generate(Role::Reviewer);
        assert_ne!(a, b);
    }

    #[test]
    fn explicit_ids_are_validated() {
        assert!(AgentId::new(Role::Implementer, "w-1").is_ok());
        assert!(AgentId::new(Role::Implementer, "").is_err());
        assert!(AgentId::new(Role::Implementer, "a:b").is_err());
        assert!(AgentId::new(Role::Implementer, "-w").is_err());
        assert!(AgentId::new(Role::Implementer, "has space").is_err());
    }

    #[test]
    fn roles_parse_from_their_names() {
        for role in [Role::SpecWriter, Role::Implementer, Role::Reviewer] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("planner".parse::<Role>().is_err());
    }
}
