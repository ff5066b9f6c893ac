//! Relay - lock-coordinated spec-writer, implementer, and reviewer agents
//! sharing one issue tracker

pub mod agent;
pub mod backend;
pub mod clock;
pub mod commands;
pub mod config;
pub mod error;
pub mod git;
pub mod identity;
pub mod lifecycle;
pub mod lock;
pub mod markers;
pub mod status;
pub mod store;
pub mod subprocess;
pub mod telemetry;
pub mod template;
pub mod verdict;
pub mod workspace;
