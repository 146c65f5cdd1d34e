#![forbid(unsafe_code)]

pub mod clock;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod events;
pub mod flash;
pub mod monitor;
pub mod orchestrator;
pub mod registry;
pub mod safety_level;
pub mod sessions;

#[cfg(test)]
mod test_support;

pub use error::OrchestratorError;
pub use orchestrator::{Orchestrator, SessionTicket};
