#![forbid(unsafe_code)]

//! Agent loop session daemon library.
//!
//! Shared by the `agent-loopd` daemon and the `agent-loopctl` CLI.

pub mod agent_api;
pub mod config;
pub mod daemon;
pub mod errors;
pub mod ipc;
pub mod models;
pub mod multiplexer;
pub mod orchestrator;
pub mod overlay;
pub mod persistence;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
