//! HTTP and server-sent-event client for the agent server.
//!
//! The agent server is an external process; this module only speaks its
//! documented endpoints. Every request is scoped to a working directory
//! through the `directory` query parameter.

pub mod client;
pub mod types;

pub use client::AgentApiClient;
pub use types::{SessionActivity, Worktree};
