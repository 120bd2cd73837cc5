//! Session orchestration modules.
//!
//! Covers port allocation, agent-server process supervision, liveness
//! reconciliation, signal files, and lifecycle dispatch over execution
//! mode and transport.

pub mod agent_server;
pub mod lifecycle;
pub mod liveness;
pub mod ports;
pub mod signals;
pub mod supervisor;
