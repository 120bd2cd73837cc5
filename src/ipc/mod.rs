//! Control RPC: newline-delimited JSON-RPC 2.0 over local sockets.
//!
//! Each session exposes a [`server::ControlRpcServer`] on
//! `<data_dir>/sockets/<task>.sock`. Clients query state, send control
//! commands, and subscribe to live output and state-change events.

pub mod client;
pub mod codec;
pub mod connection;
pub mod hooks;
pub mod protocol;
pub mod server;
pub mod state;

pub use client::RpcClient;
pub use hooks::{LoopHooks, NoopHooks, SignalFileHooks};
pub use server::ControlRpcServer;
pub use state::{OutputBuffer, RpcSessionState, StateUpdate};
