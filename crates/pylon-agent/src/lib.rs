//! # pylon-agent
//!
//! The per-connection agent of a Pylon server.
//!
//! - **Agent**: [`Agent`] owns one client's transport, its [`pylon_core::session::Session`],
//!   and the outbound pipeline
//! - **Writer**: single task writing framed packets in enqueue order
//! - **Heartbeat**: periodic probes, dead-client detection after two silent intervals
//! - **Handshake**: process-wide handshake response and heartbeat probe, built once
//! - **Transport**: [`transport::Transport`] capability and a stream-backed implementation

#![deny(unsafe_code)]

pub mod agent;
pub mod config;
pub mod handshake;
pub mod heartbeat;
pub mod pending;
pub mod status;
pub mod testutil;
pub mod transport;
pub mod writer;

pub use agent::Agent;
pub use config::AgentConfig;
pub use pylon_core::errors::AgentError;
pub use status::AgentStatus;
