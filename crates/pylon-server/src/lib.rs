//! # pylon-server
//!
//! TCP frontend that hosts Pylon agents.
//!
//! - **Server**: [`server::PylonServer`] accepts connections and gives each one an agent
//! - **Read path**: [`connection::read_loop`] drives the handshake and dispatches messages
//! - **Handlers**: [`handler::MessageHandler`] and the built-in [`handler::EchoHandler`]
//! - **Settings**: defaults, JSON file and `PYLON_*` environment overrides
//! - **Shutdown**: [`shutdown::ShutdownCoordinator`] owns the application die signal and drains connections

#![deny(unsafe_code)]

pub mod connection;
pub mod errors;
pub mod handler;
pub mod logging;
pub mod server;
pub mod settings;
pub mod shutdown;

pub use server::PylonServer;
pub use shutdown::ShutdownCoordinator;
