//! # pylon-core
//!
//! Wire-level building blocks shared by the Pylon crates.
//!
//! - **Errors**: [`errors::AgentError`] returned by every network entity
//! - **Branded IDs**: [`ids::AgentId`] as a newtype for type safety
//! - **Packets**: [`packet::PacketCodec`] framing (handshake, heartbeat, data, kick)
//! - **Messages**: [`message::Message`] envelope with route compression via [`message::RouteDictionary`]
//! - **Serialization**: [`serialize::Serializer`] capability and the [`serialize::Payload`] it consumes
//! - **Sessions**: [`session::Session`] identity, data and close callbacks
//! - **Logging**: in-memory capture of `tracing` events for tests

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod logging;
pub mod message;
pub mod packet;
pub mod serialize;
pub mod session;
