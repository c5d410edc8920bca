//! Infrastructure layer for the relay.
//!
//! Contains the OS-facing parts: UDP discovery sockets, the TCP transport
//! session and TOML configuration storage.

pub mod config;
pub mod discovery;
pub mod transport;
