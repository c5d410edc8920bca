//! lanscope-viewer library crate.
//!
//! The headless observer side of LanScope: it advertises itself on the LAN,
//! accepts framed packets from relays and keeps them in memory.
//!
//! # Architecture
//!
//! ```text
//! Relay (framed JSON packets over TCP)
//!         ↓
//! [lanscope-viewer]
//!   ├── domain/           ViewerConfig, ViewerEvent
//!   ├── application/      PacketStore, event handling
//!   └── infrastructure/
//!         ├── listener/   TCP accept loop, per-connection frame decoding
//!         └── advertiser/ Discovery announcements for the listen port
//! ```
//!
//! # Layer rules
//!
//! - `domain` holds plain types; it only depends on `lanscope-core`.
//! - `application` depends on `domain`; it does no I/O.
//! - `infrastructure` owns sockets and tasks.

/// Domain layer: configuration and listener events.
pub mod domain;

/// Application layer: the packet store.
pub mod application;

/// Infrastructure layer: packet listener and discovery advertiser.
pub mod infrastructure;
