//! Domain layer for lanscope-viewer.
//!
//! Plain types with no sockets, tasks or file I/O.

pub mod config;
pub mod events;

pub use config::ViewerConfig;
pub use events::{DisconnectReason, ViewerEvent};
