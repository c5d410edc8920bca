//! Infrastructure layer for lanscope-viewer: sockets and background tasks.

pub mod advertiser;
pub mod listener;

pub use advertiser::{discovery_config, start_advertiser};
pub use listener::{bind_listener, run_listener, ListenerError};
