//! lanscope-relay library entry point.
//!
//! Embed this crate in an application to mirror its HTTP traffic to a
//! LanScope viewer on the local network.
//!
//! ```text
//!  host networking callbacks
//!          │
//!  TaskHookAdapter / DelegateHookAdapter      (application::hooks)
//!          │  HookSink
//!  RelayController ── RequestTracker ── codec  (application::relay)
//!          │
//!  TransportSession ◄── DiscoveryService       (infrastructure)
//!          │
//!        viewer
//! ```
//!
//! The relay never calls back into the host: every failure is logged, counted
//! and absorbed.  Subscriber setup for `tracing` is left to the host.

pub mod application;
pub mod infrastructure;

pub use application::hooks::{
    DelegateHookAdapter, HookEvent, HookSink, TaskHookAdapter, RESTARTED_ERROR,
};
pub use application::relay::{RelayController, RelayError, RelayHandle, RelayStats};
pub use infrastructure::config::{load_config, save_config, ConfigError, RelayConfig};
pub use infrastructure::discovery::{
    DiscoveryConfig, DiscoveryError, DiscoveryEvent, DiscoveryPeer, DiscoveryService,
    DiscoveryState, PeerLiveness, ServiceIdentity,
};
pub use infrastructure::transport::{
    write_frame, ConnectionStatus, PeerKey, SendOutcome, SessionEvent, TransportConfig,
    TransportSession,
};
