//! Application layer: turning host callbacks into relayed packets.
//!
//! # Sub-modules
//!
//! - **`hooks`** – The [`hooks::HookSink`] boundary plus the two adapters that
//!   translate task-style and delegate-style networking callbacks into sink
//!   calls.  Installing the actual hooks in a host runtime is outside this
//!   crate.
//!
//! - **`relay`** – The [`relay::RelayController`] composition root.  It owns
//!   the tracker, discovery and transport, and pumps completed records from
//!   one to the other.

pub mod hooks;
pub mod relay;
