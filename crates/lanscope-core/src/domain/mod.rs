//! Domain layer: request lifecycle tracking.
//!
//! # Sub-modules
//!
//! - **`record`** – The [`record::InterceptionRecord`] entity and the small
//!   value types around it (ids, origins, captured request, body chunks).
//!
//! - **`tracker`** – The [`tracker::RequestTracker`], which owns every
//!   in-flight record and enforces the start → metadata → body → complete
//!   lifecycle.

pub mod record;
pub mod tracker;
