//! # lanscope-core
//!
//! Shared library for LanScope containing the request tracker, the packet
//! codec, the stream framing layer and the discovery datagram codec.
//!
//! This crate is used by both the relay (embedded in the observed
//! application) and the viewer (the observing peer).  It has zero
//! dependencies on sockets or async runtimes.
//!
//! # Architecture overview
//!
//! LanScope lets a running application stream a live copy of every HTTP
//! request it makes to a viewer on the same LAN.  This crate holds the parts
//! that do not touch the network:
//!
//! - **`domain`** – The [`RequestTracker`], which turns interleaved
//!   networking callbacks (start, response, data, finish) into one coherent
//!   [`InterceptionRecord`] per request.
//!
//! - **`protocol`** – How records travel.  A completed record plus
//!   [`Environment`] metadata becomes a [`RequestPacket`], which is encoded
//!   as self-describing JSON and wrapped in a 4-byte length-prefixed frame.
//!   The `announce` module encodes the small UDP datagrams used for peer
//!   discovery.

pub mod domain;
pub mod protocol;

pub use domain::record::{
    BodyChunk, CapturedRequest, ConnectionHandle, HeaderMap, InterceptionRecord, Origin,
    RecordId, TaskHandle,
};
pub use domain::tracker::{
    AppendOutcome, RequestTracker, TrackerConfig, TrackerError, DEFAULT_MAX_BODY_BYTES,
};
pub use protocol::announce::{
    decode_announcement, encode_announcement, AnnounceError, AnnounceKind, ServiceAnnouncement,
};
pub use protocol::codec::{decode_packet, encode_packet, encode_record, CodecError};
pub use protocol::framing::{encode_frame, FrameDecoder, FrameError, DEFAULT_MAX_FRAME_LEN};
pub use protocol::packet::{
    frame_len_for_body_cap, DeviceDescriptor, Environment, ProjectDescriptor, RequestPacket,
    PACKET_ENVELOPE_ALLOWANCE,
};

/// Version string stamped into every packet as `protocolVersion`.
pub const INTERCEPTOR_VERSION: &str = env!("CARGO_PKG_VERSION");
