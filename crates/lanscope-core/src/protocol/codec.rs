//! Packet codec: [`RequestPacket`] ⇄ bytes.
//!
//! The payload is UTF-8 JSON with camelCase keys.  Header maps are
//! `BTreeMap`s, so the same packet always encodes to the same bytes.  Bodies
//! are base64 strings, so arbitrary binary content survives the trip.
//!
//! All functions here are pure and safe to call from any thread.

use thiserror::Error;

use crate::domain::record::{InterceptionRecord, RecordId};
use crate::protocol::packet::{Environment, RequestPacket};

/// Errors that can occur while encoding or decoding a packet.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The bytes are not a valid packet (bad JSON, missing field, bad base64,
    /// or a field combination that cannot occur).
    #[error("corrupt packet: {0}")]
    Corrupt(String),

    /// The record has not reached a terminal state yet.
    #[error("record {0} is not completed")]
    NotCompleted(RecordId),

    /// The record completed successfully but never received a response.
    #[error("record {0} completed without response metadata")]
    MissingResponse(RecordId),

    /// Serialization failed.
    #[error("encode failed: {0}")]
    Encode(String),
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a completed record plus environment metadata.
///
/// # Errors
///
/// See [`RequestPacket::from_record`].
pub fn encode_record(record: &InterceptionRecord, env: &Environment) -> Result<Vec<u8>, CodecError> {
    let packet = RequestPacket::from_record(record, env)?;
    encode_packet(&packet)
}

/// Encodes an already-built packet.
pub fn encode_packet(packet: &RequestPacket) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(packet).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Decodes a packet, rejecting anything malformed with
/// [`CodecError::Corrupt`].  Never returns a partially-filled packet.
///
/// # Examples
///
/// ```rust
/// use lanscope_core::{decode_packet, CodecError};
///
/// assert!(matches!(decode_packet(b"not json"), Err(CodecError::Corrupt(_))));
/// ```
pub fn decode_packet(bytes: &[u8]) -> Result<RequestPacket, CodecError> {
    let packet: RequestPacket =
        serde_json::from_slice(bytes).map_err(|e| CodecError::Corrupt(e.to_string()))?;
    packet.validate().map_err(CodecError::Corrupt)?;
    Ok(packet)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
