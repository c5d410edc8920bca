//! Discovery datagram codec.
//!
//! Advertisers broadcast a small UDP datagram describing the service they
//! offer; browsers decode it and resolve the peer to the datagram's source
//! IP plus the announced port.
//!
//! Wire format (all integers big-endian):
//! ```text
//! [magic "LSCP":4][version:1][kind:1][port:2][instance_id:16]
//! [service_type_len:2][service_type:N][domain_len:2][domain:N][name_len:2][name:N]
//! ```

use thiserror::Error;
use uuid::Uuid;

/// Leading bytes of every discovery datagram.
pub const ANNOUNCE_MAGIC: [u8; 4] = *b"LSCP";

/// Current datagram version.
pub const ANNOUNCE_VERSION: u8 = 1;

/// Size of the fixed part: magic + version + kind + port + instance id.
pub const ANNOUNCE_HEADER_SIZE: usize = 4 + 1 + 1 + 2 + 16;

/// Errors produced while decoding a discovery datagram.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AnnounceError {
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// Not a LanScope datagram at all (some other service shares the port).
    #[error("bad magic bytes")]
    BadMagic,

    #[error("unsupported announce version: {0}")]
    UnsupportedVersion(u8),

    #[error("unknown announce kind: 0x{0:02X}")]
    UnknownKind(u8),

    #[error("malformed announcement: {0}")]
    Malformed(String),
}

/// Whether the sender is (still) offering the service or withdrawing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AnnounceKind {
    Announce = 0x01,
    Goodbye = 0x02,
}

impl TryFrom<u8> for AnnounceKind {
    type Error = AnnounceError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Announce),
            0x02 => Ok(Self::Goodbye),
            other => Err(AnnounceError::UnknownKind(other)),
        }
    }
}

/// One decoded discovery datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAnnouncement {
    pub kind: AnnounceKind,
    /// Random per-advertiser id, stable across re-announcements.
    pub instance_id: Uuid,
    /// TCP port the advertiser accepts sessions on.
    pub port: u16,
    pub service_type: String,
    pub domain: String,
    pub name: String,
}

/// Encodes an announcement.  Strings longer than 65535 bytes are truncated.
pub fn encode_announcement(announcement: &ServiceAnnouncement) -> Vec<u8> {
    let mut buf = Vec::with_capacity(
        ANNOUNCE_HEADER_SIZE
            + 6
            + announcement.service_type.len()
            + announcement.domain.len()
            + announcement.name.len(),
    );
    buf.extend_from_slice(&ANNOUNCE_MAGIC);
    buf.push(ANNOUNCE_VERSION);
    buf.push(announcement.kind as u8);
    buf.extend_from_slice(&announcement.port.to_be_bytes());
    buf.extend_from_slice(announcement.instance_id.as_bytes());
    write_length_prefixed_string(&mut buf, &announcement.service_type);
    write_length_prefixed_string(&mut buf, &announcement.domain);
    write_length_prefixed_string(&mut buf, &announcement.name);
    buf
}

/// Decodes a datagram produced by [`encode_announcement`].
pub fn decode_announcement(buf: &[u8]) -> Result<ServiceAnnouncement, AnnounceError> {
    if buf.len() < ANNOUNCE_HEADER_SIZE {
        return Err(AnnounceError::InsufficientData {
            needed: ANNOUNCE_HEADER_SIZE,
            available: buf.len(),
        });
    }
    if buf[0..4] != ANNOUNCE_MAGIC {
        return Err(AnnounceError::BadMagic);
    }
    if buf[4] != ANNOUNCE_VERSION {
        return Err(AnnounceError::UnsupportedVersion(buf[4]));
    }
    let kind = AnnounceKind::try_from(buf[5])?;
    let port = u16::from_be_bytes([buf[6], buf[7]]);
    let instance_id = read_uuid(buf, 8)?;

    let (service_type, offset) = read_length_prefixed_string(buf, ANNOUNCE_HEADER_SIZE)?;
    let (domain, offset) = read_length_prefixed_string(buf, offset)?;
    let (name, _) = read_length_prefixed_string(buf, offset)?;

    Ok(ServiceAnnouncement {
        kind,
        instance_id,
        port,
        service_type,
        domain,
        name,
    })
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn read_uuid(buf: &[u8], offset: usize) -> Result<Uuid, AnnounceError> {
    buf.get(offset..offset + 16)
        .and_then(|bytes| <[u8; 16]>::try_from(bytes).ok())
        .map(Uuid::from_bytes)
        .ok_or_else(|| {
            AnnounceError::Malformed(format!(
                "need 16 bytes for UUID at offset {offset}, got {}",
                buf.len().saturating_sub(offset)
            ))
        })
}

/// Writes a 2-byte length prefix followed by the UTF-8 string bytes.
fn write_length_prefixed_string(buf: &mut Vec<u8>, s: &str) {
    let mut len = s.len().min(u16::MAX as usize);
    while !s.is_char_boundary(len) {
        len -= 1;
    }
    buf.extend_from_slice(&(len as u16).to_be_bytes());
    buf.extend_from_slice(&s.as_bytes()[..len]);
}

/// Reads a 2-byte length prefix and then that many UTF-8 bytes.
/// Returns the string and the offset of the byte after the string.
fn read_length_prefixed_string(buf: &[u8], offset: usize) -> Result<(String, usize), AnnounceError> {
    if buf.len() < offset + 2 {
        return Err(AnnounceError::Malformed(format!(
            "need 2 bytes for string length at offset {offset}"
        )));
    }
    let len = u16::from_be_bytes([buf[offset], buf[offset + 1]]) as usize;
    let start = offset + 2;
    if buf.len() < start + len {
        return Err(AnnounceError::Malformed(format!(
            "string of length {len} at offset {start} exceeds buffer"
        )));
    }
    let s = std::str::from_utf8(&buf[start..start + len])
        .map_err(|e| AnnounceError::Malformed(format!("invalid UTF-8: {e}")))?
        .to_string();
    Ok((s, start + len))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
