//! Events reported by the packet listener.

use std::net::SocketAddr;

use lanscope_core::{CodecError, RequestPacket};

/// Why a relay connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The relay closed the stream.
    Closed,
    /// A length header exceeded the limit; the viewer closed the stream.
    Oversized { len: usize, max: usize },
    Io(String),
}

/// What happened on one relay connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewerEvent {
    Connected {
        peer: SocketAddr,
    },
    Packet {
        peer: SocketAddr,
        packet: Box<RequestPacket>,
    },
    /// A complete frame whose payload did not decode.  The connection stays
    /// open.
    Corrupt {
        peer: SocketAddr,
        error: CodecError,
    },
    Disconnected {
        peer: SocketAddr,
        reason: DisconnectReason,
    },
}

impl ViewerEvent {
    pub fn peer(&self) -> SocketAddr {
        match self {
            Self::Connected { peer }
            | Self::Packet { peer, .. }
            | Self::Corrupt { peer, .. }
            | Self::Disconnected { peer, .. } => *peer,
        }
    }
}
