//! Wire formats: the JSON request packet, the stream framing layer and the
//! UDP discovery datagram.

pub mod announce;
pub mod codec;
pub mod framing;
pub mod packet;

pub use announce::{decode_announcement, encode_announcement, AnnounceError, AnnounceKind, ServiceAnnouncement};
pub use codec::{decode_packet, encode_packet, encode_record, CodecError};
pub use framing::{encode_frame, FrameDecoder, FrameError, DEFAULT_MAX_FRAME_LEN, LENGTH_PREFIX_SIZE};
pub use packet::{
    frame_len_for_body_cap, DeviceDescriptor, Environment, ProjectDescriptor, RequestPacket,
    PACKET_ENVELOPE_ALLOWANCE,
};
