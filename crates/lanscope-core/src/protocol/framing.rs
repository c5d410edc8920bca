//! Length-prefixed framing for a byte stream.
//!
//! ```text
//! [length: u32 big-endian][payload: length bytes]
//! ```
//!
//! TCP has no message boundaries, so a reader may see half a header, three
//! frames at once, or anything in between.  [`FrameDecoder`] buffers whatever
//! arrives and hands out complete payloads one at a time.

use thiserror::Error;

/// Size of the length header in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Largest payload accepted by default: 32 MiB.  Fits a packet whose request
/// and response bodies are both at the default body cap.
pub const DEFAULT_MAX_FRAME_LEN: usize = 32 * 1024 * 1024;

/// Framing errors.  Both sides treat them as unrecoverable for the stream.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// A payload (outgoing) or a length header (incoming) exceeds the limit.
    #[error("frame of {len} bytes exceeds the {max}-byte limit")]
    Oversized { len: usize, max: usize },
}

/// Wraps `payload` in a length header.
///
/// # Errors
///
/// Returns [`FrameError::Oversized`] if `payload` is longer than `max_len`
/// or does not fit in a `u32`.
pub fn encode_frame(payload: &[u8], max_len: usize) -> Result<Vec<u8>, FrameError> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len as usize <= max_len)
        .ok_or(FrameError::Oversized {
            len: payload.len(),
            max: max_len,
        })?;
    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Incremental frame reassembler.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_len: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_len,
        }
    }

    /// Appends bytes read from the stream.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Returns the next complete payload, or `None` if more bytes are needed.
    ///
    /// # Errors
    ///
    /// [`FrameError::Oversized`] as soon as a header announces a payload above
    /// the limit, before any of that payload is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        if self.buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > self.max_frame_len {
            return Err(FrameError::Oversized {
                len,
                max: self.max_frame_len,
            });
        }
        let total = LENGTH_PREFIX_SIZE + len;
        if self.buf.len() < total {
            return Ok(None);
        }
        let payload = self.buf[LENGTH_PREFIX_SIZE..total].to_vec();
        self.buf.drain(..total);
        Ok(Some(payload))
    }

    /// Bytes currently buffered but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_frame_prefixes_big_endian_length() {
        let frame = encode_frame(b"abc", 16).unwrap();

        assert_eq!(frame, vec![0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn test_encode_frame_rejects_oversized_payload() {
        let result = encode_frame(&[0u8; 17], 16);

        assert_eq!(result, Err(FrameError::Oversized { len: 17, max: 16 }));
    }

    #[test]
    fn test_empty_payload_is_a_valid_frame() {
        let mut decoder = FrameDecoder::default();
        decoder.push(&encode_frame(&[], 16).unwrap());

        assert_eq!(decoder.next_frame().unwrap(), Some(Vec::new()));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_partial_header_waits_for_more_bytes() {
        // Arrange
        let mut decoder = FrameDecoder::default();
        let frame = encode_frame(b"hello", 1024).unwrap();

        // Act / Assert
        decoder.push(&frame[..2]);
        assert_eq!(decoder.next_frame().unwrap(), None);
        decoder.push(&frame[2..6]);
        assert_eq!(decoder.next_frame().unwrap(), None);
        decoder.push(&frame[6..]);
        assert_eq!(decoder.next_frame().unwrap(), Some(b"hello".to_vec()));
    }

    #[test]
    fn test_oversized_header_is_rejected_before_payload_arrives() {
        let mut decoder = FrameDecoder::new(8);
        decoder.push(&1000u32.to_be_bytes());

        assert_eq!(
            decoder.next_frame(),
            Err(FrameError::Oversized { len: 1000, max: 8 })
        );
    }

    #[test]
    fn test_back_to_back_frames_in_one_push() {
        let mut decoder = FrameDecoder::default();
        let mut bytes = encode_frame(b"one", 64).unwrap();
        bytes.extend(encode_frame(b"two", 64).unwrap());

        decoder.push(&bytes);

        assert_eq!(decoder.next_frame().unwrap(), Some(b"one".to_vec()));
        assert_eq!(decoder.next_frame().unwrap(), Some(b"two".to_vec()));
        assert_eq!(decoder.next_frame().unwrap(), None);
    }

    proptest! {
        /// N frames written back to back come out as the same N payloads no
        /// matter where the stream is cut.
        #[test]
        fn prop_framing_survives_arbitrary_fragmentation(
            payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..256), 0..16),
            cuts in prop::collection::vec(1usize..64, 1..64),
        ) {
            let mut stream = Vec::new();
            for payload in &payloads {
                stream.extend(encode_frame(payload, DEFAULT_MAX_FRAME_LEN).unwrap());
            }

            let mut decoder = FrameDecoder::default();
            let mut decoded = Vec::new();
            let mut offset = 0;
            let mut cut = cuts.iter().cycle();
            while offset < stream.len() {
                let step = (*cut.next().unwrap()).min(stream.len() - offset);
                decoder.push(&stream[offset..offset + step]);
                offset += step;
                while let Some(frame) = decoder.next_frame().unwrap() {
                    decoded.push(frame);
                }
            }

            prop_assert_eq!(decoded, payloads);
            prop_assert_eq!(decoder.buffered(), 0);
        }
    }
}
