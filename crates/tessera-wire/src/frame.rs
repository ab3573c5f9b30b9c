//! Length-prefixed record framing.
//!
//! Every record on a peer or client link is framed as:
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────────────────────────┐
//! │   Length     │   Checksum   │            Payload               │
//! │   (4 bytes)  │   (4 bytes)  │         (variable)               │
//! └──────────────┴──────────────┴──────────────────────────────────┘
//! ```
//!
//! - **Length**: big-endian u32 of payload size (excludes header)
//! - **Checksum**: CRC32 of the payload
//! - **Payload**: bincode-serialized record
//!
//! The decoder parses incrementally so it works with partial reads; a
//! checksum or size failure is fatal to the connection.

use std::io::{self, Write};
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Size of the frame header in bytes (length + checksum).
pub const HEADER_SIZE: usize = 8;

/// Default maximum record size (64 MiB — migration batches are large).
pub const DEFAULT_MAX_RECORD_SIZE: u32 = 64 * 1024 * 1024;

/// An empty record is invalid.
const MIN_RECORD_SIZE: u32 = 1;

// ============================================================================
// Errors
// ============================================================================

/// Errors raised by the frame codec.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("record too large: {size} bytes (max {max})")]
    RecordTooLarge { size: u32, max: u32 },

    #[error("checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("deserialization failed: {0}")]
    Deserialize(String),

    #[error("serialization failed: {0}")]
    Serialize(String),

    /// EOF in the middle of a frame.
    #[error("incomplete frame: have {have} bytes, need {need} more")]
    Truncated { have: usize, need: usize },
}

impl FramingError {
    /// True if the connection carrying this stream must be closed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FramingError::ChecksumMismatch { .. }
                | FramingError::RecordTooLarge { .. }
                | FramingError::Deserialize(_)
                | FramingError::Truncated { .. }
        )
    }
}

// ============================================================================
// Encoder
// ============================================================================

/// Encodes records of type `T` into framed bytes.
#[derive(Debug, Clone)]
pub struct FrameEncoder<T> {
    max_size: u32,
    _marker: PhantomData<fn(&T)>,
}

impl<T: Serialize> Default for FrameEncoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Serialize> FrameEncoder<T> {
    pub fn new() -> Self {
        Self {
            max_size: DEFAULT_MAX_RECORD_SIZE,
            _marker: PhantomData,
        }
    }

    pub fn with_max_size(max_size: u32) -> Self {
        debug_assert!(max_size >= MIN_RECORD_SIZE);
        Self {
            max_size,
            _marker: PhantomData,
        }
    }

    /// Encodes one record, returning header + payload bytes.
    pub fn encode(&self, record: &T) -> Result<Vec<u8>, FramingError> {
        let payload =
            bincode::serialize(record).map_err(|e| FramingError::Serialize(e.to_string()))?;

        if payload.len() > self.max_size as usize {
            return Err(FramingError::RecordTooLarge {
                size: payload.len() as u32,
                max: self.max_size,
            });
        }

        let checksum = crc32fast::hash(&payload);
        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&checksum.to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Encodes and writes one record.
    pub fn encode_to<W: Write>(&self, record: &T, writer: &mut W) -> Result<(), FramingError> {
        let frame = self.encode(record)?;
        writer.write_all(&frame)?;
        Ok(())
    }
}

// ============================================================================
// Decoder
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderState {
    ReadingHeader,
    ReadingPayload { length: u32, checksum: u32 },
}

/// Incrementally decodes framed records of type `T`.
///
/// Feed bytes with [`Self::extend`], then call [`Self::decode`] until it
/// returns `Ok(None)`.
#[derive(Debug)]
pub struct FrameDecoder<T> {
    max_size: u32,
    buffer: Vec<u8>,
    state: DecoderState,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Default for FrameDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> FrameDecoder<T> {
    pub fn new() -> Self {
        Self {
            max_size: DEFAULT_MAX_RECORD_SIZE,
            buffer: Vec::with_capacity(4096),
            state: DecoderState::ReadingHeader,
            _marker: PhantomData,
        }
    }

    pub fn with_max_size(max_size: u32) -> Self {
        debug_assert!(max_size >= MIN_RECORD_SIZE);
        Self {
            max_size,
            buffer: Vec::with_capacity(4096),
            state: DecoderState::ReadingHeader,
            _marker: PhantomData,
        }
    }

    /// Appends raw bytes from the transport.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes still needed to complete the current frame.
    pub fn bytes_needed(&self) -> usize {
        match self.state {
            DecoderState::ReadingHeader => HEADER_SIZE.saturating_sub(self.buffer.len()),
            DecoderState::ReadingPayload { length, .. } => {
                (HEADER_SIZE + length as usize).saturating_sub(self.buffer.len())
            }
        }
    }

    /// Attempts to decode one record.
    ///
    /// Returns `Ok(Some(record))` when a complete record was consumed,
    /// `Ok(None)` when more bytes are needed.
    pub fn decode(&mut self) -> Result<Option<T>, FramingError> {
        loop {
            match self.state {
                DecoderState::ReadingHeader => {
                    if self.buffer.len() < HEADER_SIZE {
                        return Ok(None);
                    }
                    let length = u32::from_be_bytes(
                        self.buffer[0..4].try_into().expect("4 bytes"),
                    );
                    let checksum = u32::from_be_bytes(
                        self.buffer[4..8].try_into().expect("4 bytes"),
                    );

                    if length > self.max_size {
                        return Err(FramingError::RecordTooLarge {
                            size: length,
                            max: self.max_size,
                        });
                    }
                    if length < MIN_RECORD_SIZE {
                        return Err(FramingError::Deserialize(
                            "empty record is invalid".to_string(),
                        ));
                    }
                    self.state = DecoderState::ReadingPayload { length, checksum };
                }

                DecoderState::ReadingPayload { length, checksum } => {
                    let total = HEADER_SIZE + length as usize;
                    if self.buffer.len() < total {
                        return Ok(None);
                    }

                    let payload = &self.buffer[HEADER_SIZE..total];
                    let actual = crc32fast::hash(payload);
                    if actual != checksum {
                        return Err(FramingError::ChecksumMismatch {
                            expected: checksum,
                            actual,
                        });
                    }

                    let record: T = bincode::deserialize(payload)
                        .map_err(|e| FramingError::Deserialize(e.to_string()))?;

                    self.buffer.drain(..total);
                    self.state = DecoderState::ReadingHeader;
                    return Ok(Some(record));
                }
            }
        }
    }

    /// Signals EOF from the transport; buffered partial frames become an
    /// error.
    pub fn finish(&self) -> Result<(), FramingError> {
        if self.buffer.is_empty() && self.state == DecoderState::ReadingHeader {
            Ok(())
        } else {
            Err(FramingError::Truncated {
                have: self.buffer.len(),
                need: self.bytes_needed(),
            })
        }
    }

    /// Discards buffered bytes and resets the state machine.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = DecoderState::ReadingHeader;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use tessera_types::TxnId;

    fn codec() -> (FrameEncoder<Message>, FrameDecoder<Message>) {
        (FrameEncoder::new(), FrameDecoder::new())
    }

    #[test]
    fn encode_decode_roundtrip() {
        let (encoder, mut decoder) = codec();
        let original = Message::TxnLocallyComplete(TxnId::ZERO);
        let encoded = encoder.encode(&original).expect("encode");
        assert!(encoded.len() > HEADER_SIZE);

        decoder.extend(&encoded);
        let decoded = decoder.decode().expect("decode").expect("complete");
        assert_eq!(decoded, original);
        assert!(decoder.decode().expect("decode").is_none());
    }

    #[test]
    fn multiple_records_in_one_buffer() {
        let (encoder, mut decoder) = codec();
        let records = vec![
            Message::Heartbeat,
            Message::Flushed,
            Message::ConnectionError("gone".into()),
        ];

        let mut bytes = Vec::new();
        for r in &records {
            bytes.extend(encoder.encode(r).expect("encode"));
        }
        decoder.extend(&bytes);

        for r in &records {
            assert_eq!(&decoder.decode().expect("decode").expect("complete"), r);
        }
        assert!(decoder.decode().expect("decode").is_none());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn byte_at_a_time() {
        let (encoder, mut decoder) = codec();
        let original = Message::Heartbeat;
        let encoded = encoder.encode(&original).expect("encode");

        for (i, &b) in encoded.iter().enumerate() {
            decoder.extend(&[b]);
            let result = decoder.decode().expect("decode");
            if i < encoded.len() - 1 {
                assert!(result.is_none());
            } else {
                assert_eq!(result, Some(Message::Heartbeat));
            }
        }
    }

    #[test]
    fn corrupt_payload_is_fatal() {
        let (encoder, mut decoder) = codec();
        let mut encoded = encoder.encode(&Message::Heartbeat).expect("encode");
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;

        decoder.extend(&encoded);
        let err = decoder.decode().expect_err("corrupted");
        assert!(matches!(err, FramingError::ChecksumMismatch { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn oversized_record_rejected_both_ways() {
        let encoder: FrameEncoder<Message> = FrameEncoder::with_max_size(4);
        let err = encoder
            .encode(&Message::ConnectionError("way too long".into()))
            .expect_err("too large");
        assert!(matches!(err, FramingError::RecordTooLarge { .. }));

        // A frame claiming an oversized payload is rejected at the header.
        let mut decoder: FrameDecoder<Message> = FrameDecoder::with_max_size(4);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&100u32.to_be_bytes());
        bytes.extend_from_slice(&0u32.to_be_bytes());
        decoder.extend(&bytes);
        assert!(matches!(
            decoder.decode(),
            Err(FramingError::RecordTooLarge { .. })
        ));
    }

    #[test]
    fn finish_flags_partial_frames() {
        let (encoder, mut decoder) = codec();
        let encoded = encoder.encode(&Message::Heartbeat).expect("encode");

        decoder.extend(&encoded[..HEADER_SIZE + 1]);
        assert!(decoder.decode().expect("decode").is_none());
        assert!(matches!(
            decoder.finish(),
            Err(FramingError::Truncated { .. })
        ));

        decoder.reset();
        assert!(decoder.finish().is_ok());
    }

    #[test]
    fn frame_layout() {
        let (encoder, _) = codec();
        let encoded = encoder.encode(&Message::Flushed).expect("encode");
        let length = u32::from_be_bytes(encoded[0..4].try_into().unwrap());
        let checksum = u32::from_be_bytes(encoded[4..8].try_into().unwrap());
        assert_eq!(length as usize, encoded.len() - HEADER_SIZE);
        assert_eq!(checksum, crc32fast::hash(&encoded[HEADER_SIZE..]));
    }
}
