//! Message framing.
//!
//! A frame on the wire is an outer record
//!
//! ```text
//! u8      random_prefix_len
//! u8[..]  random prefix
//! u16     ciphertext_len          (excluding the tag)
//! u8[12]  nonce
//! u8[..]  ciphertext
//! u8[16]  auth_tag
//! ```
//!
//! whose ciphertext decrypts to the inner plaintext
//!
//! ```text
//! u8   frame_type
//! u8   flags                      (bit 0 Compressed, bit 1 HasExtenderTag, bit 2 RandomPadded)
//! u64  timestamp_nanos
//! u32  payload_len
//! [u8[16] extender identity]      (if HasExtenderTag)
//! [u32    uncompressed_len]       (if Compressed)
//! u8[payload_len] payload
//! u8[..] random padding           (if RandomPadded)
//! ```
//!
//! All multi-byte integers are big-endian. The random prefix and trailing
//! padding sizes vary per frame to frustrate length fingerprinting.
//!
//! Handshake traffic, which runs before keys exist, uses bare
//! `u16 len ‖ bytes` records through the same [`RecordBuffer`].

use aegis_crypto::algorithms::CompressionAlgorithm;
use crate::compress;
use crate::error::{Error, Result};
use crate::uuid::Uuid;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Largest ciphertext one record can carry (excluding the tag)
pub const MAX_CIPHERTEXT_SIZE: usize = u16::MAX as usize;

/// Fixed part of the inner header
const INNER_HEADER_SIZE: usize = 1 + 1 + 8 + 4;

/// Largest accepted uncompressed payload
pub const MAX_PAYLOAD_SIZE: usize = MAX_CIPHERTEXT_SIZE - INNER_HEADER_SIZE - 16 - 4;

/// Payloads below this are not worth compressing
const COMPRESSION_THRESHOLD: usize = 128;

/// AEAD tag size on the wire
const TAG_SIZE: usize = 16;

/// Nonce size on the wire
const NONCE_SIZE: usize = 12;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Extender payload
    Data = 0x01,
    /// Rekey exchange message
    Rekey = 0x02,
    /// Liveness probe / noise
    Ping = 0x03,
    /// Response to Ping
    Pong = 0x04,
    /// Running-extender set update
    ExtenderUpdate = 0x05,
    /// Graceful close
    Shutdown = 0x06,
    /// Opaque relayed payload
    RelayData = 0x07,
    /// Relay link management
    RelayControl = 0x08,
}

impl TryFrom<u8> for FrameType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Data),
            0x02 => Ok(Self::Rekey),
            0x03 => Ok(Self::Ping),
            0x04 => Ok(Self::Pong),
            0x05 => Ok(Self::ExtenderUpdate),
            0x06 => Ok(Self::Shutdown),
            0x07 => Ok(Self::RelayData),
            0x08 => Ok(Self::RelayControl),
            _ => Err(Error::failed("unknown frame type")),
        }
    }
}

/// Frame flags bitmap
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Payload is compressed
    pub const COMPRESSED: u8 = 0b0000_0001;
    /// Header carries an extender identity
    pub const HAS_EXTENDER_TAG: u8 = 0b0000_0010;
    /// Plaintext carries trailing random padding
    pub const RANDOM_PADDED: u8 = 0b0000_0100;

    /// Raw byte value
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self.0
    }

    /// Whether the compressed bit is set
    #[must_use]
    pub fn is_compressed(self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }

    /// Whether an extender identity is present
    #[must_use]
    pub fn has_extender_tag(self) -> bool {
        self.0 & Self::HAS_EXTENDER_TAG != 0
    }

    /// Whether trailing padding is present
    #[must_use]
    pub fn is_random_padded(self) -> bool {
        self.0 & Self::RANDOM_PADDED != 0
    }
}

/// One decoded protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Creation time, nanoseconds since the Unix epoch
    pub timestamp_nanos: u64,
    /// Extender the payload is addressed to
    pub extender: Option<Uuid>,
    /// Payload bytes
    pub payload: Vec<u8>,
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}

impl Frame {
    /// Create a frame stamped with the current time
    #[must_use]
    pub fn new(frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self {
            frame_type,
            timestamp_nanos: now_nanos(),
            extender: None,
            payload,
        }
    }

    /// Create a data frame addressed to an extender
    #[must_use]
    pub fn for_extender(extender: Uuid, payload: Vec<u8>) -> Self {
        Self {
            frame_type: FrameType::Data,
            timestamp_nanos: now_nanos(),
            extender: Some(extender),
            payload,
        }
    }

    /// |frame timestamp − local clock|
    #[must_use]
    pub fn age(&self) -> Duration {
        let now = now_nanos();
        Duration::from_nanos(now.abs_diff(self.timestamp_nanos))
    }
}

/// Per-connection framing parameters
#[derive(Debug, Clone)]
pub struct FrameCodec {
    /// Negotiated compression
    pub compression: CompressionAlgorithm,
    /// Minimum random prefix per record
    pub min_prefix: usize,
    /// Maximum random prefix per record (≤ 255)
    pub max_prefix: usize,
    /// Minimum trailing padding per frame
    pub min_padding: usize,
    /// Maximum trailing padding per frame
    pub max_padding: usize,
}

impl FrameCodec {
    /// Codec with no compression and no randomization, for tests and
    /// handshake internals
    #[must_use]
    pub fn plain() -> Self {
        Self {
            compression: CompressionAlgorithm::None,
            min_prefix: 0,
            max_prefix: 0,
            min_padding: 0,
            max_padding: 0,
        }
    }

    /// Serialize a frame into inner plaintext bytes.
    ///
    /// Compression is applied when negotiated and it actually shrinks the
    /// payload; trailing random padding is drawn from the configured range.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for oversized payloads.
    pub fn encode_plaintext(&self, frame: &Frame) -> Result<Vec<u8>> {
        if frame.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::invalid_argument("frame payload too large"));
        }

        let mut flags = 0u8;
        let mut payload = None;
        let mut uncompressed_len = None;

        if frame.payload.len() >= COMPRESSION_THRESHOLD {
            if let Some(codec) = compress::codec(self.compression) {
                let compressed = codec.compress(&frame.payload)?;
                if compressed.len() < frame.payload.len() {
                    flags |= FrameFlags::COMPRESSED;
                    uncompressed_len = Some(frame.payload.len() as u32);
                    payload = Some(compressed);
                }
            }
        }
        let payload = payload.as_deref().unwrap_or(&frame.payload);

        if frame.extender.is_some() {
            flags |= FrameFlags::HAS_EXTENDER_TAG;
        }
        let padding_len = aegis_crypto::random::range(self.min_padding, self.max_padding);
        if padding_len > 0 {
            flags |= FrameFlags::RANDOM_PADDED;
        }

        let mut out = Vec::with_capacity(INNER_HEADER_SIZE + 20 + payload.len() + padding_len);
        out.push(frame.frame_type as u8);
        out.push(flags);
        out.extend_from_slice(&frame.timestamp_nanos.to_be_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        if let Some(uuid) = &frame.extender {
            out.extend_from_slice(uuid.as_bytes());
        }
        if let Some(len) = uncompressed_len {
            out.extend_from_slice(&len.to_be_bytes());
        }
        out.extend_from_slice(payload);
        if padding_len > 0 {
            out.extend(aegis_crypto::random::bytes(padding_len));
        }

        if out.len() + TAG_SIZE > MAX_CIPHERTEXT_SIZE + TAG_SIZE {
            return Err(Error::invalid_argument("frame too large after padding"));
        }
        Ok(out)
    }

    /// Parse inner plaintext bytes back into a frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Failed`] for malformed headers, truncated payloads,
    /// oversized length declarations or decompression failures.
    pub fn decode_plaintext(&self, data: &[u8]) -> Result<Frame> {
        if data.len() < INNER_HEADER_SIZE {
            return Err(Error::failed("frame header truncated"));
        }

        let frame_type = FrameType::try_from(data[0])?;
        let flags = FrameFlags(data[1]);
        let timestamp_nanos = u64::from_be_bytes(data[2..10].try_into().expect("slice length"));
        let payload_len =
            u32::from_be_bytes(data[10..14].try_into().expect("slice length")) as usize;

        let mut offset = INNER_HEADER_SIZE;

        let extender = if flags.has_extender_tag() {
            let bytes: [u8; 16] = data
                .get(offset..offset + 16)
                .ok_or(Error::failed("frame extender tag truncated"))?
                .try_into()
                .expect("slice length");
            offset += 16;
            Some(Uuid::from_bytes(bytes))
        } else {
            None
        };

        let uncompressed_len = if flags.is_compressed() {
            let bytes: [u8; 4] = data
                .get(offset..offset + 4)
                .ok_or(Error::failed("frame length field truncated"))?
                .try_into()
                .expect("slice length");
            offset += 4;
            Some(u32::from_be_bytes(bytes) as usize)
        } else {
            None
        };

        let payload = data
            .get(offset..offset + payload_len)
            .ok_or(Error::failed("frame payload truncated"))?;
        // Anything after the payload is padding and is discarded

        let payload = match uncompressed_len {
            Some(len) => {
                if len > MAX_PAYLOAD_SIZE {
                    return Err(Error::failed("uncompressed length exceeds limit"));
                }
                let codec = compress::codec(self.compression)
                    .ok_or(Error::failed("compressed frame without negotiated codec"))?;
                codec.decompress(payload, len)?
            }
            None => payload.to_vec(),
        };

        Ok(Frame {
            frame_type,
            timestamp_nanos,
            extender,
            payload,
        })
    }

    /// Wrap sealed bytes into a full outer wire record with a fresh random
    /// prefix.
    ///
    /// `ciphertext` must be AEAD output with the 16-byte tag appended.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when the ciphertext exceeds the
    /// record limit.
    pub fn wrap_record(&self, nonce: &[u8; 12], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let body_len = ciphertext
            .len()
            .checked_sub(TAG_SIZE)
            .ok_or(Error::invalid_argument("ciphertext shorter than tag"))?;
        if body_len > MAX_CIPHERTEXT_SIZE {
            return Err(Error::invalid_argument("record ciphertext too large"));
        }

        let prefix_len = aegis_crypto::random::range(self.min_prefix, self.max_prefix.min(255));
        let mut out = Vec::with_capacity(1 + prefix_len + 2 + NONCE_SIZE + ciphertext.len());
        out.push(prefix_len as u8);
        if prefix_len > 0 {
            out.extend(aegis_crypto::random::bytes(prefix_len));
        }
        out.extend_from_slice(&(body_len as u16).to_be_bytes());
        out.extend_from_slice(nonce);
        out.extend_from_slice(ciphertext);
        Ok(out)
    }
}

/// One parsed outer record awaiting decryption
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireRecord {
    /// Record nonce
    pub nonce: [u8; 12],
    /// Ciphertext with the tag appended
    pub ciphertext: Vec<u8>,
}

/// Incremental parser over a transport byte stream.
///
/// Feed received chunks in with [`RecordBuffer::extend`]; complete records
/// come out of [`RecordBuffer::next_record`] (sealed outer records) or
/// [`RecordBuffer::next_plain_record`] (length-delimited handshake records).
#[derive(Debug, Default)]
pub struct RecordBuffer {
    buf: Vec<u8>,
}

/// Serialize a plain handshake record (`u16 len ‖ bytes`)
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] for oversized bodies.
pub fn encode_plain_record(body: &[u8]) -> Result<Vec<u8>> {
    if body.len() > u16::MAX as usize {
        return Err(Error::invalid_argument("handshake record too large"));
    }
    let mut out = Vec::with_capacity(2 + body.len());
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

impl RecordBuffer {
    /// Create an empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes currently buffered
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when nothing is buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Extract the next complete sealed record, if one is buffered
    ///
    /// # Errors
    ///
    /// This parser cannot fail on well-formed input; the error type is for
    /// future use by bounds checks.
    pub fn next_record(&mut self) -> Result<Option<WireRecord>> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        let prefix_len = self.buf[0] as usize;
        let len_offset = 1 + prefix_len;
        if self.buf.len() < len_offset + 2 {
            return Ok(None);
        }
        let body_len = u16::from_be_bytes(
            self.buf[len_offset..len_offset + 2]
                .try_into()
                .expect("slice length"),
        ) as usize;
        let total = len_offset + 2 + NONCE_SIZE + body_len + TAG_SIZE;
        if self.buf.len() < total {
            return Ok(None);
        }

        let nonce: [u8; 12] = self.buf[len_offset + 2..len_offset + 2 + NONCE_SIZE]
            .try_into()
            .expect("slice length");
        let ciphertext = self.buf[len_offset + 2 + NONCE_SIZE..total].to_vec();
        self.buf.drain(..total);

        Ok(Some(WireRecord { nonce, ciphertext }))
    }

    /// Extract the next complete plain handshake record, if one is buffered
    #[must_use]
    pub fn next_plain_record(&mut self) -> Option<Vec<u8>> {
        if self.buf.len() < 2 {
            return None;
        }
        let len = u16::from_be_bytes(self.buf[0..2].try_into().expect("slice length")) as usize;
        if self.buf.len() < 2 + len {
            return None;
        }
        let body = self.buf[2..2 + len].to_vec();
        self.buf.drain(..2 + len);
        Some(body)
    }
}
