//! Record-marking framer and deframer.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use nfsrpc_core::{CodecError, DEFAULT_MAX_RECORD_SIZE, MAX_FRAGMENT_SIZE};

/// Size of a fragment header.
pub const HEADER_LEN: usize = 4;

/// High bit of the header: set on the final fragment of a record.
pub const LAST_FRAGMENT: u32 = 0x8000_0000;

/// Decoded fragment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// This fragment completes the record.
    pub last: bool,
    /// Payload length, excluding the header.
    pub len: u32,
}

impl FragmentHeader {
    /// Split a raw header into flag and length.
    #[inline]
    #[must_use]
    pub const fn from_u32(raw: u32) -> Self {
        Self {
            last: raw & LAST_FRAGMENT != 0,
            len: raw & !LAST_FRAGMENT,
        }
    }

    /// Raw header value. The length is masked to 31 bits.
    #[inline]
    #[must_use]
    pub const fn to_u32(self) -> u32 {
        let len = self.len & !LAST_FRAGMENT;
        if self.last { len | LAST_FRAGMENT } else { len }
    }
}

/// Record-marking codec.
///
/// Encoding wraps a payload in one fragment (or several, when it is longer
/// than the configured fragment size). Decoding reassembles fragments into
/// complete records with headers stripped.
///
/// The decoder keeps the fragments of a record that is still incomplete, so
/// each connection needs its own instance.
///
/// ## Example
///
/// ```rust
/// use bytes::BytesMut;
/// use nfsrpc_codec::RecordCodec;
/// use tokio_util::codec::Decoder;
///
/// let mut codec = RecordCodec::new();
/// let mut buf = BytesMut::new();
///
/// codec.encode_record(b"hello", &mut buf);
/// assert_eq!(&buf[..4], &[0x80, 0, 0, 5]);
///
/// let record = codec.decode(&mut buf).unwrap().unwrap();
/// assert_eq!(record.as_ref(), b"hello");
/// ```
#[derive(Debug)]
pub struct RecordCodec {
    max_record_size: usize,
    max_fragment_size: usize,
    partial: BytesMut,
}

impl RecordCodec {
    /// Create a new codec with default settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_record_size: DEFAULT_MAX_RECORD_SIZE,
            max_fragment_size: MAX_FRAGMENT_SIZE,
            partial: BytesMut::new(),
        }
    }

    /// Set the maximum size of a reassembled record.
    #[inline]
    #[must_use]
    pub fn with_max_record_size(mut self, max_record_size: usize) -> Self {
        self.max_record_size = max_record_size;
        self
    }

    /// Set the largest fragment the encoder emits.
    #[inline]
    #[must_use]
    pub fn with_max_fragment_size(mut self, max_fragment_size: usize) -> Self {
        self.max_fragment_size = max_fragment_size.clamp(1, MAX_FRAGMENT_SIZE);
        self
    }

    /// Get the maximum record size.
    #[inline]
    #[must_use]
    pub fn max_record_size(&self) -> usize {
        self.max_record_size
    }

    /// Bytes of the current record reassembled so far.
    #[inline]
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.partial.len()
    }

    /// Discard any partially reassembled record.
    pub fn reset(&mut self) {
        self.partial.clear();
    }

    /// Frame a payload into `dst`.
    pub fn encode_record(&self, payload: &[u8], dst: &mut BytesMut) {
        if payload.is_empty() {
            dst.put_u32(LAST_FRAGMENT);
            return;
        }

        let fragments = payload.len().div_ceil(self.max_fragment_size);
        dst.reserve(payload.len() + fragments * HEADER_LEN);

        let mut chunks = payload.chunks(self.max_fragment_size).peekable();
        while let Some(chunk) = chunks.next() {
            let header = FragmentHeader {
                last: chunks.peek().is_none(),
                len: chunk.len() as u32,
            };
            dst.put_u32(header.to_u32());
            dst.put_slice(chunk);
        }
    }

    /// Frame a payload into a new buffer.
    #[must_use]
    pub fn frame(&self, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_record(payload, &mut buf);
        buf.freeze()
    }
}

impl Default for RecordCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for RecordCodec {
    type Item = Bytes;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.len() < HEADER_LEN {
                return Ok(None);
            }

            let header = FragmentHeader::from_u32(u32::from_be_bytes([src[0], src[1], src[2], src[3]]));
            let len = header.len as usize;

            let size = self.partial.len() + len;
            if size > self.max_record_size {
                return Err(CodecError::RecordTooLarge {
                    size,
                    max: self.max_record_size,
                });
            }

            // Leave the header in place until the whole fragment is buffered
            let total_len = HEADER_LEN + len;
            if src.len() < total_len {
                src.reserve(total_len - src.len());
                return Ok(None);
            }

            src.advance(HEADER_LEN);
            let fragment = src.split_to(len);

            if !header.last {
                self.partial.extend_from_slice(&fragment);
                continue;
            }

            if self.partial.is_empty() {
                return Ok(Some(fragment.freeze()));
            }

            self.partial.extend_from_slice(&fragment);
            return Ok(Some(self.partial.split().freeze()));
        }
    }
}

impl Encoder<Bytes> for RecordCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encode_record(&item, dst);
        Ok(())
    }
}

impl Encoder<&[u8]> for RecordCodec {
    type Error = CodecError;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encode_record(item, dst);
        Ok(())
    }
}
