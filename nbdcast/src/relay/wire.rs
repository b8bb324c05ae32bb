//! Byte stream format seen by relay consumers.
//!
//! ```text
//! +----------------+                       once, before any write
//! | size: u64 LE   |
//! +----------------+----------------+----------------------+
//! | offset: u64 LE | length: u64 LE | payload: length bytes |   per write
//! +----------------+----------------+----------------------+
//! ```
//!
//! The end marker is out of band: the stream simply ends.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::WriteNotification;
use crate::types::MAX_BLOCK_SIZE;

/// Length of the stream header.
pub const HEADER_LEN: usize = 8;

/// Length of the offset and length fields preceding each payload.
pub const PREFIX_LEN: usize = 16;

/// Encode the stream header announcing the export size.
#[inline]
pub fn encode_header(size_bytes: u64) -> [u8; HEADER_LEN] {
    size_bytes.to_le_bytes()
}

impl WriteNotification {
    /// Encode the offset and length fields.
    pub fn encode_prefix(&self) -> [u8; PREFIX_LEN] {
        let mut buf = [0u8; PREFIX_LEN];
        buf[0..8].copy_from_slice(&self.offset.to_le_bytes());
        buf[8..16].copy_from_slice(&self.length().to_le_bytes());
        buf
    }

    /// Append the full wire encoding to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(PREFIX_LEN + self.payload.len());
        dst.put_u64_le(self.offset);
        dst.put_u64_le(self.length());
        dst.put_slice(&self.payload);
    }
}

/// Incremental decoder for the consumer byte stream.
///
/// Feed arbitrary chunks with [`extend`](Self::extend) and pull complete
/// notifications with [`next_notification`](Self::next_notification).
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buf: BytesMut,
    size_bytes: Option<u64>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Export size from the header, once it has been decoded.
    pub fn size_bytes(&self) -> Option<u64> {
        self.size_bytes
    }

    /// Number of buffered bytes not yet decoded.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Decode the next complete notification.
    ///
    /// Returns `Ok(None)` if more input is needed. Rejects payloads larger
    /// than the maximum block size to bound allocation.
    pub fn next_notification(&mut self) -> io::Result<Option<WriteNotification>> {
        if self.size_bytes.is_none() {
            if self.buf.len() < HEADER_LEN {
                return Ok(None);
            }
            self.size_bytes = Some(self.buf.get_u64_le());
        }

        if self.buf.len() < PREFIX_LEN {
            return Ok(None);
        }

        let mut prefix = &self.buf[..PREFIX_LEN];
        let offset = prefix.get_u64_le();
        let length = prefix.get_u64_le();
        if length > MAX_BLOCK_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("payload length {length} exceeds maximum {MAX_BLOCK_SIZE}"),
            ));
        }

        let length = length as usize;
        if self.buf.len() < PREFIX_LEN + length {
            self.buf.reserve(PREFIX_LEN + length - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(PREFIX_LEN);
        let payload: Bytes = self.buf.split_to(length).freeze();
        Ok(Some(WriteNotification { offset, payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_layout_is_little_endian() {
        let n = WriteNotification::new(10, Bytes::from_static(&[1, 2, 3]));
        let mut buf = BytesMut::new();
        n.encode(&mut buf);

        let mut expected = Vec::new();
        expected.extend_from_slice(&10u64.to_le_bytes());
        expected.extend_from_slice(&3u64.to_le_bytes());
        expected.extend_from_slice(&[1, 2, 3]);
        assert_eq!(&buf[..], &expected[..]);
        assert_eq!(&n.encode_prefix()[..], &expected[..PREFIX_LEN]);
    }

    #[test]
    fn decoder_handles_split_input() {
        let mut stream = BytesMut::new();
        stream.put_slice(&encode_header(100));
        WriteNotification::new(10, Bytes::from_static(&[1, 2, 3])).encode(&mut stream);
        WriteNotification::new(50, Bytes::from_static(b"hello")).encode(&mut stream);

        let mut decoder = StreamDecoder::new();
        let mut decoded = Vec::new();
        for chunk in stream.chunks(5) {
            decoder.extend(chunk);
            while let Some(n) = decoder.next_notification().unwrap() {
                decoded.push(n);
            }
        }

        assert_eq!(decoder.size_bytes(), Some(100));
        assert_eq!(decoder.remaining(), 0);
        assert_eq!(
            decoded,
            vec![
                WriteNotification::new(10, Bytes::from_static(&[1, 2, 3])),
                WriteNotification::new(50, Bytes::from_static(b"hello")),
            ]
        );
    }

    #[test]
    fn decoder_accepts_empty_payload() {
        let mut decoder = StreamDecoder::new();
        decoder.extend(&encode_header(8));
        decoder.extend(&WriteNotification::new(4, Bytes::new()).encode_prefix());

        let n = decoder.next_notification().unwrap().unwrap();
        assert_eq!(n.offset, 4);
        assert!(n.payload.is_empty());
    }

    #[test]
    fn decoder_rejects_oversized_payload() {
        let mut decoder = StreamDecoder::new();
        decoder.extend(&encode_header(8));
        decoder.extend(&0u64.to_le_bytes());
        decoder.extend(&(MAX_BLOCK_SIZE + 1).to_le_bytes());

        let err = decoder.next_notification().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
