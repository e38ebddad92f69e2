//! TPKT (RFC 1006) framing for H.225.0 and H.245 over TCP
//!
//! ```text
//! +---------+----------+----------------+-------------------+
//! | version | reserved | length (16 bit) | payload ...      |
//! |    3    |    0     |  header + data  |                  |
//! +---------+----------+----------------+-------------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CodecError, Result};

pub const TPKT_VERSION: u8 = 3;
pub const TPKT_HEADER_LEN: usize = 4;
pub const TPKT_MAX_PAYLOAD: usize = u16::MAX as usize - TPKT_HEADER_LEN;

/// Append one framed payload to `dst`
pub fn encode_tpkt(payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if payload.len() > TPKT_MAX_PAYLOAD {
        return Err(CodecError::PayloadTooLarge(payload.len()));
    }
    dst.reserve(TPKT_HEADER_LEN + payload.len());
    dst.put_u8(TPKT_VERSION);
    dst.put_u8(0);
    dst.put_u16((payload.len() + TPKT_HEADER_LEN) as u16);
    dst.put_slice(payload);
    Ok(())
}

/// Frame a single payload
pub fn frame(payload: &[u8]) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(TPKT_HEADER_LEN + payload.len());
    encode_tpkt(payload, &mut buf)?;
    Ok(buf.freeze())
}

/// Incremental decoder for a TCP byte stream
#[derive(Debug, Default)]
pub struct TpktDecoder {
    buffer: BytesMut,
}

impl TpktDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Next complete payload, or `None` when more bytes are needed
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        if self.buffer.len() < TPKT_HEADER_LEN {
            return Ok(None);
        }
        if self.buffer[0] != TPKT_VERSION {
            return Err(CodecError::InvalidTpktVersion(self.buffer[0]));
        }
        let total = u16::from_be_bytes([self.buffer[2], self.buffer[3]]) as usize;
        if total < TPKT_HEADER_LEN {
            return Err(CodecError::InvalidTpktLength(total));
        }
        if self.buffer.len() < total {
            return Ok(None);
        }
        let mut packet = self.buffer.split_to(total);
        packet.advance(TPKT_HEADER_LEN);
        Ok(Some(packet.freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_header_layout() {
        let framed = frame(b"abc").unwrap();
        assert_eq!(&framed[..], &[3, 0, 0, 7, b'a', b'b', b'c']);
    }

    #[test]
    fn test_partial_then_complete() {
        let framed = frame(b"hello").unwrap();
        let mut decoder = TpktDecoder::new();
        decoder.extend(&framed[..3]);
        assert_eq!(decoder.next_frame().unwrap(), None);
        decoder.extend(&framed[3..]);
        assert_eq!(decoder.next_frame().unwrap().as_deref(), Some(&b"hello"[..]));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_bad_version() {
        let mut decoder = TpktDecoder::new();
        decoder.extend(&[2, 0, 0, 4]);
        assert_eq!(decoder.next_frame().unwrap_err(), CodecError::InvalidTpktVersion(2));
    }

    #[test]
    fn test_bad_length() {
        let mut decoder = TpktDecoder::new();
        decoder.extend(&[3, 0, 0, 2]);
        assert_eq!(decoder.next_frame().unwrap_err(), CodecError::InvalidTpktLength(2));
    }

    #[test]
    fn test_oversized_payload() {
        let payload = vec![0u8; TPKT_MAX_PAYLOAD + 1];
        assert!(matches!(frame(&payload), Err(CodecError::PayloadTooLarge(_))));
    }

    proptest! {
        #[test]
        fn prop_stream_split_anywhere(
            payloads in proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), 0..200),
                1..8,
            ),
            split in 0usize..2000,
        ) {
            let mut stream = BytesMut::new();
            for p in &payloads {
                encode_tpkt(p, &mut stream).unwrap();
            }
            let split = split.min(stream.len());
            let mut decoder = TpktDecoder::new();
            decoder.extend(&stream[..split]);
            let mut out = Vec::new();
            while let Some(f) = decoder.next_frame().unwrap() {
                out.push(f.to_vec());
            }
            decoder.extend(&stream[split..]);
            while let Some(f) = decoder.next_frame().unwrap() {
                out.push(f.to_vec());
            }
            prop_assert_eq!(out, payloads);
        }
    }
}
