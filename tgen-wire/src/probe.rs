use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// The ID of the probe header on the wire. Zero-filled payloads never start with it.
const WIRE_ID: u8 = 0x54;

/// Length of an encoded [`Header`] in bytes.
pub const HEADER_LEN: usize = 13;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("Payload too short for a probe header: {0} bytes")]
    Truncated(usize),
    #[error("Invalid wire ID: {0}")]
    WireId(u8),
}

/// The probe header written at the start of generated payloads.
///
/// Layout (big-endian): `wire id: u8 | seq: u32 | send time nanos: u64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// The packet sequence number, per generator.
    pub seq: u32,
    /// Simulated send time.
    pub sent_at: Duration,
}

impl Header {
    #[inline]
    pub const fn new(seq: u32, sent_at: Duration) -> Self {
        Self { seq, sent_at }
    }

    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(WIRE_ID);
        dst.put_u32(self.seq);
        // u64 nanos covers ~584 years of simulated time
        dst.put_u64(u64::try_from(self.sent_at.as_nanos()).unwrap_or(u64::MAX));
    }

    /// Decodes a header from the start of `src`.
    pub fn decode(mut src: &[u8]) -> Result<Self, Error> {
        if src.len() < HEADER_LEN {
            return Err(Error::Truncated(src.len()));
        }

        let wire_id = src.get_u8();
        if wire_id != WIRE_ID {
            return Err(Error::WireId(wire_id));
        }

        let seq = src.get_u32();
        let sent_at = Duration::from_nanos(src.get_u64());

        Ok(Self { seq, sent_at })
    }

    /// Like [`Header::decode`], for receivers that treat header-less payloads as plain data.
    #[inline]
    pub fn peek(src: &[u8]) -> Option<Self> {
        Self::decode(src).ok()
    }
}

/// Builds a zero-filled payload of exactly `size` bytes. The header is written at the
/// start when one is given and the payload is large enough to hold it; otherwise it is
/// left out.
pub fn payload(size: usize, header: Option<Header>) -> Bytes {
    let mut buf = BytesMut::with_capacity(size);

    if let Some(header) = header {
        if size >= HEADER_LEN {
            header.encode(&mut buf);
        }
    }

    buf.resize(size, 0);
    buf.freeze()
}
