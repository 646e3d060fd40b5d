//! Byte layout of a transaction record.
//!
//! ```text
//! u16  status tag length, then the UTF-8 tag (e.g. "IN_PROGRESS")
//! u8   payload flag (0 = absent, 1 = present)
//!      u32 payload length, then the payload bytes
//! u8   reservation flag (0 = absent, 1 = present)
//!      u16 owner length, then the UTF-8 owner id
//!      u64 reservation creation time (Unix milliseconds)
//! ```
//!
//! All integers are big-endian. The status and reservation precede nothing
//! that must be parsed to find them except the payload length, so
//! [`NodeValue::decode_header`] skips the payload without copying it.

use bytes::Buf;
use bytes::BufMut;
use keystone_constants::fate::MAX_OWNER_ID_LEN;
use snafu::Snafu;

use crate::types::FateReservation;
use crate::types::OwnerId;
use crate::types::TStatus;

const ABSENT: u8 = 0;
const PRESENT: u8 = 1;

/// Why a transaction record could not be decoded.
#[derive(Debug, Clone, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub))]
pub enum CodecError {
    #[snafu(display("record truncated reading {field}: needed {needed} bytes, {remaining} remaining"))]
    Truncated {
        field: &'static str,
        needed: usize,
        remaining: usize,
    },

    #[snafu(display("unknown status tag '{tag}'"))]
    UnknownStatus { tag: String },

    #[snafu(display("invalid {field} flag {value}"))]
    InvalidFlag { field: &'static str, value: u8 },

    #[snafu(display("{field} is not valid UTF-8"))]
    InvalidUtf8 { field: &'static str },

    #[snafu(display("empty reservation owner"))]
    EmptyOwner,

    #[snafu(display("{count} trailing bytes after record"))]
    TrailingBytes { count: usize },
}

/// Decoded transaction record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeValue {
    pub status: TStatus,
    /// `Some(vec![])` and `None` are distinct on the wire.
    pub payload: Option<Vec<u8>>,
    pub reservation: Option<FateReservation>,
}

/// Status and reservation of a record, decoded without the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeHeader {
    pub status: TStatus,
    pub reservation: Option<FateReservation>,
}

impl NodeValue {
    pub fn new(status: TStatus) -> Self {
        Self {
            status,
            payload: None,
            reservation: None,
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_reservation(mut self, reservation: FateReservation) -> Self {
        self.reservation = Some(reservation);
        self
    }

    /// Serialize to the record layout.
    ///
    /// # Panics
    ///
    /// Panics if the payload exceeds `u32::MAX` bytes.
    pub fn encode(&self) -> Vec<u8> {
        let tag = self.status.as_str().as_bytes();
        let payload_len = self.payload.as_ref().map_or(0, |p| 4 + p.len());
        let reservation_len = self.reservation.as_ref().map_or(0, |r| 2 + r.owner.as_str().len() + 8);
        let mut buf = Vec::with_capacity(2 + tag.len() + 1 + payload_len + 1 + reservation_len);

        buf.put_u16(tag.len() as u16);
        buf.put_slice(tag);

        match &self.payload {
            Some(payload) => {
                assert!(payload.len() <= u32::MAX as usize, "payload exceeds u32 length prefix");
                buf.put_u8(PRESENT);
                buf.put_u32(payload.len() as u32);
                buf.put_slice(payload);
            }
            None => buf.put_u8(ABSENT),
        }

        match &self.reservation {
            Some(reservation) => {
                let owner = reservation.owner.as_str().as_bytes();
                debug_assert!(owner.len() <= MAX_OWNER_ID_LEN);
                buf.put_u8(PRESENT);
                buf.put_u16(owner.len() as u16);
                buf.put_slice(owner);
                buf.put_u64(reservation.created_ms);
            }
            None => buf.put_u8(ABSENT),
        }

        buf
    }

    /// Parse a complete record. Trailing bytes are an error.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut buf = bytes;
        let status = read_status(&mut buf)?;
        let payload = match read_flag(&mut buf, "payload")? {
            true => {
                let len = read_u32(&mut buf, "payload length")? as usize;
                Some(read_bytes(&mut buf, len, "payload")?.to_vec())
            }
            false => None,
        };
        let reservation = read_reservation(&mut buf)?;
        ensure_consumed(buf)?;
        Ok(Self {
            status,
            payload,
            reservation,
        })
    }

    /// Parse only status and reservation, skipping over the payload.
    pub fn decode_header(bytes: &[u8]) -> Result<NodeHeader, CodecError> {
        let mut buf = bytes;
        let status = read_status(&mut buf)?;
        if read_flag(&mut buf, "payload")? {
            let len = read_u32(&mut buf, "payload length")? as usize;
            read_bytes(&mut buf, len, "payload")?;
        }
        let reservation = read_reservation(&mut buf)?;
        ensure_consumed(buf)?;
        Ok(NodeHeader { status, reservation })
    }

    /// Re-encode a record without its payload, keeping status and reservation.
    pub fn redact(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        let header = Self::decode_header(bytes)?;
        Ok(NodeValue {
            status: header.status,
            payload: None,
            reservation: header.reservation,
        }
        .encode())
    }
}

fn ensure_remaining(buf: &[u8], needed: usize, field: &'static str) -> Result<(), CodecError> {
    if buf.remaining() < needed {
        return Err(CodecError::Truncated {
            field,
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

fn ensure_consumed(buf: &[u8]) -> Result<(), CodecError> {
    match buf.remaining() {
        0 => Ok(()),
        count => Err(CodecError::TrailingBytes { count }),
    }
}

fn read_u16(buf: &mut &[u8], field: &'static str) -> Result<u16, CodecError> {
    ensure_remaining(buf, 2, field)?;
    Ok(buf.get_u16())
}

fn read_u32(buf: &mut &[u8], field: &'static str) -> Result<u32, CodecError> {
    ensure_remaining(buf, 4, field)?;
    Ok(buf.get_u32())
}

fn read_bytes<'a>(buf: &mut &'a [u8], len: usize, field: &'static str) -> Result<&'a [u8], CodecError> {
    ensure_remaining(buf, len, field)?;
    let slice: &'a [u8] = *buf;
    let (head, tail) = slice.split_at(len);
    *buf = tail;
    Ok(head)
}

fn read_flag(buf: &mut &[u8], field: &'static str) -> Result<bool, CodecError> {
    ensure_remaining(buf, 1, field)?;
    match buf.get_u8() {
        ABSENT => Ok(false),
        PRESENT => Ok(true),
        value => Err(CodecError::InvalidFlag { field, value }),
    }
}

fn read_string<'a>(buf: &mut &'a [u8], field: &'static str) -> Result<&'a str, CodecError> {
    let len = read_u16(buf, field)? as usize;
    let raw = read_bytes(buf, len, field)?;
    std::str::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8 { field })
}

fn read_status(buf: &mut &[u8]) -> Result<TStatus, CodecError> {
    let tag = read_string(buf, "status")?;
    TStatus::from_tag(tag).ok_or_else(|| CodecError::UnknownStatus { tag: tag.to_string() })
}

fn read_reservation(buf: &mut &[u8]) -> Result<Option<FateReservation>, CodecError> {
    if !read_flag(buf, "reservation")? {
        return Ok(None);
    }
    let owner = OwnerId::new(read_string(buf, "reservation owner")?).map_err(|_| CodecError::EmptyOwner)?;
    ensure_remaining(buf, 8, "reservation timestamp")?;
    let created_ms = buf.get_u64();
    Ok(Some(FateReservation::new(owner, created_ms)))
}
