//! Flat binary field codec shared by every packet type
//!
//! All integers are little-endian. Strings carry a one byte length prefix
//! and no terminator. Positions are quantised into two `u32` values over
//! the symmetric table range `[-TABLE_EXTENT, TABLE_EXTENT]`.
//!
//! The reader checks every field size against the bytes that remain before
//! touching the buffer, so attacker-controlled lengths surface as
//! [`CodecError::Truncated`] instead of a panic.

use crate::ids::{ClientId, ObjectId, NO_CLIENT};
use crate::object::{Vec2, TABLE_EXTENT};
use crate::protocol::Header;
use thiserror::Error;

/// Longest string a packet can carry
pub const MAX_STRING_LEN: usize = u8::MAX as usize;

/// Longest counted list a packet can carry
pub const MAX_LIST_LEN: usize = u16::MAX as usize;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("empty packet")]
    Empty,
    #[error("packet truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("unknown header byte {0}")]
    UnknownHeader(u8),
    #[error("header {0:?} is not valid in this direction")]
    UnexpectedHeader(Header),
    #[error("invalid boolean byte {0}")]
    InvalidBool(u8),
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("string of {0} bytes exceeds the 255 byte limit")]
    StringTooLong(usize),
    #[error("list of {0} entries exceeds the 65535 entry limit")]
    ListTooLong(usize),
    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),
    #[error("object id list has an odd trailing byte")]
    OddIdList,
}

/// Maps a coordinate onto the full `u32` range
///
/// `encoded = round(((value + MAX) / (2 * MAX)) * (2^32 - 1))` with the
/// value clamped into `[-MAX, MAX]` first. Non-finite values encode as 0.0.
pub fn quantize(value: f32) -> u32 {
    let max = f64::from(TABLE_EXTENT);
    let value = if value.is_finite() {
        f64::from(value).clamp(-max, max)
    } else {
        0.0
    };
    let normalized = ((value + max) / (2.0 * max)).clamp(0.0, 1.0);
    (normalized * f64::from(u32::MAX)).round() as u32
}

/// Inverse of [`quantize`]
pub fn dequantize(raw: u32) -> f32 {
    let max = f64::from(TABLE_EXTENT);
    (f64::from(raw) / f64::from(u32::MAX) * 2.0 * max - max) as f32
}

/// Builds one packet: the header byte followed by appended fields
#[derive(Debug, Clone)]
pub struct PacketWriter {
    buf: Vec<u8>,
}

impl PacketWriter {
    /// Starts a packet whose first byte is `header`
    pub fn new(header: Header) -> Self {
        let mut buf = Vec::with_capacity(32);
        buf.push(header as u8);
        Self { buf }
    }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn i8(&mut self, value: i8) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn u16(&mut self, value: u16) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn bool(&mut self, value: bool) -> &mut Self {
        self.u8(u8::from(value))
    }

    /// One length byte then the UTF-8 bytes
    ///
    /// Fails with [`CodecError::StringTooLong`] past [`MAX_STRING_LEN`]
    /// bytes; nothing is written in that case.
    pub fn str(&mut self, value: &str) -> Result<&mut Self, CodecError> {
        if value.len() > MAX_STRING_LEN {
            return Err(CodecError::StringTooLong(value.len()));
        }
        self.buf.push(value.len() as u8);
        self.buf.extend_from_slice(value.as_bytes());
        Ok(self)
    }

    /// Raw bytes with a `u16` length prefix
    pub fn blob(&mut self, data: &[u8]) -> Result<&mut Self, CodecError> {
        let len = u16::try_from(data.len()).map_err(|_| CodecError::ListTooLong(data.len()))?;
        self.u16(len);
        self.buf.extend_from_slice(data);
        Ok(self)
    }

    /// Both coordinates through [`quantize`], x first
    pub fn position(&mut self, position: Vec2) -> &mut Self {
        self.u32(quantize(position.x));
        self.u32(quantize(position.y))
    }

    /// A client id, or [`NO_CLIENT`] for nobody
    pub fn client_ref(&mut self, client: Option<ClientId>) -> &mut Self {
        self.u8(client.unwrap_or(NO_CLIENT))
    }

    /// `u16` element count for a list that follows
    pub fn count(&mut self, len: usize) -> Result<&mut Self, CodecError> {
        let len = u16::try_from(len).map_err(|_| CodecError::ListTooLong(len))?;
        Ok(self.u16(len))
    }

    /// Object ids packed back to back until the end of the packet
    pub fn ids(&mut self, ids: &[ObjectId]) -> &mut Self {
        for id in ids {
            self.u16(*id);
        }
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over one received packet
#[derive(Debug)]
pub struct PacketReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    /// Splits off the header byte
    pub fn open(buf: &'a [u8]) -> Result<(Header, Self), CodecError> {
        let (&first, _) = buf.split_first().ok_or(CodecError::Empty)?;
        let header = Header::try_from(first)?;
        Ok((header, Self { buf, pos: 1 }))
    }

    /// Unread bytes, header excluded
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < len {
            return Err(CodecError::Truncated {
                need: len,
                have: self.remaining(),
            });
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn i8(&mut self) -> Result<i8, CodecError> {
        Ok(i8::from_le_bytes(self.array()?))
    }

    pub fn u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn bool(&mut self) -> Result<bool, CodecError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::InvalidBool(other)),
        }
    }

    pub fn str(&mut self) -> Result<String, CodecError> {
        let len = usize::from(self.u8()?);
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| CodecError::InvalidUtf8)
    }

    pub fn blob(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = usize::from(self.u16()?);
        Ok(self.take(len)?.to_vec())
    }

    pub fn position(&mut self) -> Result<Vec2, CodecError> {
        let x = dequantize(self.u32()?);
        let y = dequantize(self.u32()?);
        Ok(Vec2::new(x, y))
    }

    /// Maps the [`NO_CLIENT`] sentinel back to `None`
    pub fn client_ref(&mut self) -> Result<Option<ClientId>, CodecError> {
        let raw = self.u8()?;
        Ok((raw != NO_CLIENT).then_some(raw))
    }

    /// Reads a `u16` element count and checks that `count * min_record`
    /// bytes are still available before the caller allocates anything
    pub fn count(&mut self, min_record: usize) -> Result<usize, CodecError> {
        let count = usize::from(self.u16()?);
        let need = count * min_record;
        if self.remaining() < need {
            return Err(CodecError::Truncated {
                need,
                have: self.remaining(),
            });
        }
        Ok(count)
    }

    /// Object ids packed until the end of the packet
    pub fn ids(&mut self) -> Result<Vec<ObjectId>, CodecError> {
        if self.remaining() % 2 != 0 {
            return Err(CodecError::OddIdList);
        }
        let mut ids = Vec::with_capacity(self.remaining() / 2);
        while self.remaining() > 0 {
            ids.push(self.u16()?);
        }
        Ok(ids)
    }

    /// Fails if any bytes were left unread
    pub fn finish(self) -> Result<(), CodecError> {
        match self.remaining() {
            0 => Ok(()),
            extra => Err(CodecError::TrailingBytes(extra)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_integers_are_little_endian() {
        let mut writer = PacketWriter::new(Header::Chat);
        writer.u16(0x1234).u32(0xAABBCCDD);
        let bytes = writer.finish();
        assert_eq!(bytes, vec![Header::Chat as u8, 0x34, 0x12, 0xDD, 0xCC, 0xBB, 0xAA]);
    }

    #[test]
    fn test_quantize_formula() {
        assert_eq!(quantize(-TABLE_EXTENT), 0);
        assert_eq!(quantize(TABLE_EXTENT), u32::MAX);
        assert_eq!(quantize(0.0), (f64::from(u32::MAX) / 2.0).round() as u32);
    }

    #[test]
    fn test_quantize_clamps_out_of_range() {
        assert_eq!(quantize(TABLE_EXTENT * 4.0), u32::MAX);
        assert_eq!(quantize(-TABLE_EXTENT * 4.0), 0);
        assert_eq!(quantize(f32::NAN), quantize(0.0));
        assert_eq!(quantize(f32::INFINITY), quantize(0.0));
    }

    #[test]
    fn test_position_precision() {
        for value in [-TABLE_EXTENT, -1234.5678, -0.25, 0.0, 0.001, 42.125, 9999.999, TABLE_EXTENT] {
            assert_approx_eq!(dequantize(quantize(value)), value, 1e-3);
        }
    }

    #[test]
    fn test_string_limits() {
        let mut writer = PacketWriter::new(Header::Chat);
        assert!(writer.str(&"x".repeat(255)).is_ok());
        assert_eq!(
            writer.str(&"x".repeat(256)).err(),
            Some(CodecError::StringTooLong(256))
        );
    }

    #[test]
    fn test_reader_rejects_truncated_fields() {
        let bytes = [Header::Chat as u8, 0x01];
        let (_, mut reader) = PacketReader::open(&bytes).unwrap();
        assert_eq!(
            reader.u16().err(),
            Some(CodecError::Truncated { need: 2, have: 1 })
        );
    }

    #[test]
    fn test_reader_rejects_oversized_string_prefix() {
        let bytes = [Header::Chat as u8, 200, b'h', b'i'];
        let (_, mut reader) = PacketReader::open(&bytes).unwrap();
        assert_eq!(
            reader.str().err(),
            Some(CodecError::Truncated { need: 200, have: 2 })
        );
    }

    #[test]
    fn test_count_is_checked_before_allocation() {
        let bytes = [Header::Create as u8, 0xFF, 0xFF, 0x00];
        let (_, mut reader) = PacketReader::open(&bytes).unwrap();
        assert!(matches!(reader.count(8), Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn test_odd_id_list() {
        let bytes = [Header::Select as u8, 1, 0, 2];
        let (_, mut reader) = PacketReader::open(&bytes).unwrap();
        assert_eq!(reader.ids().err(), Some(CodecError::OddIdList));
    }

    #[test]
    fn test_invalid_utf8_and_bool() {
        let bytes = [Header::Chat as u8, 2, 0xC3, 0x28, 7];
        let (_, mut reader) = PacketReader::open(&bytes).unwrap();
        assert_eq!(reader.str().err(), Some(CodecError::InvalidUtf8));
        assert_eq!(reader.bool().err(), Some(CodecError::InvalidBool(7)));
    }

    #[test]
    fn test_empty_and_unknown_header() {
        assert_eq!(PacketReader::open(&[]).err(), Some(CodecError::Empty));
        assert_eq!(
            PacketReader::open(&[250]).err(),
            Some(CodecError::UnknownHeader(250))
        );
    }

    #[test]
    fn test_trailing_bytes() {
        let bytes = [Header::Leave as u8, 3, 9];
        let (_, mut reader) = PacketReader::open(&bytes).unwrap();
        reader.u8().unwrap();
        assert_eq!(reader.finish().err(), Some(CodecError::TrailingBytes(1)));
    }

    #[test]
    fn test_client_ref_sentinel() {
        let mut writer = PacketWriter::new(Header::Own);
        writer.client_ref(None).client_ref(Some(4));
        let bytes = writer.finish();
        assert_eq!(bytes[1], NO_CLIENT);
        let (_, mut reader) = PacketReader::open(&bytes).unwrap();
        assert_eq!(reader.client_ref().unwrap(), None);
        assert_eq!(reader.client_ref().unwrap(), Some(4));
    }
}
