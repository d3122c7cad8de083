// ibpipe/src/wire.rs
// Tagged binary encoding primitives for Field/Event records.
//
// The format is the standard length-delimited tag/wire-type scheme: each
// value is preceded by a key `(field_number << 3) | wire_type`, varints for
// integral values, little-endian fixed64 for doubles and timestamps, and
// length-prefixed bytes for strings and nested records. Unknown fields are
// skippable by wire type, so an older reader can walk a record written by a
// newer writer.

use byteorder::{ByteOrder, LittleEndian};

use crate::base::PipeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
  Varint = 0,
  Fixed64 = 1,
  LengthDelimited = 2,
  Fixed32 = 5,
}

impl WireType {
  fn from_raw(raw: u64) -> Result<WireType, PipeError> {
    match raw {
      0 => Ok(WireType::Varint),
      1 => Ok(WireType::Fixed64),
      2 => Ok(WireType::LengthDelimited),
      5 => Ok(WireType::Fixed32),
      other => Err(PipeError::DecodeError(format!("unknown wire type {}", other))),
    }
  }
}

pub fn put_varint(buf: &mut Vec<u8>, mut v: u64) {
  loop {
    let byte = (v & 0x7f) as u8;
    v >>= 7;
    if v == 0 {
      buf.push(byte);
      return;
    }
    buf.push(byte | 0x80);
  }
}

pub fn get_varint(buf: &[u8], pos: &mut usize) -> Result<u64, PipeError> {
  let mut value: u64 = 0;
  let mut shift = 0u32;
  loop {
    if *pos >= buf.len() {
      return Err(PipeError::DecodeError("truncated varint".to_string()));
    }
    if shift >= 64 {
      return Err(PipeError::DecodeError("varint overflow".to_string()));
    }
    let byte = buf[*pos];
    *pos += 1;
    value |= u64::from(byte & 0x7f) << shift;
    if byte & 0x80 == 0 {
      return Ok(value);
    }
    shift += 7;
  }
}

pub fn put_key(buf: &mut Vec<u8>, field_number: u32, wire_type: WireType) {
  put_varint(buf, (u64::from(field_number) << 3) | wire_type as u64);
}

pub fn get_key(buf: &[u8], pos: &mut usize) -> Result<(u32, WireType), PipeError> {
  let key = get_varint(buf, pos)?;
  let wire_type = WireType::from_raw(key & 0x7)?;
  Ok(((key >> 3) as u32, wire_type))
}

pub fn put_fixed64(buf: &mut Vec<u8>, v: u64) {
  let mut raw = [0u8; 8];
  LittleEndian::write_u64(&mut raw, v);
  buf.extend_from_slice(&raw);
}

pub fn get_fixed64(buf: &[u8], pos: &mut usize) -> Result<u64, PipeError> {
  if *pos + 8 > buf.len() {
    return Err(PipeError::DecodeError("truncated fixed64".to_string()));
  }
  let v = LittleEndian::read_u64(&buf[*pos..*pos + 8]);
  *pos += 8;
  Ok(v)
}

pub fn put_double(buf: &mut Vec<u8>, v: f64) {
  put_fixed64(buf, v.to_bits());
}

pub fn get_double(buf: &[u8], pos: &mut usize) -> Result<f64, PipeError> {
  Ok(f64::from_bits(get_fixed64(buf, pos)?))
}

/// Signed values go over the wire as their 64-bit sign extension, like
/// proto2 int32/int64.
pub fn put_int64(buf: &mut Vec<u8>, v: i64) {
  put_varint(buf, v as u64);
}

pub fn get_int64(buf: &[u8], pos: &mut usize) -> Result<i64, PipeError> {
  Ok(get_varint(buf, pos)? as i64)
}

pub fn put_int32(buf: &mut Vec<u8>, v: i32) {
  put_int64(buf, i64::from(v));
}

pub fn get_int32(buf: &[u8], pos: &mut usize) -> Result<i32, PipeError> {
  Ok(get_int64(buf, pos)? as i32)
}

pub fn put_bytes(buf: &mut Vec<u8>, v: &[u8]) {
  put_varint(buf, v.len() as u64);
  buf.extend_from_slice(v);
}

pub fn get_bytes<'a>(buf: &'a [u8], pos: &mut usize) -> Result<&'a [u8], PipeError> {
  let len = get_varint(buf, pos)? as usize;
  // Compare against the remaining bytes; `pos + len` could overflow on a
  // hostile length.
  if len > buf.len() - *pos {
    return Err(PipeError::DecodeError(format!(
      "length-delimited field of {} bytes overruns buffer", len
    )));
  }
  let slice = &buf[*pos..*pos + len];
  *pos += len;
  Ok(slice)
}

pub fn get_string(buf: &[u8], pos: &mut usize) -> Result<String, PipeError> {
  let raw = get_bytes(buf, pos)?;
  std::str::from_utf8(raw)
    .map(|s| s.to_string())
    .map_err(|e| PipeError::DecodeError(format!("invalid UTF-8 in string field: {}", e)))
}

/// Skip over a field of the given wire type. Used for forward compatibility
/// when a reader encounters an unknown field number.
pub fn skip_field(buf: &[u8], pos: &mut usize, wire_type: WireType) -> Result<(), PipeError> {
  match wire_type {
    WireType::Varint => {
      get_varint(buf, pos)?;
    }
    WireType::Fixed64 => {
      get_fixed64(buf, pos)?;
    }
    WireType::LengthDelimited => {
      get_bytes(buf, pos)?;
    }
    WireType::Fixed32 => {
      if *pos + 4 > buf.len() {
        return Err(PipeError::DecodeError("truncated fixed32".to_string()));
      }
      *pos += 4;
    }
  }
  Ok(())
}
