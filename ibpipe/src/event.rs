// ibpipe/src/event.rs
// The Field/Event record model: an immutable, timestamped record of one
// broker callback invocation, with a tagged binary wire form.

use std::cmp::Ordering;
use std::fmt;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

use crate::base::PipeError;
use crate::wire::{self, WireType};

/// Microseconds since the Unix epoch. Event timestamps use this resolution
/// so consecutive callbacks get strictly increasing stamps in practice.
pub fn now_micros() -> u64 {
  chrono::Utc::now().timestamp_micros() as u64
}

/// Identifies which broker callback produced an event. The numbering is the
/// wire enum numbering and must not be reordered.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, IntoPrimitive, TryFromPrimitive,
)]
#[repr(u32)]
pub enum ApiMethod {
  TickGeneric = 0,
  TickOptionComputation = 1,
  TickPrice = 2,
  TickSize = 3,
  TickString = 4,
  RealtimeBar = 5,
  UpdateMktDepth = 6,
  UpdateMktDepthL2 = 7,
  CurrentTime = 8,
  HistoricalData = 9,
  UpdateAccountValue = 10,
  NextValidId = 11,
  Error = 12,
}

impl ApiMethod {
  /// The callback name as it appears on the broker API surface.
  pub fn as_str(&self) -> &'static str {
    match self {
      ApiMethod::TickGeneric => "tickGeneric",
      ApiMethod::TickOptionComputation => "tickOptionComputation",
      ApiMethod::TickPrice => "tickPrice",
      ApiMethod::TickSize => "tickSize",
      ApiMethod::TickString => "tickString",
      ApiMethod::RealtimeBar => "realtimeBar",
      ApiMethod::UpdateMktDepth => "updateMktDepth",
      ApiMethod::UpdateMktDepthL2 => "updateMktDepthL2",
      ApiMethod::CurrentTime => "currentTime",
      ApiMethod::HistoricalData => "historicalData",
      ApiMethod::UpdateAccountValue => "updateAccountValue",
      ApiMethod::NextValidId => "nextValidId",
      ApiMethod::Error => "error",
    }
  }

  pub fn from_name(name: &str) -> Option<ApiMethod> {
    let m = match name {
      "tickGeneric" => ApiMethod::TickGeneric,
      "tickOptionComputation" => ApiMethod::TickOptionComputation,
      "tickPrice" => ApiMethod::TickPrice,
      "tickSize" => ApiMethod::TickSize,
      "tickString" => ApiMethod::TickString,
      "realtimeBar" => ApiMethod::RealtimeBar,
      "updateMktDepth" => ApiMethod::UpdateMktDepth,
      "updateMktDepthL2" => ApiMethod::UpdateMktDepthL2,
      "currentTime" => ApiMethod::CurrentTime,
      "historicalData" => ApiMethod::HistoricalData,
      "updateAccountValue" => ApiMethod::UpdateAccountValue,
      "nextValidId" => ApiMethod::NextValidId,
      "error" => ApiMethod::Error,
      _ => return None,
    };
    Some(m)
  }
}

impl fmt::Display for ApiMethod {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// One positional, variant-typed argument value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
  Double(f64),
  Int(i32),
  Str(String),
  Long(i64),
  Bool(bool),
}

impl fmt::Display for FieldValue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      FieldValue::Double(v) => write!(f, "{}", v),
      FieldValue::Int(v) => write!(f, "{}", v),
      FieldValue::Str(v) => f.write_str(v),
      FieldValue::Long(v) => write!(f, "{}", v),
      FieldValue::Bool(v) => write!(f, "{}", v),
    }
  }
}

// Wire field numbers for Field.
const FIELD_DOUBLE: u32 = 1;
const FIELD_INT: u32 = 2;
const FIELD_STRING: u32 = 3;
const FIELD_LONG: u32 = 4;
const FIELD_BOOL: u32 = 5;

/// One positional slot inside an `Event`. At most one variant is present;
/// a slot with no variant is legal and represents an unset field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Field {
  value: Option<FieldValue>,
}

impl Field {
  pub fn unset() -> Field {
    Field { value: None }
  }

  pub fn value(&self) -> Option<&FieldValue> {
    self.value.as_ref()
  }

  pub fn into_value(self) -> Option<FieldValue> {
    self.value
  }

  pub fn has_double_value(&self) -> bool {
    matches!(self.value, Some(FieldValue::Double(_)))
  }

  pub fn has_int_value(&self) -> bool {
    matches!(self.value, Some(FieldValue::Int(_)))
  }

  pub fn has_string_value(&self) -> bool {
    matches!(self.value, Some(FieldValue::Str(_)))
  }

  pub fn has_long_value(&self) -> bool {
    matches!(self.value, Some(FieldValue::Long(_)))
  }

  pub fn has_boolean_value(&self) -> bool {
    matches!(self.value, Some(FieldValue::Bool(_)))
  }

  pub fn double_value(&self) -> Option<f64> {
    match self.value {
      Some(FieldValue::Double(v)) => Some(v),
      _ => None,
    }
  }

  pub fn int_value(&self) -> Option<i32> {
    match self.value {
      Some(FieldValue::Int(v)) => Some(v),
      _ => None,
    }
  }

  pub fn string_value(&self) -> Option<&str> {
    match &self.value {
      Some(FieldValue::Str(v)) => Some(v.as_str()),
      _ => None,
    }
  }

  pub fn long_value(&self) -> Option<i64> {
    match self.value {
      Some(FieldValue::Long(v)) => Some(v),
      _ => None,
    }
  }

  pub fn boolean_value(&self) -> Option<bool> {
    match self.value {
      Some(FieldValue::Bool(v)) => Some(v),
      _ => None,
    }
  }

  pub fn encode_into(&self, buf: &mut Vec<u8>) {
    match &self.value {
      Some(FieldValue::Double(v)) => {
        wire::put_key(buf, FIELD_DOUBLE, WireType::Fixed64);
        wire::put_double(buf, *v);
      }
      Some(FieldValue::Int(v)) => {
        wire::put_key(buf, FIELD_INT, WireType::Varint);
        wire::put_int32(buf, *v);
      }
      Some(FieldValue::Str(v)) => {
        wire::put_key(buf, FIELD_STRING, WireType::LengthDelimited);
        wire::put_bytes(buf, v.as_bytes());
      }
      Some(FieldValue::Long(v)) => {
        wire::put_key(buf, FIELD_LONG, WireType::Varint);
        wire::put_int64(buf, *v);
      }
      Some(FieldValue::Bool(v)) => {
        wire::put_key(buf, FIELD_BOOL, WireType::Varint);
        wire::put_varint(buf, u64::from(*v));
      }
      None => {}
    }
  }

  pub fn decode(buf: &[u8]) -> Result<Field, PipeError> {
    let mut value = None;
    let mut pos = 0;
    while pos < buf.len() {
      let (number, wire_type) = wire::get_key(buf, &mut pos)?;
      match (number, wire_type) {
        (FIELD_DOUBLE, WireType::Fixed64) => {
          value = Some(FieldValue::Double(wire::get_double(buf, &mut pos)?));
        }
        (FIELD_INT, WireType::Varint) => {
          value = Some(FieldValue::Int(wire::get_int32(buf, &mut pos)?));
        }
        (FIELD_STRING, WireType::LengthDelimited) => {
          value = Some(FieldValue::Str(wire::get_string(buf, &mut pos)?));
        }
        (FIELD_LONG, WireType::Varint) => {
          value = Some(FieldValue::Long(wire::get_int64(buf, &mut pos)?));
        }
        (FIELD_BOOL, WireType::Varint) => {
          value = Some(FieldValue::Bool(wire::get_varint(buf, &mut pos)? != 0));
        }
        (_, wt) => {
          wire::skip_field(buf, &mut pos, wt)?;
        }
      }
    }
    Ok(Field { value })
  }
}

impl From<FieldValue> for Field {
  fn from(v: FieldValue) -> Field {
    Field { value: Some(v) }
  }
}

// Wire field numbers for Event.
const EVENT_TIMESTAMP: u32 = 1;
const EVENT_METHOD: u32 = 2;
const EVENT_FIELDS: u32 = 3;
const EVENT_SOURCE: u32 = 4;

/// An immutable record of one broker callback invocation. Constructed only
/// through [`EventBuilder`] (normally by an `ApiBuilder`), then read by
/// writers and the dispatch engine, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
  timestamp: u64,
  method: ApiMethod,
  fields: Vec<Field>,
  source: String,
}

impl Event {
  pub fn builder() -> EventBuilder {
    EventBuilder::default()
  }

  pub fn timestamp(&self) -> u64 {
    self.timestamp
  }

  pub fn method(&self) -> ApiMethod {
    self.method
  }

  pub fn fields(&self) -> &[Field] {
    &self.fields
  }

  pub fn source(&self) -> &str {
    &self.source
  }

  /// Total order by timestamp. Ties are left to the container's insertion
  /// order, which a stable sort preserves.
  pub fn cmp_by_time(&self, other: &Event) -> Ordering {
    self.timestamp.cmp(&other.timestamp)
  }

  pub fn encode(&self) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32 + self.fields.len() * 12);
    wire::put_key(&mut buf, EVENT_TIMESTAMP, WireType::Fixed64);
    wire::put_fixed64(&mut buf, self.timestamp);
    wire::put_key(&mut buf, EVENT_METHOD, WireType::Varint);
    wire::put_varint(&mut buf, u64::from(u32::from(self.method)));
    let mut scratch = Vec::new();
    for field in &self.fields {
      scratch.clear();
      field.encode_into(&mut scratch);
      wire::put_key(&mut buf, EVENT_FIELDS, WireType::LengthDelimited);
      wire::put_bytes(&mut buf, &scratch);
    }
    wire::put_key(&mut buf, EVENT_SOURCE, WireType::LengthDelimited);
    wire::put_bytes(&mut buf, self.source.as_bytes());
    buf
  }

  /// Decodes a wire-encoded event. Fails with a `DecodeError` if the bytes
  /// are malformed or a required top-level field (timestamp, method, source)
  /// is missing; the fields list is allowed to be empty.
  pub fn decode(buf: &[u8]) -> Result<Event, PipeError> {
    let mut builder = Event::builder();
    let mut pos = 0;
    while pos < buf.len() {
      let (number, wire_type) = wire::get_key(buf, &mut pos)?;
      match (number, wire_type) {
        (EVENT_TIMESTAMP, WireType::Fixed64) => {
          builder = builder.timestamp(wire::get_fixed64(buf, &mut pos)?);
        }
        (EVENT_METHOD, WireType::Varint) => {
          let raw = wire::get_varint(buf, &mut pos)? as u32;
          let method = ApiMethod::try_from(raw)
            .map_err(|_| PipeError::DecodeError(format!("unknown method enum {}", raw)))?;
          builder = builder.method(method);
        }
        (EVENT_FIELDS, WireType::LengthDelimited) => {
          let raw = wire::get_bytes(buf, &mut pos)?;
          builder = builder.field(Field::decode(raw)?);
        }
        (EVENT_SOURCE, WireType::LengthDelimited) => {
          builder = builder.source(wire::get_string(buf, &mut pos)?);
        }
        (_, wt) => {
          wire::skip_field(buf, &mut pos, wt)?;
        }
      }
    }
    if !builder.is_initialized() {
      return Err(PipeError::DecodeError(format!(
        "missing required field: {}", builder.missing().join(", ")
      )));
    }
    builder.build().map_err(|e| PipeError::DecodeError(e.to_string()))
  }
}

/// Renders the CSV form: `timestamp,methodName[,fieldValue]*`. Unset fields
/// render as empty columns.
impl fmt::Display for Event {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{},{}", self.timestamp, self.method)?;
    for field in &self.fields {
      f.write_str(",")?;
      if let Some(v) = field.value() {
        write!(f, "{}", v)?;
      }
    }
    Ok(())
  }
}

/// Write-once construction of an [`Event`]. All four top-level attributes
/// must be set before `build` succeeds (the fields list may stay empty).
#[derive(Debug, Default)]
pub struct EventBuilder {
  timestamp: Option<u64>,
  method: Option<ApiMethod>,
  fields: Vec<Field>,
  source: Option<String>,
}

impl EventBuilder {
  pub fn timestamp(mut self, ts: u64) -> Self {
    self.timestamp = Some(ts);
    self
  }

  pub fn method(mut self, method: ApiMethod) -> Self {
    self.method = Some(method);
    self
  }

  pub fn source(mut self, source: impl Into<String>) -> Self {
    self.source = Some(source.into());
    self
  }

  pub fn field(mut self, field: Field) -> Self {
    self.fields.push(field);
    self
  }

  pub fn fields(mut self, fields: impl IntoIterator<Item = Field>) -> Self {
    self.fields.extend(fields);
    self
  }

  /// True when every required attribute has been set.
  pub fn is_initialized(&self) -> bool {
    self.timestamp.is_some() && self.method.is_some() && self.source.is_some()
  }

  fn missing(&self) -> Vec<&'static str> {
    let mut out = Vec::new();
    if self.timestamp.is_none() {
      out.push("timestamp");
    }
    if self.method.is_none() {
      out.push("method");
    }
    if self.source.is_none() {
      out.push("source");
    }
    out
  }

  pub fn build(self) -> Result<Event, PipeError> {
    if !self.is_initialized() {
      return Err(PipeError::Misconfigured(format!(
        "event builder missing: {}", self.missing().join(", ")
      )));
    }
    Ok(Event {
      timestamp: self.timestamp.unwrap(),
      method: self.method.unwrap(),
      fields: self.fields,
      source: self.source.unwrap(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample_event(ts: u64) -> Event {
    Event::builder()
      .timestamp(ts)
      .method(ApiMethod::TickPrice)
      .source("acct-1")
      .field(FieldValue::Int(1000).into())
      .field(FieldValue::Int(0).into())
      .field(FieldValue::Double(45.0).into())
      .field(FieldValue::Int(0).into())
      .build()
      .unwrap()
  }

  #[test]
  fn field_presence_is_exclusive() {
    let field: Field = FieldValue::Int(42).into();
    assert!(field.has_int_value());
    assert!(!field.has_double_value());
    assert!(!field.has_string_value());
    assert!(!field.has_long_value());
    assert!(!field.has_boolean_value());
    assert_eq!(field.int_value(), Some(42));
  }

  #[test]
  fn field_wire_round_trip() {
    let values = [
      FieldValue::Double(-1.5),
      FieldValue::Int(-7),
      FieldValue::Str("AccountCode".to_string()),
      FieldValue::Long(1234567890123),
      FieldValue::Bool(true),
    ];
    for v in values {
      let field: Field = v.into();
      let mut buf = Vec::new();
      field.encode_into(&mut buf);
      assert_eq!(Field::decode(&buf).unwrap(), field);
    }
  }

  #[test]
  fn unset_field_round_trip() {
    let field = Field::unset();
    let mut buf = Vec::new();
    field.encode_into(&mut buf);
    assert!(buf.is_empty());
    assert_eq!(Field::decode(&buf).unwrap(), field);
  }

  #[test]
  fn event_wire_round_trip() {
    let event = sample_event(1234567);
    let decoded = Event::decode(&event.encode()).unwrap();
    assert_eq!(decoded, event);
  }

  #[test]
  fn decode_missing_required_field() {
    // Encode only a timestamp; method and source are absent.
    let mut buf = Vec::new();
    crate::wire::put_key(&mut buf, 1, crate::wire::WireType::Fixed64);
    crate::wire::put_fixed64(&mut buf, 42);
    match Event::decode(&buf) {
      Err(PipeError::DecodeError(msg)) => {
        assert!(msg.contains("missing required field"), "{}", msg);
      }
      other => panic!("expected DecodeError, got {:?}", other),
    }
  }

  #[test]
  fn decode_garbage_is_error() {
    assert!(Event::decode(&[0xff, 0xff, 0xff]).is_err());
  }

  #[test]
  fn decode_huge_field_length_is_error() {
    // A source field claiming u64::MAX bytes: must fail cleanly, not panic.
    let mut buf = Vec::new();
    crate::wire::put_key(&mut buf, 4, crate::wire::WireType::LengthDelimited);
    crate::wire::put_varint(&mut buf, u64::MAX);
    assert!(matches!(Event::decode(&buf), Err(PipeError::DecodeError(_))));
  }

  #[test]
  fn builder_requires_all_attributes() {
    let builder = Event::builder().timestamp(1).method(ApiMethod::CurrentTime);
    assert!(!builder.is_initialized());
    assert!(matches!(builder.build(), Err(PipeError::Misconfigured(_))));
  }

  #[test]
  fn display_is_csv_line() {
    let event = sample_event(99);
    assert_eq!(event.to_string(), "99,tickPrice,1000,0,45,0");
  }

  #[test]
  fn events_sort_by_timestamp() {
    // 1000 events spaced 2ms apart must iterate strictly increasing.
    let mut events: Vec<Event> = (0..1000u64).rev().map(|i| sample_event(i * 2000)).collect();
    events.sort_by(Event::cmp_by_time);
    for pair in events.windows(2) {
      assert!(pair[0].timestamp() < pair[1].timestamp());
    }
  }
}
