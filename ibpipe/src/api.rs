// ibpipe/src/api.rs
// Per-callback descriptors and the method registry. One ApiBuilder knows the
// ordered, typed argument signature of one broker callback and converts
// between positional argument values and structured Events. The registry is
// the single place that knows every monitored signature: adding a new
// callback means adding one descriptor here.

use std::collections::HashMap;

use crate::base::PipeError;
use crate::event::{ApiMethod, Event, Field, FieldValue};

/// The closed set of argument kinds a callback parameter may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
  Double,
  Int,
  Long,
  Str,
  Bool,
}

impl ParamKind {
  pub fn name(&self) -> &'static str {
    match self {
      ParamKind::Double => "double",
      ParamKind::Int => "int",
      ParamKind::Long => "long",
      ParamKind::Str => "string",
      ParamKind::Bool => "bool",
    }
  }

  fn matches(&self, value: &FieldValue) -> bool {
    matches!(
      (self, value),
      (ParamKind::Double, FieldValue::Double(_))
        | (ParamKind::Int, FieldValue::Int(_))
        | (ParamKind::Long, FieldValue::Long(_))
        | (ParamKind::Str, FieldValue::Str(_))
        | (ParamKind::Bool, FieldValue::Bool(_))
    )
  }
}

/// One declared positional parameter of a callback signature.
#[derive(Debug, Clone, Copy)]
pub struct Param {
  pub name: &'static str,
  pub kind: ParamKind,
}

/// Descriptor for one broker callback: the ordered parameter list, excluding
/// the implicit timestamp/method slots that every event carries.
#[derive(Debug, Clone)]
pub struct ApiBuilder {
  method: ApiMethod,
  params: Vec<Param>,
}

impl ApiBuilder {
  pub fn new(method: ApiMethod) -> ApiBuilder {
    ApiBuilder { method, params: Vec::new() }
  }

  pub fn arg(mut self, name: &'static str, kind: ParamKind) -> ApiBuilder {
    self.params.push(Param { name, kind });
    self
  }

  pub fn method(&self) -> ApiMethod {
    self.method
  }

  pub fn method_name(&self) -> &'static str {
    self.method.as_str()
  }

  pub fn arity(&self) -> usize {
    self.params.len()
  }

  pub fn params(&self) -> &[Param] {
    &self.params
  }

  /// Converts one callback invocation into an Event. The argument vector
  /// must match the declared signature in length and per-slot type.
  pub fn build(&self, source: &str, timestamp: u64, args: &[FieldValue]) -> Result<Event, PipeError> {
    if args.len() != self.params.len() {
      return Err(PipeError::ArityMismatch {
        method: self.method_name(),
        expected: self.params.len(),
        actual: args.len(),
      });
    }
    let mut builder = Event::builder()
      .timestamp(timestamp)
      .method(self.method)
      .source(source);
    for (index, (param, arg)) in self.params.iter().zip(args).enumerate() {
      if !param.kind.matches(arg) {
        return Err(PipeError::TypeMismatch {
          method: self.method_name(),
          index,
          name: param.name,
          expected: param.kind.name(),
        });
      }
      builder = builder.field(Field::from(arg.clone()));
    }
    builder.build()
  }

  /// The inverse of `build`: reconstructs the positional argument vector
  /// from a stored event, in declared order.
  pub fn parse(&self, event: &Event) -> Result<(ApiMethod, Vec<FieldValue>), PipeError> {
    if event.fields().len() != self.params.len() {
      return Err(PipeError::ArityMismatch {
        method: self.method_name(),
        expected: self.params.len(),
        actual: event.fields().len(),
      });
    }
    let mut args = Vec::with_capacity(self.params.len());
    for (index, (param, field)) in self.params.iter().zip(event.fields()).enumerate() {
      let value = field.value().ok_or(PipeError::UnsetField(index))?;
      if !param.kind.matches(value) {
        return Err(PipeError::TypeMismatch {
          method: self.method_name(),
          index,
          name: param.name,
          expected: param.kind.name(),
        });
      }
      args.push(value.clone());
    }
    Ok((self.method, args))
  }
}

/// Name-to-descriptor registry, constructed once at startup and passed by
/// reference to every component that needs lookup. Lookup of an
/// unregistered method returns `None` so callers can skip silently.
#[derive(Debug, Clone)]
pub struct ApiRegistry {
  builders: HashMap<ApiMethod, ApiBuilder>,
}

impl ApiRegistry {
  pub fn empty() -> ApiRegistry {
    ApiRegistry { builders: HashMap::new() }
  }

  /// The standard registry covering every monitored broker callback, with
  /// the exact external signatures.
  pub fn standard() -> ApiRegistry {
    let mut registry = ApiRegistry::empty();
    registry.register(
      ApiBuilder::new(ApiMethod::TickPrice)
        .arg("tickerId", ParamKind::Int)
        .arg("field", ParamKind::Int)
        .arg("price", ParamKind::Double)
        .arg("canAutoExecute", ParamKind::Int),
    );
    registry.register(
      ApiBuilder::new(ApiMethod::TickSize)
        .arg("tickerId", ParamKind::Int)
        .arg("field", ParamKind::Int)
        .arg("size", ParamKind::Int),
    );
    registry.register(
      ApiBuilder::new(ApiMethod::TickGeneric)
        .arg("tickerId", ParamKind::Int)
        .arg("tickType", ParamKind::Int)
        .arg("value", ParamKind::Double),
    );
    registry.register(
      ApiBuilder::new(ApiMethod::TickString)
        .arg("tickerId", ParamKind::Int)
        .arg("tickType", ParamKind::Int)
        .arg("value", ParamKind::Str),
    );
    registry.register(
      ApiBuilder::new(ApiMethod::RealtimeBar)
        .arg("reqId", ParamKind::Int)
        .arg("time", ParamKind::Long)
        .arg("open", ParamKind::Double)
        .arg("high", ParamKind::Double)
        .arg("low", ParamKind::Double)
        .arg("close", ParamKind::Double)
        .arg("volume", ParamKind::Long)
        .arg("wap", ParamKind::Double)
        .arg("count", ParamKind::Int),
    );
    registry.register(
      ApiBuilder::new(ApiMethod::UpdateMktDepth)
        .arg("tickerId", ParamKind::Int)
        .arg("position", ParamKind::Int)
        .arg("operation", ParamKind::Int)
        .arg("side", ParamKind::Int)
        .arg("price", ParamKind::Double)
        .arg("size", ParamKind::Int),
    );
    registry.register(
      ApiBuilder::new(ApiMethod::HistoricalData)
        .arg("reqId", ParamKind::Int)
        .arg("date", ParamKind::Str)
        .arg("open", ParamKind::Double)
        .arg("high", ParamKind::Double)
        .arg("low", ParamKind::Double)
        .arg("close", ParamKind::Double)
        .arg("volume", ParamKind::Int)
        .arg("count", ParamKind::Int)
        .arg("wap", ParamKind::Double)
        .arg("hasGaps", ParamKind::Bool),
    );
    registry.register(
      ApiBuilder::new(ApiMethod::CurrentTime).arg("time", ParamKind::Long),
    );
    registry.register(
      ApiBuilder::new(ApiMethod::UpdateAccountValue)
        .arg("key", ParamKind::Str)
        .arg("value", ParamKind::Str)
        .arg("currency", ParamKind::Str)
        .arg("accountName", ParamKind::Str),
    );
    registry.register(
      ApiBuilder::new(ApiMethod::NextValidId).arg("orderId", ParamKind::Int),
    );
    registry.register(
      ApiBuilder::new(ApiMethod::Error)
        .arg("id", ParamKind::Int)
        .arg("errorCode", ParamKind::Int)
        .arg("errorString", ParamKind::Str),
    );
    registry
  }

  pub fn register(&mut self, builder: ApiBuilder) {
    self.builders.insert(builder.method(), builder);
  }

  pub fn get(&self, name: &str) -> Option<&ApiBuilder> {
    ApiMethod::from_name(name).and_then(|m| self.builders.get(&m))
  }

  pub fn get_method(&self, method: ApiMethod) -> Option<&ApiBuilder> {
    self.builders.get(&method)
  }

  pub fn len(&self) -> usize {
    self.builders.len()
  }

  pub fn is_empty(&self) -> bool {
    self.builders.is_empty()
  }

  pub fn builders(&self) -> impl Iterator<Item = &ApiBuilder> {
    self.builders.values()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  /// A signature-conforming argument vector for any registered builder.
  fn args_for(builder: &ApiBuilder) -> Vec<FieldValue> {
    builder
      .params()
      .iter()
      .enumerate()
      .map(|(i, p)| match p.kind {
        ParamKind::Double => FieldValue::Double(i as f64 + 0.5),
        ParamKind::Int => FieldValue::Int(i as i32),
        ParamKind::Long => FieldValue::Long(i as i64 * 1_000_000),
        ParamKind::Str => FieldValue::Str(format!("v{}", i)),
        ParamKind::Bool => FieldValue::Bool(i % 2 == 0),
      })
      .collect()
  }

  #[test]
  fn round_trip_every_registered_method() {
    let registry = ApiRegistry::standard();
    assert_eq!(registry.len(), 11);
    for builder in registry.builders() {
      let args = args_for(builder);
      let event = builder.build("acct-1", 42, &args).unwrap();
      assert_eq!(event.fields().len(), builder.arity());
      let (method, parsed) = builder.parse(&event).unwrap();
      assert_eq!(method, builder.method());
      assert_eq!(parsed, args);
    }
  }

  #[test]
  fn wire_round_trip_every_registered_method() {
    let registry = ApiRegistry::standard();
    for builder in registry.builders() {
      let args = args_for(builder);
      let event = builder.build("acct-1", 42, &args).unwrap();
      let decoded = Event::decode(&event.encode()).unwrap();
      assert_eq!(decoded, event);
      let (_, parsed) = builder.parse(&decoded).unwrap();
      assert_eq!(parsed, args);
    }
  }

  #[test]
  fn build_rejects_wrong_arity() {
    let registry = ApiRegistry::standard();
    let builder = registry.get("tickSize").unwrap();
    let err = builder
      .build("acct-1", 1, &[FieldValue::Int(1), FieldValue::Int(2)])
      .unwrap_err();
    assert!(matches!(err, PipeError::ArityMismatch { expected: 3, actual: 2, .. }));
  }

  #[test]
  fn build_rejects_wrong_type() {
    let registry = ApiRegistry::standard();
    let builder = registry.get("tickPrice").unwrap();
    let err = builder
      .build(
        "acct-1",
        1,
        &[
          FieldValue::Int(1000),
          FieldValue::Int(0),
          FieldValue::Str("not-a-price".to_string()),
          FieldValue::Int(0),
        ],
      )
      .unwrap_err();
    assert!(matches!(err, PipeError::TypeMismatch { index: 2, .. }));
  }

  #[test]
  fn parse_rejects_wrong_arity() {
    let registry = ApiRegistry::standard();
    let builder = registry.get("tickSize").unwrap();
    let event = Event::builder()
      .timestamp(1)
      .method(ApiMethod::TickSize)
      .source("acct-1")
      .field(FieldValue::Int(1).into())
      .build()
      .unwrap();
    assert!(matches!(
      builder.parse(&event),
      Err(PipeError::ArityMismatch { expected: 3, actual: 1, .. })
    ));
  }

  #[test]
  fn parse_rejects_unset_field() {
    let registry = ApiRegistry::standard();
    let builder = registry.get("nextValidId").unwrap();
    let event = Event::builder()
      .timestamp(1)
      .method(ApiMethod::NextValidId)
      .source("acct-1")
      .field(Field::unset())
      .build()
      .unwrap();
    assert!(matches!(builder.parse(&event), Err(PipeError::UnsetField(0))));
  }

  #[test]
  fn unregistered_method_lookup_is_none() {
    let registry = ApiRegistry::standard();
    assert!(registry.get("tickOptionComputation").is_none());
    assert!(registry.get("noSuchCallback").is_none());
  }
}
