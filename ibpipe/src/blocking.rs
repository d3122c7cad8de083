// ibpipe/src/blocking.rs
// Bridges the asynchronous callback stream into synchronous request/response
// calls. A caller registers interest, fires the outgoing request, and parks
// on a condvar until the reader thread delivers the matching event(s) or the
// deadline passes. Only methods declared synchronous can be bridged, and at
// most one call per method may be in flight at a time.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::base::PipeError;
use crate::event::{ApiMethod, Event};

type EventPredicate = Box<dyn Fn(&Event) -> bool + Send>;

struct Pending {
  method: ApiMethod,
  filter: EventPredicate,
  // Present for multi-row calls; a row matching it completes the call and
  // is itself excluded from the results.
  end: Option<EventPredicate>,
  results: Vec<Event>,
  done: bool,
}

#[derive(Default)]
struct Table {
  entries: HashMap<u64, Pending>,
  next_id: u64,
  in_flight: HashSet<&'static str>,
}

pub struct BlockingCallManager {
  synchronous: HashSet<&'static str>,
  inner: Mutex<Table>,
  cond: Condvar,
}

impl Default for BlockingCallManager {
  fn default() -> Self {
    BlockingCallManager::new()
  }
}

impl BlockingCallManager {
  /// Manager with the standard synchronous method set.
  pub fn new() -> BlockingCallManager {
    BlockingCallManager::with_methods([
      ApiMethod::CurrentTime,
      ApiMethod::HistoricalData,
      ApiMethod::UpdateAccountValue,
      ApiMethod::NextValidId,
    ])
  }

  pub fn with_methods(methods: impl IntoIterator<Item = ApiMethod>) -> BlockingCallManager {
    BlockingCallManager {
      synchronous: methods.into_iter().map(|m| m.as_str()).collect(),
      inner: Mutex::new(Table::default()),
      cond: Condvar::new(),
    }
  }

  /// Whether events of this method should be fed to `handle_event`.
  pub fn is_synchronous(&self, method: ApiMethod) -> bool {
    self.synchronous.contains(method.as_str())
  }

  /// Called from the reader thread for each incoming synchronous-method
  /// event. Returns true if some pending call consumed the event.
  pub fn handle_event(&self, event: &Event) -> bool {
    let mut table = self.inner.lock();
    let mut matched = false;
    for pending in table.entries.values_mut() {
      if pending.done || pending.method != event.method() || !(pending.filter)(event) {
        continue;
      }
      matched = true;
      match &pending.end {
        Some(end) if end(event) => pending.done = true,
        Some(_) => pending.results.push(event.clone()),
        None => {
          pending.results.push(event.clone());
          pending.done = true;
        }
      }
    }
    if matched {
      self.cond.notify_all();
    }
    matched
  }

  /// One-shot synchronous call: issues `request`, waits for the first event
  /// of `method`, and maps it to the result type.
  pub fn blocking_call<R>(
    &self,
    method: ApiMethod,
    timeout: Duration,
    request: impl FnOnce() -> Result<(), PipeError>,
    map: impl FnOnce(&Event) -> Result<R, PipeError>,
  ) -> Result<R, PipeError> {
    self.blocking_call_filtered(method, timeout, |_| true, request, map)
  }

  /// Like `blocking_call` but only events passing `filter` complete the
  /// call. Used when a method multiplexes unrelated rows, e.g. picking the
  /// AccountCode row out of the account-value stream.
  pub fn blocking_call_filtered<R>(
    &self,
    method: ApiMethod,
    timeout: Duration,
    filter: impl Fn(&Event) -> bool + Send + 'static,
    request: impl FnOnce() -> Result<(), PipeError>,
    map: impl FnOnce(&Event) -> Result<R, PipeError>,
  ) -> Result<R, PipeError> {
    let id = self.begin(method, Box::new(filter), None)?;
    if let Err(e) = request() {
      self.finish(id, method);
      return Err(e);
    }
    let results = self.wait(id, method, timeout)?;
    let event = results
      .first()
      .ok_or_else(|| PipeError::InternalError(format!("{} completed with no event", method)))?;
    map(event)
  }

  /// Multi-row synchronous call: collects every matching event until one
  /// satisfies `end` (the end row is not collected), then maps each row.
  pub fn blocking_collect<R>(
    &self,
    method: ApiMethod,
    timeout: Duration,
    filter: impl Fn(&Event) -> bool + Send + 'static,
    end: impl Fn(&Event) -> bool + Send + 'static,
    request: impl FnOnce() -> Result<(), PipeError>,
    map: impl Fn(&Event) -> Result<R, PipeError>,
  ) -> Result<Vec<R>, PipeError> {
    let id = self.begin(method, Box::new(filter), Some(Box::new(end)))?;
    if let Err(e) = request() {
      self.finish(id, method);
      return Err(e);
    }
    let results = self.wait(id, method, timeout)?;
    results.iter().map(map).collect()
  }

  fn begin(
    &self,
    method: ApiMethod,
    filter: EventPredicate,
    end: Option<EventPredicate>,
  ) -> Result<u64, PipeError> {
    let name = method.as_str();
    if !self.synchronous.contains(name) {
      return Err(PipeError::Misconfigured(format!("{} is not a synchronous method", name)));
    }
    let mut table = self.inner.lock();
    if !table.in_flight.insert(name) {
      return Err(PipeError::AlreadyRunning(name.to_string()));
    }
    table.next_id += 1;
    let id = table.next_id;
    table.entries.insert(id, Pending { method, filter, end, results: Vec::new(), done: false });
    debug!("Blocking call {} registered as #{}", name, id);
    Ok(id)
  }

  fn wait(&self, id: u64, method: ApiMethod, timeout: Duration) -> Result<Vec<Event>, PipeError> {
    let deadline = Instant::now() + timeout;
    let mut table = self.inner.lock();
    loop {
      let done = match table.entries.get(&id) {
        Some(pending) => pending.done,
        None => {
          return Err(PipeError::InternalError(format!("blocking call #{} vanished", id)));
        }
      };
      if done {
        let pending = table.entries.remove(&id);
        table.in_flight.remove(method.as_str());
        return Ok(pending.map(|p| p.results).unwrap_or_default());
      }
      if self.cond.wait_until(&mut table, deadline).timed_out() {
        let complete = table.entries.get(&id).map(|p| p.done).unwrap_or(false);
        if complete {
          continue;
        }
        table.entries.remove(&id);
        table.in_flight.remove(method.as_str());
        return Err(PipeError::Timeout(format!(
          "{} did not complete within {:?}", method, timeout
        )));
      }
    }
  }

  fn finish(&self, id: u64, method: ApiMethod) {
    let mut table = self.inner.lock();
    table.entries.remove(&id);
    table.in_flight.remove(method.as_str());
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::ApiRegistry;
  use crate::event::FieldValue;
  use std::sync::Arc;

  fn time_event(secs: i64) -> Event {
    ApiRegistry::standard()
      .get("currentTime")
      .unwrap()
      .build("acct-1", 1, &[FieldValue::Long(secs)])
      .unwrap()
  }

  fn account_value(key: &str, value: &str) -> Event {
    ApiRegistry::standard()
      .get("updateAccountValue")
      .unwrap()
      .build(
        "acct-1",
        1,
        &[
          FieldValue::Str(key.to_string()),
          FieldValue::Str(value.to_string()),
          FieldValue::Str("USD".to_string()),
          FieldValue::Str("DU123".to_string()),
        ],
      )
      .unwrap()
  }

  fn historical_row(date: &str, close: f64) -> Event {
    ApiRegistry::standard()
      .get("historicalData")
      .unwrap()
      .build(
        "acct-1",
        1,
        &[
          FieldValue::Int(77),
          FieldValue::Str(date.to_string()),
          FieldValue::Double(close - 1.0),
          FieldValue::Double(close + 1.0),
          FieldValue::Double(close - 2.0),
          FieldValue::Double(close),
          FieldValue::Int(100),
          FieldValue::Int(10),
          FieldValue::Double(close),
          FieldValue::Bool(false),
        ],
      )
      .unwrap()
  }

  #[test]
  fn call_completes_when_event_arrives() {
    let mgr = Arc::new(BlockingCallManager::new());
    let delivery = mgr.clone();
    let handle = std::thread::spawn(move || {
      std::thread::sleep(Duration::from_millis(50));
      assert!(delivery.handle_event(&time_event(1_700_000_000)));
    });
    let time = mgr
      .blocking_call(
        ApiMethod::CurrentTime,
        Duration::from_secs(2),
        || Ok(()),
        |event| {
          event.fields()[0]
            .long_value()
            .ok_or_else(|| PipeError::InternalError("no time".to_string()))
        },
      )
      .unwrap();
    assert_eq!(time, 1_700_000_000);
    handle.join().unwrap();
  }

  #[test]
  fn call_times_out_without_event() {
    let mgr = BlockingCallManager::new();
    let start = Instant::now();
    let result = mgr.blocking_call(
      ApiMethod::CurrentTime,
      Duration::from_millis(200),
      || Ok(()),
      |_| Ok(()),
    );
    let elapsed = start.elapsed();
    assert!(matches!(result, Err(PipeError::Timeout(_))), "{:?}", result);
    assert!(elapsed >= Duration::from_millis(180), "returned too early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(1), "returned too late: {:?}", elapsed);
    // The slot is free again after the timeout.
    assert!(mgr.inner.lock().in_flight.is_empty());
  }

  #[test]
  fn unregistered_method_is_rejected() {
    let mgr = BlockingCallManager::new();
    let result = mgr.blocking_call(
      ApiMethod::TickPrice,
      Duration::from_millis(10),
      || Ok(()),
      |_| Ok(()),
    );
    assert!(matches!(result, Err(PipeError::Misconfigured(_))));
  }

  #[test]
  fn request_failure_unregisters() {
    let mgr = BlockingCallManager::new();
    let result = mgr.blocking_call(
      ApiMethod::CurrentTime,
      Duration::from_millis(10),
      || Err(PipeError::NotConnected),
      |_| Ok(()),
    );
    assert!(matches!(result, Err(PipeError::NotConnected)));
    assert!(mgr.inner.lock().in_flight.is_empty());
  }

  #[test]
  fn filtered_call_skips_non_matching_rows() {
    let mgr = Arc::new(BlockingCallManager::new());
    let delivery = mgr.clone();
    let handle = std::thread::spawn(move || {
      std::thread::sleep(Duration::from_millis(30));
      delivery.handle_event(&account_value("NetLiquidation", "50000"));
      delivery.handle_event(&account_value("AccountCode", "DU123"));
    });
    let code = mgr
      .blocking_call_filtered(
        ApiMethod::UpdateAccountValue,
        Duration::from_secs(2),
        |event| event.fields()[0].string_value() == Some("AccountCode"),
        || Ok(()),
        |event| {
          event.fields()[1]
            .string_value()
            .map(str::to_string)
            .ok_or_else(|| PipeError::InternalError("no value".to_string()))
        },
      )
      .unwrap();
    assert_eq!(code, "DU123");
    handle.join().unwrap();
  }

  #[test]
  fn collect_excludes_end_row() {
    let mgr = Arc::new(BlockingCallManager::new());
    let delivery = mgr.clone();
    let handle = std::thread::spawn(move || {
      std::thread::sleep(Duration::from_millis(30));
      delivery.handle_event(&historical_row("20260828", 45.0));
      delivery.handle_event(&historical_row("20260829", 46.0));
      delivery.handle_event(&historical_row("finished-20260828-20260829", 0.0));
    });
    let closes = mgr
      .blocking_collect(
        ApiMethod::HistoricalData,
        Duration::from_secs(2),
        |event| event.fields()[0].int_value() == Some(77),
        |event| {
          event.fields()[1].string_value().map(|d| d.starts_with("finished")).unwrap_or(false)
        },
        || Ok(()),
        |event| {
          event.fields()[5]
            .double_value()
            .ok_or_else(|| PipeError::InternalError("no close".to_string()))
        },
      )
      .unwrap();
    assert_eq!(closes, vec![45.0, 46.0]);
    handle.join().unwrap();
  }

  #[test]
  fn second_call_on_same_method_is_rejected() {
    let mgr = Arc::new(BlockingCallManager::new());
    let contender = mgr.clone();
    let handle = std::thread::spawn(move || {
      std::thread::sleep(Duration::from_millis(50));
      let result = contender.blocking_call(
        ApiMethod::CurrentTime,
        Duration::from_millis(10),
        || Ok(()),
        |_| Ok(()),
      );
      assert!(matches!(result, Err(PipeError::AlreadyRunning(_))));
      contender.handle_event(&time_event(7));
    });
    let time = mgr
      .blocking_call(
        ApiMethod::CurrentTime,
        Duration::from_secs(2),
        || Ok(()),
        |event| {
          event.fields()[0]
            .long_value()
            .ok_or_else(|| PipeError::InternalError("no time".to_string()))
        },
      )
      .unwrap();
    assert_eq!(time, 7);
    handle.join().unwrap();
  }
}
