// ibpipe/src/adapter.rs
// Turns raw broker callbacks into Events. The transport reader thread calls
// the ApiHandler methods; the EventAdapter looks up the method's registered
// signature, stamps the event with the connection's source id, and routes it
// either to the blocking-call bridge (synchronous methods) or the dispatch
// engine (everything else).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, error, warn};

use crate::api::ApiRegistry;
use crate::blocking::BlockingCallManager;
use crate::client::ClientShared;
use crate::engine::EventEngine;
use crate::event::{now_micros, ApiMethod, FieldValue};

/// The broker callback surface the transport decodes into. One method per
/// supported incoming message.
pub trait ApiHandler: Send + Sync {
  fn tick_price(&self, ticker_id: i32, field: i32, price: f64, can_auto_execute: i32);
  fn tick_size(&self, ticker_id: i32, field: i32, size: i32);
  fn tick_generic(&self, ticker_id: i32, tick_type: i32, value: f64);
  fn tick_string(&self, ticker_id: i32, tick_type: i32, value: &str);
  #[allow(clippy::too_many_arguments)]
  fn realtime_bar(
    &self,
    req_id: i32,
    time: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: i64,
    wap: f64,
    count: i32,
  );
  fn update_mkt_depth(
    &self,
    ticker_id: i32,
    position: i32,
    operation: i32,
    side: i32,
    price: f64,
    size: i32,
  );
  #[allow(clippy::too_many_arguments)]
  fn historical_data(
    &self,
    req_id: i32,
    date: &str,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: i32,
    count: i32,
    wap: f64,
    has_gaps: bool,
  );
  fn update_account_value(&self, key: &str, value: &str, currency: &str, account: &str);
  fn next_valid_id(&self, order_id: i32);
  fn current_time(&self, time: i64);
  fn error(&self, id: i32, code: i32, message: &str);
  fn connection_closed(&self);
}

pub struct EventAdapter {
  registry: Arc<ApiRegistry>,
  engine: Arc<EventEngine>,
  blocking: Arc<BlockingCallManager>,
  shared: Arc<ClientShared>,
  dispatched: AtomicU64,
  dropped: AtomicU64,
}

impl EventAdapter {
  pub fn new(
    registry: Arc<ApiRegistry>,
    engine: Arc<EventEngine>,
    blocking: Arc<BlockingCallManager>,
    shared: Arc<ClientShared>,
  ) -> Arc<EventAdapter> {
    Arc::new(EventAdapter {
      registry,
      engine,
      blocking,
      shared,
      dispatched: AtomicU64::new(0),
      dropped: AtomicU64::new(0),
    })
  }

  pub fn dispatched(&self) -> u64 {
    self.dispatched.load(Ordering::Relaxed)
  }

  pub fn dropped(&self) -> u64 {
    self.dropped.load(Ordering::Relaxed)
  }

  fn dispatch(&self, method: ApiMethod, args: Vec<FieldValue>) {
    let builder = match self.registry.get_method(method) {
      Some(b) => b,
      None => {
        // Not registered: silently ignored, same as an unsubscribed topic.
        debug!("No registered signature for {}, dropping", method);
        self.dropped.fetch_add(1, Ordering::Relaxed);
        return;
      }
    };
    let event = match builder.build(&self.shared.source_id(), now_micros(), &args) {
      Ok(event) => event,
      Err(e) => {
        warn!("Cannot build {} event: {}", method, e);
        self.dropped.fetch_add(1, Ordering::Relaxed);
        return;
      }
    };
    self.dispatched.fetch_add(1, Ordering::Relaxed);
    if self.blocking.is_synchronous(method) {
      if !self.blocking.handle_event(&event) {
        // Nobody waiting; still visible to watchers.
        self.engine.post(&event);
      }
    } else {
      self.engine.post(&event);
    }
  }
}

impl ApiHandler for EventAdapter {
  fn tick_price(&self, ticker_id: i32, field: i32, price: f64, can_auto_execute: i32) {
    self.dispatch(
      ApiMethod::TickPrice,
      vec![
        FieldValue::Int(ticker_id),
        FieldValue::Int(field),
        FieldValue::Double(price),
        FieldValue::Int(can_auto_execute),
      ],
    );
  }

  fn tick_size(&self, ticker_id: i32, field: i32, size: i32) {
    self.dispatch(
      ApiMethod::TickSize,
      vec![FieldValue::Int(ticker_id), FieldValue::Int(field), FieldValue::Int(size)],
    );
  }

  fn tick_generic(&self, ticker_id: i32, tick_type: i32, value: f64) {
    self.dispatch(
      ApiMethod::TickGeneric,
      vec![FieldValue::Int(ticker_id), FieldValue::Int(tick_type), FieldValue::Double(value)],
    );
  }

  fn tick_string(&self, ticker_id: i32, tick_type: i32, value: &str) {
    self.dispatch(
      ApiMethod::TickString,
      vec![
        FieldValue::Int(ticker_id),
        FieldValue::Int(tick_type),
        FieldValue::Str(value.to_string()),
      ],
    );
  }

  fn realtime_bar(
    &self,
    req_id: i32,
    time: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: i64,
    wap: f64,
    count: i32,
  ) {
    self.dispatch(
      ApiMethod::RealtimeBar,
      vec![
        FieldValue::Int(req_id),
        FieldValue::Long(time),
        FieldValue::Double(open),
        FieldValue::Double(high),
        FieldValue::Double(low),
        FieldValue::Double(close),
        FieldValue::Long(volume),
        FieldValue::Double(wap),
        FieldValue::Int(count),
      ],
    );
  }

  fn update_mkt_depth(
    &self,
    ticker_id: i32,
    position: i32,
    operation: i32,
    side: i32,
    price: f64,
    size: i32,
  ) {
    self.dispatch(
      ApiMethod::UpdateMktDepth,
      vec![
        FieldValue::Int(ticker_id),
        FieldValue::Int(position),
        FieldValue::Int(operation),
        FieldValue::Int(side),
        FieldValue::Double(price),
        FieldValue::Int(size),
      ],
    );
  }

  fn historical_data(
    &self,
    req_id: i32,
    date: &str,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: i32,
    count: i32,
    wap: f64,
    has_gaps: bool,
  ) {
    self.dispatch(
      ApiMethod::HistoricalData,
      vec![
        FieldValue::Int(req_id),
        FieldValue::Str(date.to_string()),
        FieldValue::Double(open),
        FieldValue::Double(high),
        FieldValue::Double(low),
        FieldValue::Double(close),
        FieldValue::Int(volume),
        FieldValue::Int(count),
        FieldValue::Double(wap),
        FieldValue::Bool(has_gaps),
      ],
    );
  }

  fn update_account_value(&self, key: &str, value: &str, currency: &str, account: &str) {
    self.shared.note_account(account);
    self.dispatch(
      ApiMethod::UpdateAccountValue,
      vec![
        FieldValue::Str(key.to_string()),
        FieldValue::Str(value.to_string()),
        FieldValue::Str(currency.to_string()),
        FieldValue::Str(account.to_string()),
      ],
    );
  }

  fn next_valid_id(&self, order_id: i32) {
    self.shared.set_next_valid_id(order_id);
    self.dispatch(ApiMethod::NextValidId, vec![FieldValue::Int(order_id)]);
  }

  fn current_time(&self, time: i64) {
    self.dispatch(ApiMethod::CurrentTime, vec![FieldValue::Long(time)]);
  }

  fn error(&self, id: i32, code: i32, message: &str) {
    error!("Broker error id={} code={}: {}", id, code, message);
    self.dispatch(
      ApiMethod::Error,
      vec![FieldValue::Int(id), FieldValue::Int(code), FieldValue::Str(message.to_string())],
    );
  }

  fn connection_closed(&self) {
    warn!("{}: connection closed by peer", self.shared.source_id());
    self.shared.mark_disconnected();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::engine::EventWatcher;
  use crate::event::Event;
  use parking_lot::Mutex;
  use std::time::Duration;

  struct Recorder {
    seen: Mutex<Vec<Event>>,
  }

  impl EventWatcher for Recorder {
    fn update(&self, event: &Event) {
      self.seen.lock().push(event.clone());
    }
  }

  fn make_adapter() -> (Arc<EventAdapter>, Arc<EventEngine>, Arc<BlockingCallManager>, Arc<Recorder>) {
    let engine = EventEngine::with_default_backend();
    engine.start();
    let blocking = Arc::new(BlockingCallManager::new());
    let shared = ClientShared::new("acct-1");
    let adapter = EventAdapter::new(
      Arc::new(ApiRegistry::standard()),
      engine.clone(),
      blocking.clone(),
      shared,
    );
    let recorder = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
    engine.add(recorder.clone(), "select * from Event", &[]).unwrap();
    (adapter, engine, blocking, recorder)
  }

  #[test]
  fn callbacks_become_posted_events() {
    let (adapter, engine, _blocking, recorder) = make_adapter();
    adapter.tick_price(1000, 0, 45.25, 0);
    adapter.tick_size(1000, 3, 200);
    assert_eq!(engine.event_count(), 2);
    assert_eq!(adapter.dispatched(), 2);
    let seen = recorder.seen.lock();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].method(), ApiMethod::TickPrice);
    assert_eq!(seen[0].source(), "acct-1");
    assert_eq!(seen[0].fields()[2].double_value(), Some(45.25));
    assert!(seen[1].timestamp() >= seen[0].timestamp());
  }

  #[test]
  fn synchronous_event_feeds_pending_call_not_engine() {
    let (adapter, engine, blocking, _recorder) = make_adapter();
    let feeder = adapter.clone();
    let handle = std::thread::spawn(move || {
      std::thread::sleep(Duration::from_millis(30));
      feeder.current_time(1_700_000_000);
    });
    let time = blocking
      .blocking_call(
        ApiMethod::CurrentTime,
        Duration::from_secs(2),
        || Ok(()),
        |event| {
          event.fields()[0]
            .long_value()
            .ok_or_else(|| crate::base::PipeError::InternalError("no time".to_string()))
        },
      )
      .unwrap();
    assert_eq!(time, 1_700_000_000);
    // Consumed by the blocking bridge, never posted to watchers.
    assert_eq!(engine.event_count(), 0);
    handle.join().unwrap();
  }

  #[test]
  fn unclaimed_synchronous_event_falls_through_to_engine() {
    let (adapter, engine, _blocking, recorder) = make_adapter();
    adapter.current_time(42);
    assert_eq!(engine.event_count(), 1);
    assert_eq!(recorder.seen.lock()[0].method(), ApiMethod::CurrentTime);
  }
}
