// ibpipe/src/client.rs
// The broker client: connection state machine, connect retry policy, and the
// high-level request surface. A client owns one transport, one blocking-call
// bridge and one adapter; incoming callbacks flow through the adapter into
// the shared dispatch engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};
use parking_lot::{Condvar, Mutex};

use crate::adapter::EventAdapter;
use crate::api::ApiRegistry;
use crate::base::PipeError;
use crate::blocking::BlockingCallManager;
use crate::engine::EventEngine;
use crate::event::{ApiMethod, Event};
use crate::market::MarketDataRequest;
use crate::transport::BrokerTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
  /// Created, never connected.
  Initialized,
  /// Socket is up, account and order id not yet established.
  Connected,
  /// Fully established: account known, first valid order id received.
  Ready,
  /// Was connected and lost it, or gave up connecting.
  NotConnected,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
  pub host: String,
  pub port: u16,
  pub client_id: i32,
  /// Connect attempts before giving up.
  pub max_retries: u32,
  /// Sleep after every failed attempt.
  pub retry_backoff: Duration,
  /// Bound on the wait for the ready handshake (account + order id).
  pub ready_timeout: Duration,
  /// Default timeout for synchronous calls.
  pub blocking_timeout: Duration,
}

impl ClientConfig {
  pub fn new(host: impl Into<String>, port: u16, client_id: i32) -> ClientConfig {
    ClientConfig {
      host: host.into(),
      port,
      client_id,
      max_retries: 3,
      retry_backoff: Duration::from_secs(1),
      ready_timeout: Duration::from_secs(5),
      blocking_timeout: Duration::from_millis(500),
    }
  }
}

/// Connection state shared with the adapter, which mutates it from the
/// transport reader thread.
pub struct ClientShared {
  state: Mutex<ClientState>,
  cond: Condvar,
  source_id: Mutex<String>,
  account: Mutex<Option<String>>,
  next_valid_id: Mutex<Option<i32>>,
  connects: AtomicU64,
  disconnects: AtomicU64,
}

impl ClientShared {
  pub fn new(name: &str) -> Arc<ClientShared> {
    Arc::new(ClientShared {
      state: Mutex::new(ClientState::Initialized),
      cond: Condvar::new(),
      source_id: Mutex::new(name.to_string()),
      account: Mutex::new(None),
      next_valid_id: Mutex::new(None),
      connects: AtomicU64::new(0),
      disconnects: AtomicU64::new(0),
    })
  }

  pub fn state(&self) -> ClientState {
    *self.state.lock()
  }

  pub(crate) fn set_state(&self, state: ClientState) {
    *self.state.lock() = state;
    self.cond.notify_all();
  }

  /// Stable identity of this connection, used as the event source.
  pub fn source_id(&self) -> String {
    self.source_id.lock().clone()
  }

  pub(crate) fn set_source_id(&self, id: String) {
    *self.source_id.lock() = id;
  }

  pub fn account(&self) -> Option<String> {
    self.account.lock().clone()
  }

  pub(crate) fn set_account(&self, account: String) {
    *self.account.lock() = Some(account);
  }

  /// Remembers the account name seen on the value stream, first one wins.
  pub(crate) fn note_account(&self, account: &str) {
    if account.is_empty() {
      return;
    }
    let mut slot = self.account.lock();
    if slot.is_none() {
      *slot = Some(account.to_string());
    }
  }

  pub fn next_valid_id(&self) -> Option<i32> {
    *self.next_valid_id.lock()
  }

  pub(crate) fn set_next_valid_id(&self, id: i32) {
    *self.next_valid_id.lock() = Some(id);
    self.cond.notify_all();
  }

  pub(crate) fn wait_next_valid_id(&self, timeout: Duration) -> Option<i32> {
    let deadline = Instant::now() + timeout;
    let mut slot = self.next_valid_id.lock();
    while slot.is_none() {
      if self.cond.wait_until(&mut slot, deadline).timed_out() {
        return *slot;
      }
    }
    *slot
  }

  pub(crate) fn mark_disconnected(&self) {
    self.disconnects.fetch_add(1, Ordering::Relaxed);
    self.set_state(ClientState::NotConnected);
  }

  pub fn connects(&self) -> u64 {
    self.connects.load(Ordering::Relaxed)
  }

  pub fn disconnects(&self) -> u64 {
    self.disconnects.load(Ordering::Relaxed)
  }
}

pub struct TwsClient {
  name: String,
  config: ClientConfig,
  transport: Box<dyn BrokerTransport>,
  shared: Arc<ClientShared>,
  blocking: Arc<BlockingCallManager>,
  engine: Arc<EventEngine>,
}

impl TwsClient {
  /// Wires up a client over the given transport. The adapter is installed as
  /// the transport's handler; events it produces go to `engine`.
  pub fn new(
    name: impl Into<String>,
    config: ClientConfig,
    transport: Box<dyn BrokerTransport>,
    engine: Arc<EventEngine>,
  ) -> Arc<TwsClient> {
    let name = name.into();
    let registry = Arc::new(ApiRegistry::standard());
    let blocking = Arc::new(BlockingCallManager::new());
    let shared = ClientShared::new(&name);
    let adapter = EventAdapter::new(registry, engine.clone(), blocking.clone(), shared.clone());
    transport.set_handler(adapter);
    Arc::new(TwsClient { name, config, transport, shared, blocking, engine })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn state(&self) -> ClientState {
    self.shared.state()
  }

  pub fn source_id(&self) -> String {
    self.shared.source_id()
  }

  pub fn account(&self) -> Option<String> {
    self.shared.account()
  }

  pub fn engine(&self) -> &Arc<EventEngine> {
    &self.engine
  }

  pub fn shared(&self) -> &Arc<ClientShared> {
    &self.shared
  }

  /// Connects and drives the session to `Ready`: socket handshake with
  /// retries, account code lookup, then the first valid order id. On
  /// exhausted retries or a failed ready handshake the state is
  /// `NotConnected` and the error says why.
  pub fn connect(&self) -> Result<(), PipeError> {
    match self.state() {
      ClientState::Connected | ClientState::Ready => return Err(PipeError::AlreadyConnected),
      ClientState::Initialized | ClientState::NotConnected => {}
    }

    let mut last_err = PipeError::ConnectionFailed("no attempts made".to_string());
    let mut connected = false;
    for attempt in 1..=self.config.max_retries.max(1) {
      match self.transport.connect(
        &self.config.host,
        self.config.port,
        self.config.client_id,
        self.config.ready_timeout,
      ) {
        Ok(()) => {
          connected = true;
          break;
        }
        Err(e) => {
          warn!(
            "{}: connect attempt {}/{} failed: {}",
            self.name, attempt, self.config.max_retries, e
          );
          last_err = e;
          std::thread::sleep(self.config.retry_backoff);
        }
      }
    }
    if !connected {
      self.shared.set_state(ClientState::NotConnected);
      return Err(last_err);
    }
    self.shared.set_state(ClientState::Connected);
    self.shared.connects.fetch_add(1, Ordering::Relaxed);
    info!("{}: connected to {}:{}", self.name, self.config.host, self.config.port);

    // The account code names this connection; it arrives on the account
    // value stream after subscribing.
    match self.blocking.blocking_call_filtered(
      ApiMethod::UpdateAccountValue,
      self.config.ready_timeout,
      |event| {
        event.fields().first().and_then(|f| f.string_value()) == Some("AccountCode")
      },
      || self.transport.request_account_updates(true, ""),
      |event| {
        event
          .fields()
          .get(1)
          .and_then(|f| f.string_value())
          .map(str::to_string)
          .ok_or_else(|| PipeError::ParseError("account code row has no value".to_string()))
      },
    ) {
      Ok(account) => {
        info!("{}: account {}", self.name, account);
        self.shared.set_account(account.clone());
        self.shared.set_source_id(format!("{}-{}", account, self.config.client_id));
      }
      Err(e) => {
        // The account code names every event this connection produces; a
        // session without it never becomes Ready.
        warn!("{}: no account code from gateway: {}", self.name, e);
        self.transport.disconnect();
        self.shared.set_state(ClientState::NotConnected);
        return Err(e);
      }
    }

    match self.shared.wait_next_valid_id(self.config.ready_timeout) {
      Some(id) => {
        info!("{}: ready, next valid order id {}", self.name, id);
        self.shared.set_state(ClientState::Ready);
        Ok(())
      }
      None => {
        warn!("{}: no valid order id within {:?}", self.name, self.config.ready_timeout);
        self.transport.disconnect();
        self.shared.set_state(ClientState::NotConnected);
        Err(PipeError::Timeout("ready handshake did not complete".to_string()))
      }
    }
  }

  /// Idempotent orderly shutdown.
  pub fn disconnect(&self) {
    if self.transport.is_connected() {
      let _ = self.transport.request_account_updates(false, "");
    }
    self.transport.disconnect();
    match self.state() {
      ClientState::Connected | ClientState::Ready => {
        self.shared.mark_disconnected();
        info!("{}: disconnected", self.name);
      }
      _ => {}
    }
  }

  /// Cleanup after the reader thread noticed a dropped connection. Polls
  /// briefly for the transport to settle, then reaps it.
  pub fn on_disconnect(&self) {
    let polls = (self.config.max_retries / 4).max(1);
    for _ in 0..polls {
      if !self.transport.is_connected() {
        break;
      }
      std::thread::sleep(self.config.retry_backoff);
    }
    self.transport.disconnect();
    if self.state() != ClientState::NotConnected {
      self.shared.mark_disconnected();
    }
  }

  fn check_ready(&self) -> Result<(), PipeError> {
    if self.state() != ClientState::Ready {
      return Err(PipeError::NotConnected);
    }
    Ok(())
  }

  /// Round-trips a currentTime request; the result is broker wall-clock
  /// seconds. Doubles as a liveness probe.
  pub fn ping(&self, timeout: Duration) -> Result<i64, PipeError> {
    self.check_ready()?;
    self.blocking.blocking_call(
      ApiMethod::CurrentTime,
      timeout,
      || self.transport.request_current_time(),
      |event| {
        event
          .fields()
          .first()
          .and_then(|f| f.long_value())
          .ok_or_else(|| PipeError::ParseError("currentTime event has no time".to_string()))
      },
    )
  }

  /// Synchronously fetches historical bars. Rows stream in on the
  /// historicalData callback; a terminal row whose date starts with
  /// "finished" ends the call and is not returned.
  pub fn request_historical_data(
    &self,
    req: &MarketDataRequest,
    end_date_time: &str,
    duration: &str,
    bar_size: &str,
    what_to_show: &str,
    timeout: Duration,
  ) -> Result<Vec<Event>, PipeError> {
    self.check_ready()?;
    let ticker_id = req.ticker_id;
    self.blocking.blocking_collect(
      ApiMethod::HistoricalData,
      timeout,
      move |event| event.fields().first().and_then(|f| f.int_value()) == Some(ticker_id),
      |event| {
        event
          .fields()
          .get(1)
          .and_then(|f| f.string_value())
          .map(|d| d.starts_with("finished"))
          .unwrap_or(false)
      },
      || {
        self.transport.request_historical_data(req, end_date_time, duration, bar_size, what_to_show)
      },
      |event| Ok(event.clone()),
    )
  }

  /// Fire-and-forget tick subscription; data arrives as events.
  pub fn request_market_data(&self, req: &MarketDataRequest) -> Result<(), PipeError> {
    self.check_ready()?;
    self.transport.request_market_data(req)
  }

  pub fn cancel_market_data(&self, ticker_id: i32) -> Result<(), PipeError> {
    self.check_ready()?;
    self.transport.cancel_market_data(ticker_id)
  }

  pub fn request_realtime_bars(
    &self,
    req: &MarketDataRequest,
    bar_size: i32,
    what_to_show: &str,
  ) -> Result<(), PipeError> {
    self.check_ready()?;
    self.transport.request_realtime_bars(req, bar_size, what_to_show)
  }

  pub fn request_market_depth(
    &self,
    req: &MarketDataRequest,
    num_rows: i32,
  ) -> Result<(), PipeError> {
    self.check_ready()?;
    self.transport.request_market_depth(req, num_rows)
  }

  pub fn cancel_market_depth(&self, ticker_id: i32) -> Result<(), PipeError> {
    self.check_ready()?;
    self.transport.cancel_market_depth(ticker_id)
  }
}
