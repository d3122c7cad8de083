// ibpipe/src/transport.rs
// Socket transport to the broker gateway: connect handshake, length-framed
// null-terminated messages, outgoing request encoding and the reader thread
// that decodes incoming messages into ApiHandler callbacks.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use socket2::{SockRef, TcpKeepalive};

use crate::adapter::ApiHandler;
use crate::base::PipeError;
use crate::market::MarketDataRequest;

// Outgoing message ids.
const REQ_MKT_DATA: i32 = 1;
const CANCEL_MKT_DATA: i32 = 2;
const REQ_ACCT_DATA: i32 = 6;
const REQ_MKT_DEPTH: i32 = 10;
const CANCEL_MKT_DEPTH: i32 = 11;
const REQ_HISTORICAL_DATA: i32 = 20;
const REQ_CURRENT_TIME: i32 = 49;
const REQ_REAL_TIME_BARS: i32 = 50;
const START_API: i32 = 71;

// Incoming message ids.
const TICK_PRICE: i32 = 1;
const TICK_SIZE: i32 = 2;
const ERR_MSG: i32 = 4;
const ACCT_VALUE: i32 = 6;
const NEXT_VALID_ID: i32 = 9;
const MARKET_DEPTH: i32 = 12;
const HISTORICAL_DATA: i32 = 17;
const TICK_GENERIC: i32 = 45;
const TICK_STRING: i32 = 46;
const CURRENT_TIME: i32 = 49;
const REAL_TIME_BARS: i32 = 50;

const MIN_CLIENT_VERSION: i32 = 100;
const MAX_CLIENT_VERSION: i32 = 176;
const MAX_MSG_SIZE: usize = 10 * 1024 * 1024;
const READER_POLL: Duration = Duration::from_secs(2);

/// Builds one outgoing message body: null-terminated string tokens.
pub(crate) struct MessageBuilder {
  buf: Vec<u8>,
}

impl MessageBuilder {
  pub fn new(msg_id: i32) -> MessageBuilder {
    let mut b = MessageBuilder { buf: Vec::with_capacity(64) };
    b.push_int(msg_id);
    b
  }

  pub fn push_str(&mut self, s: &str) -> &mut Self {
    self.buf.extend_from_slice(s.as_bytes());
    self.buf.push(0);
    self
  }

  pub fn push_int(&mut self, v: i32) -> &mut Self {
    self.push_str(&v.to_string())
  }

  pub fn push_double(&mut self, v: f64) -> &mut Self {
    self.push_str(&v.to_string())
  }

  pub fn push_bool(&mut self, v: bool) -> &mut Self {
    self.push_int(i32::from(v))
  }

  pub fn into_body(self) -> Vec<u8> {
    self.buf
  }
}

/// Pulls null-terminated tokens off an incoming message body. Numeric
/// accessors treat an empty token as zero, which is how the gateway encodes
/// unset values.
pub(crate) struct FieldParser<'a> {
  buf: &'a [u8],
  pos: usize,
}

impl<'a> FieldParser<'a> {
  pub fn new(buf: &'a [u8]) -> FieldParser<'a> {
    FieldParser { buf, pos: 0 }
  }

  pub fn next_str(&mut self) -> Result<&'a str, PipeError> {
    if self.pos >= self.buf.len() {
      return Err(PipeError::ParseError("message body exhausted".to_string()));
    }
    let start = self.pos;
    while self.pos < self.buf.len() && self.buf[self.pos] != 0 {
      self.pos += 1;
    }
    let token = std::str::from_utf8(&self.buf[start..self.pos])
      .map_err(|e| PipeError::ParseError(format!("non-utf8 token: {}", e)))?;
    self.pos += 1; // step over the terminator
    Ok(token)
  }

  pub fn next_int(&mut self) -> Result<i32, PipeError> {
    let s = self.next_str()?;
    if s.is_empty() {
      return Ok(0);
    }
    s.parse().map_err(|e| PipeError::ParseError(format!("bad int '{}': {}", s, e)))
  }

  pub fn next_long(&mut self) -> Result<i64, PipeError> {
    let s = self.next_str()?;
    if s.is_empty() {
      return Ok(0);
    }
    s.parse().map_err(|e| PipeError::ParseError(format!("bad long '{}': {}", s, e)))
  }

  pub fn next_double(&mut self) -> Result<f64, PipeError> {
    let s = self.next_str()?;
    if s.is_empty() {
      return Ok(0.0);
    }
    s.parse().map_err(|e| PipeError::ParseError(format!("bad double '{}': {}", s, e)))
  }

  pub fn next_bool(&mut self) -> Result<bool, PipeError> {
    Ok(self.next_int()? != 0)
  }
}

pub(crate) fn write_framed(out: &mut impl Write, body: &[u8]) -> Result<(), PipeError> {
  out
    .write_u32::<BigEndian>(body.len() as u32)
    .and_then(|_| out.write_all(body))
    .and_then(|_| out.flush())
    .map_err(|e| PipeError::SocketError(format!("sending message: {}", e)))
}

pub(crate) fn read_framed(input: &mut impl Read) -> Result<Vec<u8>, PipeError> {
  let size = input
    .read_u32::<BigEndian>()
    .map_err(|e| PipeError::SocketError(format!("reading message size: {}", e)))? as usize;
  if size > MAX_MSG_SIZE {
    return Err(PipeError::ParseError(format!("message size too large: {}", size)));
  }
  let mut body = vec![0u8; size];
  input
    .read_exact(&mut body)
    .map_err(|e| PipeError::SocketError(format!("reading message body ({} bytes): {}", size, e)))?;
  Ok(body)
}

/// Decodes one incoming message body and invokes the matching handler
/// callback. Unknown message ids are skipped.
pub(crate) fn dispatch_message(handler: &dyn ApiHandler, body: &[u8]) -> Result<(), PipeError> {
  let mut p = FieldParser::new(body);
  let msg_id = p.next_int()?;
  match msg_id {
    TICK_PRICE => {
      let _version = p.next_int()?;
      let ticker_id = p.next_int()?;
      let field = p.next_int()?;
      let price = p.next_double()?;
      let _size = p.next_int()?;
      let can_auto_execute = p.next_int()?;
      handler.tick_price(ticker_id, field, price, can_auto_execute);
    }
    TICK_SIZE => {
      let _version = p.next_int()?;
      handler.tick_size(p.next_int()?, p.next_int()?, p.next_int()?);
    }
    TICK_GENERIC => {
      let _version = p.next_int()?;
      handler.tick_generic(p.next_int()?, p.next_int()?, p.next_double()?);
    }
    TICK_STRING => {
      let _version = p.next_int()?;
      handler.tick_string(p.next_int()?, p.next_int()?, p.next_str()?);
    }
    ERR_MSG => {
      let _version = p.next_int()?;
      handler.error(p.next_int()?, p.next_int()?, p.next_str()?);
    }
    ACCT_VALUE => {
      let _version = p.next_int()?;
      handler.update_account_value(p.next_str()?, p.next_str()?, p.next_str()?, p.next_str()?);
    }
    NEXT_VALID_ID => {
      let _version = p.next_int()?;
      handler.next_valid_id(p.next_int()?);
    }
    MARKET_DEPTH => {
      let _version = p.next_int()?;
      handler.update_mkt_depth(
        p.next_int()?,
        p.next_int()?,
        p.next_int()?,
        p.next_int()?,
        p.next_double()?,
        p.next_int()?,
      );
    }
    HISTORICAL_DATA => {
      let _version = p.next_int()?;
      let req_id = p.next_int()?;
      let start_date = p.next_str()?.to_string();
      let end_date = p.next_str()?.to_string();
      let item_count = p.next_int()?;
      for _ in 0..item_count {
        let date = p.next_str()?;
        let open = p.next_double()?;
        let high = p.next_double()?;
        let low = p.next_double()?;
        let close = p.next_double()?;
        let volume = p.next_int()?;
        let count = p.next_int()?;
        let wap = p.next_double()?;
        let has_gaps = p.next_bool()?;
        handler.historical_data(req_id, date, open, high, low, close, volume, count, wap, has_gaps);
      }
      // Terminal row marks the end of the result set.
      let finished = format!("finished-{}-{}", start_date, end_date);
      handler.historical_data(req_id, &finished, -1.0, -1.0, -1.0, -1.0, -1, -1, -1.0, false);
    }
    CURRENT_TIME => {
      let _version = p.next_int()?;
      handler.current_time(p.next_long()?);
    }
    REAL_TIME_BARS => {
      let _version = p.next_int()?;
      handler.realtime_bar(
        p.next_int()?,
        p.next_long()?,
        p.next_double()?,
        p.next_double()?,
        p.next_double()?,
        p.next_double()?,
        p.next_long()?,
        p.next_double()?,
        p.next_int()?,
      );
    }
    other => {
      debug!("Skipping unhandled message id {}", other);
    }
  }
  Ok(())
}

/// Outgoing side of the broker connection, plus connection lifecycle. The
/// incoming side is delivered through the `ApiHandler` installed with
/// `set_handler` before `connect`.
pub trait BrokerTransport: Send + Sync {
  fn connect(&self, host: &str, port: u16, client_id: i32, timeout: Duration)
    -> Result<(), PipeError>;
  fn disconnect(&self);
  fn is_connected(&self) -> bool;
  fn set_handler(&self, handler: Arc<dyn ApiHandler>);

  fn request_current_time(&self) -> Result<(), PipeError>;
  fn request_account_updates(&self, subscribe: bool, account: &str) -> Result<(), PipeError>;
  fn request_market_data(&self, req: &MarketDataRequest) -> Result<(), PipeError>;
  fn cancel_market_data(&self, ticker_id: i32) -> Result<(), PipeError>;
  fn request_realtime_bars(
    &self,
    req: &MarketDataRequest,
    bar_size: i32,
    what_to_show: &str,
  ) -> Result<(), PipeError>;
  fn request_market_depth(&self, req: &MarketDataRequest, num_rows: i32) -> Result<(), PipeError>;
  fn cancel_market_depth(&self, ticker_id: i32) -> Result<(), PipeError>;
  fn request_historical_data(
    &self,
    req: &MarketDataRequest,
    end_date_time: &str,
    duration: &str,
    bar_size: &str,
    what_to_show: &str,
  ) -> Result<(), PipeError>;
}

struct TransportInner {
  stream: Option<TcpStream>,
  reader: Option<thread::JoinHandle<()>>,
  server_version: i32,
}

pub struct SocketTransport {
  inner: Mutex<TransportInner>,
  handler: Mutex<Option<Arc<dyn ApiHandler>>>,
  connected: Arc<AtomicBool>,
  stop_flag: Arc<AtomicBool>,
}

impl SocketTransport {
  pub fn new() -> SocketTransport {
    SocketTransport {
      inner: Mutex::new(TransportInner { stream: None, reader: None, server_version: 0 }),
      handler: Mutex::new(None),
      connected: Arc::new(AtomicBool::new(false)),
      stop_flag: Arc::new(AtomicBool::new(false)),
    }
  }

  pub fn server_version(&self) -> i32 {
    self.inner.lock().server_version
  }

  fn send(&self, body: Vec<u8>) -> Result<(), PipeError> {
    if !self.is_connected() {
      return Err(PipeError::NotConnected);
    }
    let mut inner = self.inner.lock();
    match inner.stream.as_mut() {
      Some(stream) => write_framed(stream, &body),
      None => Err(PipeError::NotConnected),
    }
  }

  fn push_contract(b: &mut MessageBuilder, req: &MarketDataRequest) {
    b.push_str(&req.contract.symbol);
    b.push_str(&req.contract.sec_type);
    b.push_str(""); // expiry
    b.push_double(0.0); // strike
    b.push_str(""); // right
    b.push_str(""); // multiplier
    b.push_str(&req.contract.exchange);
    b.push_str(""); // primary exchange
    b.push_str(&req.contract.currency);
    b.push_str(""); // local symbol
  }

  fn spawn_reader(&self, stream: TcpStream) -> Result<(), PipeError> {
    let handler = self
      .handler
      .lock()
      .clone()
      .ok_or_else(|| PipeError::Misconfigured("no handler installed before connect".to_string()))?;
    let mut reader_stream = stream
      .try_clone()
      .map_err(|e| PipeError::SocketError(format!("cloning stream for reader: {}", e)))?;
    reader_stream
      .set_read_timeout(Some(READER_POLL))
      .map_err(|e| PipeError::SocketError(format!("setting reader timeout: {}", e)))?;

    let stop_flag = self.stop_flag.clone();
    let connected = self.connected.clone();
    let handle = thread::Builder::new()
      .name("broker-reader".to_string())
      .spawn(move || {
        debug!("Reader thread started");
        loop {
          if stop_flag.load(Ordering::Acquire) {
            break;
          }
          match read_framed(&mut reader_stream) {
            Ok(body) => {
              if body.is_empty() {
                continue;
              }
              if let Err(e) = dispatch_message(handler.as_ref(), &body) {
                error!("Error processing incoming message: {}", e);
              }
            }
            Err(PipeError::SocketError(msg)) => {
              // A poll timeout is the normal idle case.
              if msg.contains("timed out") || msg.contains("would block") {
                continue;
              }
              if !stop_flag.load(Ordering::Acquire) {
                error!("Connection lost in reader thread: {}", msg);
                connected.store(false, Ordering::Release);
                handler.connection_closed();
              }
              break;
            }
            Err(e) => {
              error!("Reader thread parse error: {}", e);
              thread::sleep(Duration::from_millis(100));
            }
          }
        }
        debug!("Reader thread ended");
      })
      .map_err(|e| PipeError::InternalError(format!("spawning reader thread: {}", e)))?;
    self.inner.lock().reader = Some(handle);
    Ok(())
  }
}

impl Default for SocketTransport {
  fn default() -> Self {
    SocketTransport::new()
  }
}

impl BrokerTransport for SocketTransport {
  fn connect(
    &self,
    host: &str,
    port: u16,
    client_id: i32,
    timeout: Duration,
  ) -> Result<(), PipeError> {
    if self.is_connected() {
      return Err(PipeError::AlreadyConnected);
    }
    let addr = format!("{}:{}", host, port);
    let socket_addr = addr
      .to_socket_addrs()
      .map_err(|e| PipeError::ConnectionFailed(format!("resolving {}: {}", addr, e)))?
      .next()
      .ok_or_else(|| PipeError::ConnectionFailed(format!("no address for {}", addr)))?;
    info!("Connecting to broker gateway at {}", addr);
    let mut stream = TcpStream::connect_timeout(&socket_addr, timeout)
      .map_err(|e| PipeError::ConnectionFailed(format!("connect to {}: {}", addr, e)))?;
    stream
      .set_write_timeout(Some(timeout))
      .map_err(|e| PipeError::ConnectionFailed(format!("setting write timeout: {}", e)))?;
    stream
      .set_read_timeout(Some(timeout))
      .map_err(|e| PipeError::ConnectionFailed(format!("setting read timeout: {}", e)))?;
    let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(30));
    if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
      warn!("Cannot enable TCP keepalive: {}", e);
    }

    // Client hello: magic prefix then a framed version range.
    let version_payload = format!("v{}..{}", MIN_CLIENT_VERSION, MAX_CLIENT_VERSION);
    stream
      .write_all(b"API\0")
      .map_err(|e| PipeError::SocketError(format!("sending handshake: {}", e)))?;
    write_framed(&mut stream, version_payload.as_bytes())?;

    // Server ack: version and connection time, null-separated.
    let ack = read_framed(&mut stream)?;
    let mut p = FieldParser::new(&ack);
    let server_version = p.next_int()?;
    let connection_time = p.next_str().unwrap_or("").to_string();
    if server_version < MIN_CLIENT_VERSION {
      return Err(PipeError::ConnectionFailed(format!(
        "unsupported server version {}", server_version
      )));
    }
    info!("Gateway server version {} at {}", server_version, connection_time);

    // StartAPI: message id, version 2, client id, empty capabilities.
    let mut b = MessageBuilder::new(START_API);
    b.push_int(2).push_int(client_id).push_str("");
    write_framed(&mut stream, &b.into_body())?;

    self.stop_flag.store(false, Ordering::Release);
    {
      let mut inner = self.inner.lock();
      inner.server_version = server_version;
      inner.stream = Some(
        stream
          .try_clone()
          .map_err(|e| PipeError::SocketError(format!("cloning stream: {}", e)))?,
      );
    }
    self.connected.store(true, Ordering::Release);
    if let Err(e) = self.spawn_reader(stream) {
      self.connected.store(false, Ordering::Release);
      self.inner.lock().stream = None;
      return Err(e);
    }
    Ok(())
  }

  fn disconnect(&self) {
    if !self.connected.load(Ordering::Acquire) && self.inner.lock().reader.is_none() {
      return;
    }
    info!("Disconnecting from broker gateway");
    self.stop_flag.store(true, Ordering::Release);
    let (stream, reader) = {
      let mut inner = self.inner.lock();
      (inner.stream.take(), inner.reader.take())
    };
    if let Some(stream) = stream {
      // Unblocks the reader thread immediately.
      if let Err(e) = stream.shutdown(Shutdown::Both) {
        if e.kind() != std::io::ErrorKind::NotConnected {
          warn!("Error shutting down socket: {}", e);
        }
      }
    }
    if let Some(handle) = reader {
      if handle.thread().id() == thread::current().id() {
        debug!("Disconnect from reader thread, skipping join");
      } else if handle.join().is_err() {
        error!("Reader thread panicked");
      }
    }
    self.connected.store(false, Ordering::Release);
  }

  fn is_connected(&self) -> bool {
    self.connected.load(Ordering::Acquire) && !self.stop_flag.load(Ordering::Acquire)
  }

  fn set_handler(&self, handler: Arc<dyn ApiHandler>) {
    *self.handler.lock() = Some(handler);
  }

  fn request_current_time(&self) -> Result<(), PipeError> {
    let mut b = MessageBuilder::new(REQ_CURRENT_TIME);
    b.push_int(1); // version
    self.send(b.into_body())
  }

  fn request_account_updates(&self, subscribe: bool, account: &str) -> Result<(), PipeError> {
    let mut b = MessageBuilder::new(REQ_ACCT_DATA);
    b.push_int(2).push_bool(subscribe).push_str(account);
    self.send(b.into_body())
  }

  fn request_market_data(&self, req: &MarketDataRequest) -> Result<(), PipeError> {
    let mut b = MessageBuilder::new(REQ_MKT_DATA);
    b.push_int(11).push_int(req.ticker_id);
    b.push_int(0); // contract id unknown
    Self::push_contract(&mut b, req);
    b.push_str(""); // trading class
    b.push_bool(false); // no delta-neutral leg
    b.push_str(&req.generic_tick_list);
    b.push_bool(req.snapshot);
    b.push_bool(false); // regulatory snapshot
    b.push_int(0); // empty options list
    self.send(b.into_body())
  }

  fn cancel_market_data(&self, ticker_id: i32) -> Result<(), PipeError> {
    let mut b = MessageBuilder::new(CANCEL_MKT_DATA);
    b.push_int(1).push_int(ticker_id);
    self.send(b.into_body())
  }

  fn request_realtime_bars(
    &self,
    req: &MarketDataRequest,
    bar_size: i32,
    what_to_show: &str,
  ) -> Result<(), PipeError> {
    let mut b = MessageBuilder::new(REQ_REAL_TIME_BARS);
    b.push_int(1).push_int(req.ticker_id);
    Self::push_contract(&mut b, req);
    b.push_int(bar_size);
    b.push_str(what_to_show);
    b.push_bool(false); // use regular trading hours only
    self.send(b.into_body())
  }

  fn request_market_depth(&self, req: &MarketDataRequest, num_rows: i32) -> Result<(), PipeError> {
    let mut b = MessageBuilder::new(REQ_MKT_DEPTH);
    b.push_int(3).push_int(req.ticker_id);
    Self::push_contract(&mut b, req);
    b.push_int(num_rows);
    self.send(b.into_body())
  }

  fn cancel_market_depth(&self, ticker_id: i32) -> Result<(), PipeError> {
    let mut b = MessageBuilder::new(CANCEL_MKT_DEPTH);
    b.push_int(1).push_int(ticker_id);
    self.send(b.into_body())
  }

  fn request_historical_data(
    &self,
    req: &MarketDataRequest,
    end_date_time: &str,
    duration: &str,
    bar_size: &str,
    what_to_show: &str,
  ) -> Result<(), PipeError> {
    let mut b = MessageBuilder::new(REQ_HISTORICAL_DATA);
    b.push_int(4).push_int(req.ticker_id);
    Self::push_contract(&mut b, req);
    b.push_str(end_date_time);
    b.push_str(bar_size);
    b.push_str(duration);
    b.push_bool(false); // use regular trading hours only
    b.push_str(what_to_show);
    b.push_int(1); // dates as yyyymmdd strings
    self.send(b.into_body())
  }
}

impl Drop for SocketTransport {
  fn drop(&mut self) {
    self.disconnect();
  }
}
