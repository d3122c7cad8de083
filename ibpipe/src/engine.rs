// ibpipe/src/engine.rs
// Event dispatch engine. Watchers register a filter expression; posted
// events fan out to every watcher whose filter matches. Expression
// evaluation itself is delegated to a pluggable SubscriptionBackend, so the
// engine owns only the watcher lifecycle and the counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::base::PipeError;
use crate::event::Event;

/// A registered consumer of dispatched events.
pub trait EventWatcher: Send + Sync {
  fn update(&self, event: &Event);
}

pub type FilterFn = Box<dyn Fn(&Event) -> bool + Send + Sync>;

/// Compiles a filter expression with positional `?` parameters into a
/// predicate. The engine never interprets the expression language itself;
/// swapping in a real CEP runtime means swapping this trait impl.
pub trait SubscriptionBackend: Send + Sync {
  fn compile(&self, expr: &str, params: &[String]) -> Result<FilterFn, PipeError>;
}

/// Minimal backend for the statement shape the pipeline actually uses:
/// `select * from Event [where <key>=<value> [and ...]]` with `source` and
/// `method` as filterable keys, values either `?` (bound from `params` in
/// order) or a quoted literal.
pub struct SelectFilterBackend;

impl SubscriptionBackend for SelectFilterBackend {
  fn compile(&self, expr: &str, params: &[String]) -> Result<FilterFn, PipeError> {
    let expr = expr.trim();
    let lower = expr.to_lowercase();
    if !lower.starts_with("select * from event") {
      return Err(PipeError::Misconfigured(format!("unsupported statement: {}", expr)));
    }
    let rest = expr["select * from event".len()..].trim();
    if rest.is_empty() {
      return Ok(Box::new(|_| true));
    }
    let lower_rest = rest.to_lowercase();
    if !lower_rest.starts_with("where") {
      return Err(PipeError::Misconfigured(format!("unsupported clause: {}", rest)));
    }
    let clause = rest["where".len()..].trim();

    enum Cond {
      Source(String),
      Method(String),
    }
    let mut conds = Vec::new();
    let mut param_iter = params.iter();
    for part in clause.split(" and ") {
      let (key, raw) = part
        .split_once('=')
        .ok_or_else(|| PipeError::Misconfigured(format!("bad condition: {}", part)))?;
      let raw = raw.trim();
      let value = if raw == "?" {
        param_iter
          .next()
          .ok_or_else(|| {
            PipeError::Misconfigured(format!("missing parameter for condition: {}", part))
          })?
          .clone()
      } else {
        raw.trim_matches('\'').to_string()
      };
      match key.trim().to_lowercase().as_str() {
        "source" => conds.push(Cond::Source(value)),
        "method" => conds.push(Cond::Method(value)),
        other => {
          return Err(PipeError::Misconfigured(format!("unknown filter key: {}", other)));
        }
      }
    }
    Ok(Box::new(move |event| {
      conds.iter().all(|c| match c {
        Cond::Source(s) => event.source() == s,
        Cond::Method(m) => event.method().as_str() == m,
      })
    }))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
  Initialized,
  Running,
  Stopped,
}

struct Registration {
  filter: FilterFn,
  watcher: Arc<dyn EventWatcher>,
}

pub struct EventEngine {
  backend: Box<dyn SubscriptionBackend>,
  state: Mutex<EngineState>,
  watchers: Mutex<HashMap<u64, Registration>>,
  next_id: AtomicU64,
  posted: AtomicU64,
}

impl EventEngine {
  pub fn new(backend: Box<dyn SubscriptionBackend>) -> Arc<EventEngine> {
    Arc::new(EventEngine {
      backend,
      state: Mutex::new(EngineState::Initialized),
      watchers: Mutex::new(HashMap::new()),
      next_id: AtomicU64::new(1),
      posted: AtomicU64::new(0),
    })
  }

  pub fn with_default_backend() -> Arc<EventEngine> {
    EventEngine::new(Box::new(SelectFilterBackend))
  }

  pub fn state(&self) -> EngineState {
    *self.state.lock()
  }

  pub fn start(&self) {
    let mut state = self.state.lock();
    if *state == EngineState::Running {
      return;
    }
    info!("Event engine running");
    *state = EngineState::Running;
  }

  pub fn stop(&self) {
    let mut state = self.state.lock();
    if *state == EngineState::Stopped {
      return;
    }
    info!("Event engine stopped");
    *state = EngineState::Stopped;
  }

  /// Registers a watcher against a filter expression. The returned handle
  /// unregisters on `halt()`.
  pub fn add(
    self: &Arc<Self>,
    watcher: Arc<dyn EventWatcher>,
    expr: &str,
    params: &[String],
  ) -> Result<WatcherHandle, PipeError> {
    if self.state() == EngineState::Stopped {
      return Err(PipeError::Misconfigured("engine is stopped".to_string()));
    }
    let filter = self.backend.compile(expr, params)?;
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    self.watchers.lock().insert(id, Registration { filter, watcher });
    debug!("Registered watcher {} for statement: {}", id, expr);
    Ok(WatcherHandle { id, engine: Arc::downgrade(self) })
  }

  /// Fire-and-forget dispatch. Posting to a stopped or not-yet-started
  /// engine is a logged no-op: nobody is listening, it is not an error.
  pub fn post(&self, event: &Event) {
    if self.state() != EngineState::Running {
      warn!("Event engine not running; dropping {} event", event.method());
      return;
    }
    self.posted.fetch_add(1, Ordering::Relaxed);
    // Snapshot the matching watchers so a slow update (e.g. a writer
    // blocking on a full queue) cannot stall other posters or registration.
    let matched: Vec<Arc<dyn EventWatcher>> = {
      let watchers = self.watchers.lock();
      watchers
        .values()
        .filter(|reg| (reg.filter)(event))
        .map(|reg| reg.watcher.clone())
        .collect()
    };
    for watcher in matched {
      watcher.update(event);
    }
  }

  /// Monotonic count of events accepted by `post` while running.
  pub fn event_count(&self) -> u64 {
    self.posted.load(Ordering::Relaxed)
  }

  pub fn watcher_count(&self) -> usize {
    self.watchers.lock().len()
  }

  fn remove(&self, id: u64) {
    if self.watchers.lock().remove(&id).is_some() {
      debug!("Unregistered watcher {}", id);
    }
  }
}

/// Registration handle; `halt()` detaches the watcher from the engine.
pub struct WatcherHandle {
  id: u64,
  engine: Weak<EventEngine>,
}

impl WatcherHandle {
  pub fn halt(&self) {
    if let Some(engine) = self.engine.upgrade() {
      engine.remove(self.id);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::ApiRegistry;
  use crate::event::FieldValue;

  struct Recorder {
    seen: Mutex<Vec<Event>>,
  }

  impl Recorder {
    fn new() -> Arc<Recorder> {
      Arc::new(Recorder { seen: Mutex::new(Vec::new()) })
    }
  }

  impl EventWatcher for Recorder {
    fn update(&self, event: &Event) {
      self.seen.lock().push(event.clone());
    }
  }

  fn tick(source: &str, ts: u64) -> Event {
    ApiRegistry::standard()
      .get("tickSize")
      .unwrap()
      .build(source, ts, &[FieldValue::Int(1), FieldValue::Int(0), FieldValue::Int(9)])
      .unwrap()
  }

  #[test]
  fn source_filter_fans_out_to_matching_watchers() {
    let engine = EventEngine::with_default_backend();
    engine.start();
    let a = Recorder::new();
    let b = Recorder::new();
    engine
      .add(a.clone(), "select * from Event where source=?", &["acct-1".to_string()])
      .unwrap();
    engine
      .add(b.clone(), "select * from Event where source=?", &["acct-2".to_string()])
      .unwrap();

    engine.post(&tick("acct-1", 1));
    engine.post(&tick("acct-2", 2));
    engine.post(&tick("acct-1", 3));

    assert_eq!(engine.event_count(), 3);
    assert_eq!(a.seen.lock().len(), 2);
    assert_eq!(b.seen.lock().len(), 1);
  }

  #[test]
  fn method_and_literal_filters() {
    let engine = EventEngine::with_default_backend();
    engine.start();
    let w = Recorder::new();
    engine
      .add(w.clone(), "select * from Event where source='acct-1' and method=?",
           &["tickSize".to_string()])
      .unwrap();
    engine.post(&tick("acct-1", 1));
    engine.post(&tick("acct-9", 2));
    assert_eq!(w.seen.lock().len(), 1);
  }

  #[test]
  fn halt_unregisters_watcher() {
    let engine = EventEngine::with_default_backend();
    engine.start();
    let w = Recorder::new();
    let handle = engine.add(w.clone(), "select * from Event", &[]).unwrap();
    engine.post(&tick("acct-1", 1));
    handle.halt();
    assert_eq!(engine.watcher_count(), 0);
    engine.post(&tick("acct-1", 2));
    assert_eq!(w.seen.lock().len(), 1);
  }

  #[test]
  fn watcher_may_use_engine_during_update() {
    use std::sync::atomic::AtomicUsize;

    // Dispatch must not hold the registration lock across update calls;
    // a watcher is allowed to query or halt on the engine it hangs off.
    struct Introspect {
      engine: Mutex<Option<Arc<EventEngine>>>,
      seen: AtomicUsize,
    }

    impl EventWatcher for Introspect {
      fn update(&self, _event: &Event) {
        if let Some(engine) = self.engine.lock().as_ref() {
          self.seen.store(engine.watcher_count(), Ordering::SeqCst);
        }
      }
    }

    let engine = EventEngine::with_default_backend();
    engine.start();
    let w = Arc::new(Introspect { engine: Mutex::new(None), seen: AtomicUsize::new(0) });
    *w.engine.lock() = Some(engine.clone());
    engine.add(w.clone(), "select * from Event", &[]).unwrap();
    engine.post(&tick("acct-1", 1));
    assert_eq!(w.seen.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn post_after_stop_is_noop() {
    let engine = EventEngine::with_default_backend();
    engine.start();
    let w = Recorder::new();
    engine.add(w.clone(), "select * from Event", &[]).unwrap();
    engine.stop();
    engine.post(&tick("acct-1", 1));
    assert_eq!(engine.event_count(), 0);
    assert!(w.seen.lock().is_empty());
  }

  #[test]
  fn bad_statement_is_rejected() {
    let engine = EventEngine::with_default_backend();
    engine.start();
    let w = Recorder::new();
    assert!(engine.add(w, "drop table Event", &[]).is_err());
  }
}
