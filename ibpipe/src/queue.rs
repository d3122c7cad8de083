// ibpipe/src/queue.rs
// Bounded-queue, single-consumer worker. One instance owns exactly one
// background thread that drains a bounded channel in FIFO order; any number
// of producers may enqueue concurrently. All persistence writers are thin
// specializations of this type, which is what guarantees a writer never
// interleaves output from two threads onto the same file.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::base::PipeError;

/// How the worker's error policy classifies a processing failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
  /// Log, drop the failed item, keep the worker alive. At-most-once: the
  /// item is not redelivered.
  Retry,
  /// Stop the worker and release its resources.
  Fatal,
}

/// Behavior of `enqueue` when the bounded queue is full.
#[derive(Debug, Clone, Copy)]
pub enum FullQueuePolicy {
  /// Block the producer up to the given duration, then drop the new item.
  Block(Duration),
  /// Evict the oldest queued item to make room.
  DropOldest,
  /// Silently drop the new item (counted, enqueue still reports success).
  DropNewest,
  /// Drop the new item and report failure to the producer.
  Reject,
}

#[derive(Debug, Clone)]
pub struct QueueWorkerConfig {
  pub name: String,
  pub capacity: usize,
  pub full_queue: FullQueuePolicy,
}

impl QueueWorkerConfig {
  pub fn new(name: impl Into<String>) -> QueueWorkerConfig {
    QueueWorkerConfig {
      name: name.into(),
      capacity: 100,
      full_queue: FullQueuePolicy::Block(Duration::from_secs(1)),
    }
  }

  pub fn capacity(mut self, capacity: usize) -> Self {
    self.capacity = capacity;
    self
  }

  pub fn full_queue(mut self, policy: FullQueuePolicy) -> Self {
    self.full_queue = policy;
    self
  }
}

/// The processing closure and life-cycle hooks for one worker.
pub struct Hooks<T> {
  process: Box<dyn FnMut(T) -> Result<(), PipeError> + Send>,
  classify: Box<dyn Fn(&PipeError) -> ErrorAction + Send>,
  on_start: Box<dyn FnMut() + Send>,
  on_stop: Box<dyn FnMut(usize) + Send>,
}

impl<T> Hooks<T> {
  pub fn new(process: impl FnMut(T) -> Result<(), PipeError> + Send + 'static) -> Hooks<T> {
    Hooks {
      process: Box::new(process),
      classify: Box::new(|_| ErrorAction::Retry),
      on_start: Box::new(|| {}),
      on_stop: Box::new(|_| {}),
    }
  }

  pub fn classify(mut self, f: impl Fn(&PipeError) -> ErrorAction + Send + 'static) -> Self {
    self.classify = Box::new(f);
    self
  }

  pub fn on_start(mut self, f: impl FnMut() + Send + 'static) -> Self {
    self.on_start = Box::new(f);
    self
  }

  /// Invoked exactly once when the worker loop exits, with the count of
  /// items left unprocessed on the queue.
  pub fn on_stop(mut self, f: impl FnMut(usize) + Send + 'static) -> Self {
    self.on_stop = Box::new(f);
    self
  }
}

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct QueueWorker<T> {
  name: String,
  policy: FullQueuePolicy,
  tx: Sender<T>,
  rx: Receiver<T>,
  accepting: Arc<AtomicBool>,
  running: Arc<AtomicBool>,
  stop_requested: Arc<AtomicBool>,
  abort: Arc<AtomicBool>,
  processed: Arc<AtomicU64>,
  dropped: Arc<AtomicU64>,
  hooks: Mutex<Option<Hooks<T>>>,
  handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl<T: Send + 'static> QueueWorker<T> {
  pub fn new(config: QueueWorkerConfig, hooks: Hooks<T>) -> QueueWorker<T> {
    let (tx, rx) = bounded(config.capacity);
    QueueWorker {
      name: config.name,
      policy: config.full_queue,
      tx,
      rx,
      accepting: Arc::new(AtomicBool::new(true)),
      running: Arc::new(AtomicBool::new(false)),
      stop_requested: Arc::new(AtomicBool::new(false)),
      abort: Arc::new(AtomicBool::new(false)),
      processed: Arc::new(AtomicU64::new(0)),
      dropped: Arc::new(AtomicU64::new(0)),
      hooks: Mutex::new(Some(hooks)),
      handle: Mutex::new(None),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn is_running(&self) -> bool {
    self.running.load(Ordering::Acquire)
  }

  pub fn processed(&self) -> u64 {
    self.processed.load(Ordering::Relaxed)
  }

  /// Count of items lost to a full queue or a stopped worker.
  pub fn dropped(&self) -> u64 {
    self.dropped.load(Ordering::Relaxed)
  }

  pub fn queue_depth(&self) -> usize {
    self.rx.len()
  }

  /// Spawns the consumer thread. Idempotent: a second call is a no-op.
  pub fn start(&self) -> bool {
    let mut hooks = match self.hooks.lock().take() {
      Some(h) => h,
      None => {
        debug!("QueueWorker {} already started", self.name);
        return false;
      }
    };
    self.running.store(true, Ordering::Release);

    let name = self.name.clone();
    let rx = self.rx.clone();
    let running = self.running.clone();
    let accepting = self.accepting.clone();
    let stop_requested = self.stop_requested.clone();
    let abort = self.abort.clone();
    let processed = self.processed.clone();

    let handle = thread::Builder::new()
      .name(format!("queue-{}", name))
      .spawn(move || {
        (hooks.on_start)();
        info!("QueueWorker {} started", name);
        loop {
          if abort.load(Ordering::Acquire) {
            break;
          }
          if stop_requested.load(Ordering::Acquire) && rx.is_empty() {
            break;
          }
          match rx.recv_timeout(POLL_INTERVAL) {
            Ok(item) => match (hooks.process)(item) {
              Ok(()) => {
                processed.fetch_add(1, Ordering::Relaxed);
              }
              Err(e) => match (hooks.classify)(&e) {
                ErrorAction::Retry => {
                  warn!("QueueWorker {}: retryable error, item dropped: {}", name, e);
                }
                ErrorAction::Fatal => {
                  error!("QueueWorker {}: fatal error, stopping: {}", name, e);
                  break;
                }
              },
            },
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
          }
        }
        accepting.store(false, Ordering::Release);
        running.store(false, Ordering::Release);
        let remaining = rx.len();
        (hooks.on_stop)(remaining);
        info!("QueueWorker {} stopped, {} items unprocessed", name, remaining);
      })
      .expect("failed to spawn queue worker thread");

    *self.handle.lock() = Some(handle);
    true
  }

  /// Best-effort push. Returns false when the item was not queued (worker
  /// stopped, or queue full under a rejecting policy).
  pub fn enqueue(&self, item: T) -> bool {
    if !self.accepting.load(Ordering::Acquire) {
      self.dropped.fetch_add(1, Ordering::Relaxed);
      return false;
    }
    match self.policy {
      FullQueuePolicy::Block(timeout) => {
        if self.tx.send_timeout(item, timeout).is_err() {
          self.dropped.fetch_add(1, Ordering::Relaxed);
          return false;
        }
        true
      }
      FullQueuePolicy::DropOldest => {
        if self.tx.is_full() {
          if self.rx.try_recv().is_ok() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
          }
        }
        if self.tx.try_send(item).is_err() {
          self.dropped.fetch_add(1, Ordering::Relaxed);
          return false;
        }
        true
      }
      FullQueuePolicy::DropNewest => {
        if self.tx.try_send(item).is_err() {
          self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        true
      }
      FullQueuePolicy::Reject => {
        if self.tx.try_send(item).is_err() {
          self.dropped.fetch_add(1, Ordering::Relaxed);
          return false;
        }
        true
      }
    }
  }

  /// Stops accepting new items, waits up to `drain_timeout` for the queue
  /// to empty, then joins the worker. Items still queued after the drain
  /// window are discarded (their count goes to the `on_stop` hook).
  /// Idempotent and safe to call after a fatal self-stop.
  pub fn stop(&self, drain_timeout: Duration) -> usize {
    self.accepting.store(false, Ordering::Release);
    self.stop_requested.store(true, Ordering::Release);

    let deadline = Instant::now() + drain_timeout;
    while self.running.load(Ordering::Acquire)
      && !self.rx.is_empty()
      && Instant::now() < deadline
    {
      thread::sleep(Duration::from_millis(5));
    }
    self.abort.store(true, Ordering::Release);

    if let Some(handle) = self.handle.lock().take() {
      if let Err(e) = handle.join() {
        error!("QueueWorker {}: worker thread panicked: {:?}", self.name, e);
      }
    }
    self.rx.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;

  #[test]
  fn fifo_at_most_once() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let worker = QueueWorker::new(
      QueueWorkerConfig::new("fifo").capacity(200),
      Hooks::new(move |item: u32| {
        sink.lock().push(item);
        Ok(())
      }),
    );
    assert!(worker.start());
    assert!(!worker.start()); // idempotent
    for i in 1..=100u32 {
      assert!(worker.enqueue(i));
    }
    let remaining = worker.stop(Duration::from_secs(5));
    assert_eq!(remaining, 0);
    assert_eq!(worker.processed(), 100);
    let seen = seen.lock();
    assert_eq!(*seen, (1..=100u32).collect::<Vec<_>>());
  }

  #[test]
  fn fatal_error_stops_worker() {
    let stopped_with = Arc::new(AtomicUsize::new(usize::MAX));
    let stopped = stopped_with.clone();
    let worker = QueueWorker::new(
      QueueWorkerConfig::new("fatal").capacity(50),
      Hooks::new(|item: u32| {
        if item == 3 {
          Err(PipeError::IoError("disk gone".to_string()))
        } else {
          Ok(())
        }
      })
      .classify(|_| ErrorAction::Fatal)
      .on_stop(move |remaining| {
        stopped.store(remaining, Ordering::SeqCst);
      }),
    );
    // Queue everything before starting so the remaining count after the
    // failure at item 3 is deterministic.
    for i in 1..=5u32 {
      assert!(worker.enqueue(i));
    }
    worker.start();
    let deadline = Instant::now() + Duration::from_secs(5);
    while worker.is_running() && Instant::now() < deadline {
      thread::sleep(Duration::from_millis(5));
    }
    assert!(!worker.is_running());
    assert_eq!(stopped_with.load(Ordering::SeqCst), 2); // items 4 and 5
    assert_eq!(worker.processed(), 2); // items 1 and 2
    // Enqueue after stop must not crash; it is rejected and counted.
    assert!(!worker.enqueue(99));
    worker.stop(Duration::from_millis(100));
  }

  #[test]
  fn retryable_error_drops_item_and_continues() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let worker = QueueWorker::new(
      QueueWorkerConfig::new("retry"),
      Hooks::new(move |item: u32| {
        if item % 2 == 0 {
          Err(PipeError::IoError("transient".to_string()))
        } else {
          sink.lock().push(item);
          Ok(())
        }
      }),
    );
    worker.start();
    for i in 1..=6u32 {
      worker.enqueue(i);
    }
    worker.stop(Duration::from_secs(5));
    assert_eq!(*seen.lock(), vec![1, 3, 5]);
    assert_eq!(worker.processed(), 3);
  }

  #[test]
  fn reject_policy_counts_drops() {
    let worker: QueueWorker<u32> = QueueWorker::new(
      QueueWorkerConfig::new("full").capacity(2).full_queue(FullQueuePolicy::Reject),
      Hooks::new(|_| Ok(())),
    );
    // Not started: items stay queued.
    assert!(worker.enqueue(1));
    assert!(worker.enqueue(2));
    assert!(!worker.enqueue(3));
    assert_eq!(worker.dropped(), 1);
    assert_eq!(worker.queue_depth(), 2);
  }

  #[test]
  fn drop_oldest_policy_evicts_head() {
    let worker: QueueWorker<u32> = QueueWorker::new(
      QueueWorkerConfig::new("evict").capacity(2).full_queue(FullQueuePolicy::DropOldest),
      Hooks::new(|_| Ok(())),
    );
    assert!(worker.enqueue(1));
    assert!(worker.enqueue(2));
    assert!(worker.enqueue(3));
    assert_eq!(worker.dropped(), 1);
    assert_eq!(worker.queue_depth(), 2);
  }

  #[test]
  fn stop_without_start_is_safe() {
    let worker: QueueWorker<u32> = QueueWorker::new(
      QueueWorkerConfig::new("idle"),
      Hooks::new(|_| Ok(())),
    );
    worker.enqueue(1);
    assert_eq!(worker.stop(Duration::from_millis(50)), 1);
    assert!(!worker.enqueue(2));
  }
}
