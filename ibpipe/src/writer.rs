// ibpipe/src/writer.rs
// Common surface of the persistence writers. Each writer owns one
// QueueWorker<Event> and one output resource; the manager addresses them by
// (source id, kind) to avoid starting duplicates for the same connection.

use std::fmt;
use std::time::Duration;

use crate::event::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriterKind {
  Csv,
  Record,
  Columnar,
}

impl fmt::Display for WriterKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      WriterKind::Csv => f.write_str("csv"),
      WriterKind::Record => f.write_str("record"),
      WriterKind::Columnar => f.write_str("columnar"),
    }
  }
}

pub trait EventWriter: Send + Sync {
  fn kind(&self) -> WriterKind;

  /// Identity of the connection this writer persists; used by the
  /// management layer for duplicate detection.
  fn source_id(&self) -> &str;

  /// Queues one event for persistence. Best-effort: returns false when the
  /// writer is stopped or its queue rejected the item.
  fn enqueue(&self, event: Event) -> bool;

  /// True while the underlying resource is usable. A writer that turns
  /// unready is discovered by polling, never by an exception surfacing
  /// through unrelated code paths.
  fn is_ready(&self) -> bool;

  /// Stops the worker, draining the queue up to the timeout. Returns the
  /// number of discarded items.
  fn stop(&self, drain_timeout: Duration) -> usize;

  fn processed(&self) -> u64;

  fn dropped(&self) -> u64;
}
