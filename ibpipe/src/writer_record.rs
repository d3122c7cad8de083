// ibpipe/src/writer_record.rs
// Binary record writer: one length-prefixed wire-encoded Event per dequeued
// item, via the daily-rotated RecordFile. Any I/O error is fatal — a partial
// record makes the rest of the stream unreadable, so the writer stops
// instead of corrupting the file further.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use parking_lot::Mutex;

use crate::engine::EventWatcher;
use crate::event::Event;
use crate::queue::{ErrorAction, Hooks, QueueWorker, QueueWorkerConfig};
use crate::record_file::RecordFile;
use crate::writer::{EventWriter, WriterKind};

pub struct RecordEventWriter {
  source_id: String,
  worker: QueueWorker<Event>,
  ready: Arc<AtomicBool>,
}

impl RecordEventWriter {
  pub fn new(dir: impl Into<PathBuf>, source_id: impl Into<String>) -> RecordEventWriter {
    let source_id = source_id.into();
    let rec = Arc::new(Mutex::new(RecordFile::new(dir.into(), source_id.clone())));
    let ready = Arc::new(AtomicBool::new(true));

    let process_rec = rec.clone();
    let stop_rec = rec;
    let stop_ready = ready.clone();
    let id = source_id.clone();
    let worker = QueueWorker::new(
      QueueWorkerConfig::new(source_id.clone()),
      Hooks::new(move |event: Event| process_rec.lock().writer()?.append(&event))
        .classify(|_| ErrorAction::Fatal)
        .on_start({
          let id = source_id.clone();
          move || info!("Started record writer @{}", id)
        })
        .on_stop(move |remaining| {
          info!("Stopped record writer @{} at queue={}", id, remaining);
          stop_ready.store(false, Ordering::Release);
          if let Err(e) = stop_rec.lock().close() {
            warn!("{}: close failed: {}", id, e);
          }
        }),
    );
    worker.start();
    RecordEventWriter { source_id, worker, ready }
  }
}

impl EventWriter for RecordEventWriter {
  fn kind(&self) -> WriterKind {
    WriterKind::Record
  }

  fn source_id(&self) -> &str {
    &self.source_id
  }

  fn enqueue(&self, event: Event) -> bool {
    self.worker.enqueue(event)
  }

  fn is_ready(&self) -> bool {
    self.ready.load(Ordering::Acquire) && self.worker.is_running()
  }

  fn stop(&self, drain_timeout: Duration) -> usize {
    self.worker.stop(drain_timeout)
  }

  fn processed(&self) -> u64 {
    self.worker.processed()
  }

  fn dropped(&self) -> u64 {
    self.worker.dropped()
  }
}

impl EventWatcher for RecordEventWriter {
  fn update(&self, event: &Event) {
    self.enqueue(event.clone());
  }
}
