// ibpipe/src/manager.rs
// Top-level assembly: owns the dispatch engine, the set of named clients and
// the per-(source, kind) writers. Starting a writer registers it with the
// engine under a source filter; asking twice for the same pair returns the
// one already running.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use parking_lot::Mutex;

use crate::base::PipeError;
use crate::client::TwsClient;
use crate::engine::{EventEngine, WatcherHandle};
use crate::writer::{EventWriter, WriterKind};
use crate::writer_columnar::ColumnarWriter;
use crate::writer_csv::CsvWriter;
use crate::writer_record::RecordEventWriter;

struct ManagedWriter {
  writer: Arc<dyn EventWriter>,
  handle: WatcherHandle,
}

pub struct PipeManager {
  engine: Arc<EventEngine>,
  data_dir: PathBuf,
  clients: Mutex<HashMap<String, Arc<TwsClient>>>,
  writers: Mutex<HashMap<(String, WriterKind), ManagedWriter>>,
}

impl PipeManager {
  /// Creates the manager with a running engine. `data_dir` is where every
  /// writer places its daily files.
  pub fn new(data_dir: impl Into<PathBuf>) -> PipeManager {
    let engine = EventEngine::with_default_backend();
    engine.start();
    PipeManager {
      engine,
      data_dir: data_dir.into(),
      clients: Mutex::new(HashMap::new()),
      writers: Mutex::new(HashMap::new()),
    }
  }

  pub fn engine(&self) -> &Arc<EventEngine> {
    &self.engine
  }

  pub fn data_dir(&self) -> &PathBuf {
    &self.data_dir
  }

  pub fn add_client(&self, client: Arc<TwsClient>) -> Result<(), PipeError> {
    let mut clients = self.clients.lock();
    let name = client.name().to_string();
    if clients.contains_key(&name) {
      return Err(PipeError::AlreadyRunning(name));
    }
    info!("Managing client {}", name);
    clients.insert(name, client);
    Ok(())
  }

  pub fn client(&self, name: &str) -> Option<Arc<TwsClient>> {
    self.clients.lock().get(name).cloned()
  }

  pub fn remove_client(&self, name: &str) -> Option<Arc<TwsClient>> {
    self.clients.lock().remove(name)
  }

  /// Starts a writer for one source, or returns the one already running for
  /// the same (source, kind) pair.
  pub fn start_writer(
    &self,
    source_id: &str,
    kind: WriterKind,
  ) -> Result<Arc<dyn EventWriter>, PipeError> {
    let key = (source_id.to_string(), kind);
    let mut writers = self.writers.lock();
    if let Some(existing) = writers.get(&key) {
      warn!("{} writer for {} already running", kind, source_id);
      return Ok(existing.writer.clone());
    }
    let expr = "select * from Event where source=?";
    let params = [source_id.to_string()];
    let managed = match kind {
      WriterKind::Csv => {
        let w = Arc::new(CsvWriter::new(&self.data_dir, source_id));
        let handle = self.engine.add(w.clone(), expr, &params)?;
        ManagedWriter { writer: w, handle }
      }
      WriterKind::Record => {
        let w = Arc::new(RecordEventWriter::new(&self.data_dir, source_id));
        let handle = self.engine.add(w.clone(), expr, &params)?;
        ManagedWriter { writer: w, handle }
      }
      WriterKind::Columnar => {
        let w = Arc::new(ColumnarWriter::new(&self.data_dir, source_id));
        let handle = self.engine.add(w.clone(), expr, &params)?;
        ManagedWriter { writer: w, handle }
      }
    };
    info!("Started {} writer for {}", kind, source_id);
    let writer = managed.writer.clone();
    writers.insert(key, managed);
    Ok(writer)
  }

  /// Unregisters and stops one writer, returning the number of events it
  /// discarded, or None if no such writer was running.
  pub fn stop_writer(
    &self,
    source_id: &str,
    kind: WriterKind,
    drain_timeout: Duration,
  ) -> Option<usize> {
    let managed = self.writers.lock().remove(&(source_id.to_string(), kind))?;
    managed.handle.halt();
    let discarded = managed.writer.stop(drain_timeout);
    info!("Stopped {} writer for {} ({} discarded)", kind, source_id, discarded);
    Some(discarded)
  }

  pub fn writer_count(&self) -> usize {
    self.writers.lock().len()
  }

  /// Orderly teardown: every writer drains, every client disconnects, the
  /// engine stops.
  pub fn shutdown(&self, drain_timeout: Duration) {
    info!("Shutting down pipeline");
    let writers: Vec<ManagedWriter> = {
      let mut map = self.writers.lock();
      map.drain().map(|(_, v)| v).collect()
    };
    for managed in &writers {
      managed.handle.halt();
    }
    for managed in writers {
      let discarded = managed.writer.stop(drain_timeout);
      if discarded > 0 {
        warn!(
          "{} writer for {} discarded {} events on shutdown",
          managed.writer.kind(),
          managed.writer.source_id(),
          discarded
        );
      }
    }
    let clients: Vec<Arc<TwsClient>> = {
      let mut map = self.clients.lock();
      map.drain().map(|(_, v)| v).collect()
    };
    for client in clients {
      client.disconnect();
    }
    self.engine.stop();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::ApiRegistry;
  use crate::event::FieldValue;

  fn tick(source: &str, ts: u64, price: f64) -> crate::event::Event {
    ApiRegistry::standard()
      .get("tickPrice")
      .unwrap()
      .build(
        source,
        ts,
        &[
          FieldValue::Int(1000),
          FieldValue::Int(0),
          FieldValue::Double(price),
          FieldValue::Int(0),
        ],
      )
      .unwrap()
  }

  #[test]
  fn duplicate_writer_returns_existing() {
    let dir = tempfile::tempdir().unwrap();
    let manager = PipeManager::new(dir.path());
    let first = manager.start_writer("acct-1", WriterKind::Csv).unwrap();
    let second = manager.start_writer("acct-1", WriterKind::Csv).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(manager.writer_count(), 1);
    // A different kind for the same source is a separate writer.
    manager.start_writer("acct-1", WriterKind::Record).unwrap();
    assert_eq!(manager.writer_count(), 2);
    manager.shutdown(Duration::from_secs(5));
  }

  #[test]
  fn writer_receives_only_its_source() {
    let dir = tempfile::tempdir().unwrap();
    let manager = PipeManager::new(dir.path());
    manager.start_writer("acct-1", WriterKind::Csv).unwrap();
    for i in 0..10u64 {
      manager.engine().post(&tick("acct-1", 1000 + i, 45.0));
      manager.engine().post(&tick("acct-2", 2000 + i, 46.0));
    }
    assert_eq!(manager.stop_writer("acct-1", WriterKind::Csv, Duration::from_secs(5)), Some(0));
    assert_eq!(manager.writer_count(), 0);

    let day = chrono::Local::now().date_naive();
    let path = dir.path().join(format!("{}-acct-1.csv", day.format("%Y-%m-%d")));
    let contents = std::fs::read_to_string(path).unwrap();
    let lines: Vec<&str> = contents.lines().filter(|l| !l.starts_with("##")).collect();
    assert_eq!(lines.len(), 10);
    manager.shutdown(Duration::from_secs(1));
  }

  #[test]
  fn stop_writer_for_unknown_pair_is_none() {
    let dir = tempfile::tempdir().unwrap();
    let manager = PipeManager::new(dir.path());
    assert_eq!(manager.stop_writer("nope", WriterKind::Csv, Duration::from_millis(10)), None);
  }

  #[test]
  fn shutdown_stops_engine_and_writers() {
    let dir = tempfile::tempdir().unwrap();
    let manager = PipeManager::new(dir.path());
    let writer = manager.start_writer("acct-1", WriterKind::Record).unwrap();
    manager.engine().post(&tick("acct-1", 1, 45.0));
    manager.shutdown(Duration::from_secs(5));
    assert!(!writer.is_ready());
    assert_eq!(manager.writer_count(), 0);
    assert_eq!(manager.engine().state(), crate::engine::EngineState::Stopped);
  }
}
