// ibpipe/src/writer_columnar.rs
// Columnar writer: batches events and appends one column-oriented block per
// flush to a daily file. Blocks are serde structs written with bincode;
// reading a file back is a sequence of deserializations until EOF. Like the
// binary record writer, any I/O error is fatal.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::base::PipeError;
use crate::engine::EventWatcher;
use crate::event::{Event, FieldValue};
use crate::queue::{ErrorAction, Hooks, QueueWorker, QueueWorkerConfig};
use crate::writer::{EventWriter, WriterKind};

pub const DEFAULT_BATCH_SIZE: usize = 64;

/// One column-oriented batch of events. `columns[slot][row]` holds the
/// positional field values; rows whose method has fewer arguments than the
/// widest row in the batch carry `None` in the trailing slots.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ColumnBlock {
  pub timestamps: Vec<u64>,
  pub methods: Vec<u32>,
  pub sources: Vec<String>,
  pub columns: Vec<Vec<Option<FieldValue>>>,
}

impl ColumnBlock {
  pub fn from_events(events: &[Event]) -> ColumnBlock {
    let width = events.iter().map(|e| e.fields().len()).max().unwrap_or(0);
    let mut block = ColumnBlock {
      timestamps: Vec::with_capacity(events.len()),
      methods: Vec::with_capacity(events.len()),
      sources: Vec::with_capacity(events.len()),
      columns: vec![Vec::with_capacity(events.len()); width],
    };
    for event in events {
      block.timestamps.push(event.timestamp());
      block.methods.push(u32::from(event.method()));
      block.sources.push(event.source().to_string());
      for slot in 0..width {
        block.columns[slot].push(
          event.fields().get(slot).and_then(|f| f.value().cloned()),
        );
      }
    }
    block
  }

  pub fn len(&self) -> usize {
    self.timestamps.len()
  }

  pub fn is_empty(&self) -> bool {
    self.timestamps.is_empty()
  }
}

/// Reads back every block of a columnar file, in append order.
pub fn read_blocks(path: impl AsRef<Path>) -> Result<Vec<ColumnBlock>, PipeError> {
  let file = File::open(path.as_ref())?;
  let mut input = BufReader::new(file);
  let mut blocks = Vec::new();
  loop {
    match bincode::deserialize_from::<_, ColumnBlock>(&mut input) {
      Ok(block) => blocks.push(block),
      Err(e) => match *e {
        bincode::ErrorKind::Io(ref io) if io.kind() == ErrorKind::UnexpectedEof => break,
        other => return Err(PipeError::DecodeError(format!("bad column block: {}", other))),
      },
    }
  }
  Ok(blocks)
}

struct ColumnarSink {
  dir: PathBuf,
  source_id: String,
  out: Option<BufWriter<File>>,
  last_day: Option<NaiveDate>,
  batch: Vec<Event>,
  batch_size: usize,
}

impl ColumnarSink {
  fn file_name(&self, day: NaiveDate) -> PathBuf {
    self.dir.join(format!("{}-{}.col", day.format("%Y-%m-%d"), self.source_id))
  }

  fn open(&mut self) -> Result<&mut BufWriter<File>, PipeError> {
    let today = chrono::Local::now().date_naive();
    if self.out.is_none() || self.last_day != Some(today) {
      if let Some(mut old) = self.out.take() {
        let _ = old.flush();
      }
      let path = self.file_name(today);
      let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| {
          PipeError::ResourceClosed(format!("cannot open {}: {}", path.display(), e))
        })?;
      info!("{}: writing column blocks to {}", self.source_id, path.display());
      self.out = Some(BufWriter::new(file));
      self.last_day = Some(today);
    }
    Ok(self.out.as_mut().unwrap())
  }

  fn push(&mut self, event: Event) -> Result<(), PipeError> {
    self.batch.push(event);
    if self.batch.len() >= self.batch_size {
      self.flush_batch()?;
    }
    Ok(())
  }

  fn flush_batch(&mut self) -> Result<(), PipeError> {
    if self.batch.is_empty() {
      return Ok(());
    }
    let block = ColumnBlock::from_events(&self.batch);
    let out = self.open()?;
    bincode::serialize_into(&mut *out, &block)
      .map_err(|e| PipeError::IoError(format!("column block write: {}", e)))?;
    out.flush()?;
    self.batch.clear();
    Ok(())
  }

  fn close(&mut self) -> Result<(), PipeError> {
    self.flush_batch()?;
    if let Some(mut out) = self.out.take() {
      out.flush()?;
    }
    self.last_day = None;
    Ok(())
  }
}

pub struct ColumnarWriter {
  source_id: String,
  worker: QueueWorker<Event>,
  ready: Arc<AtomicBool>,
}

impl ColumnarWriter {
  pub fn new(dir: impl Into<PathBuf>, source_id: impl Into<String>) -> ColumnarWriter {
    Self::with_batch_size(dir, source_id, DEFAULT_BATCH_SIZE)
  }

  pub fn with_batch_size(
    dir: impl Into<PathBuf>,
    source_id: impl Into<String>,
    batch_size: usize,
  ) -> ColumnarWriter {
    let source_id = source_id.into();
    let sink = Arc::new(Mutex::new(ColumnarSink {
      dir: dir.into(),
      source_id: source_id.clone(),
      out: None,
      last_day: None,
      batch: Vec::new(),
      batch_size: batch_size.max(1),
    }));
    let ready = Arc::new(AtomicBool::new(true));

    let process_sink = sink.clone();
    let stop_sink = sink;
    let stop_ready = ready.clone();
    let id = source_id.clone();
    let worker = QueueWorker::new(
      QueueWorkerConfig::new(source_id.clone()),
      Hooks::new(move |event: Event| process_sink.lock().push(event))
        .classify(|_| ErrorAction::Fatal)
        .on_start({
          let id = source_id.clone();
          move || info!("Started columnar writer @{}", id)
        })
        .on_stop(move |remaining| {
          info!("Stopped columnar writer @{} at queue={}", id, remaining);
          stop_ready.store(false, Ordering::Release);
          if let Err(e) = stop_sink.lock().close() {
            warn!("{}: close failed: {}", id, e);
          }
        }),
    );
    worker.start();
    ColumnarWriter { source_id, worker, ready }
  }
}

impl EventWriter for ColumnarWriter {
  fn kind(&self) -> WriterKind {
    WriterKind::Columnar
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

impl EventWatcher for ColumnarWriter {
  fn update(&self, event: &Event) {
    self.enqueue(event.clone());
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::ApiRegistry;

  #[test]
  fn partial_batch_flushes_on_stop() {
    let dir = tempfile::tempdir().unwrap();
    let registry = ApiRegistry::standard();
    let tick = registry.get("tickPrice").unwrap();
    let time = registry.get("currentTime").unwrap();
    let writer = ColumnarWriter::with_batch_size(dir.path(), "acct-1", 10);

    // 25 events with a 10-event batch: two full blocks plus a partial one.
    for i in 0..25u64 {
      let event = if i % 5 == 0 {
        time.build("acct-1", 1000 + i, &[FieldValue::Long(1_700_000_000)]).unwrap()
      } else {
        tick
          .build(
            "acct-1",
            1000 + i,
            &[
              FieldValue::Int(1000),
              FieldValue::Int(0),
              FieldValue::Double(45.0 + i as f64),
              FieldValue::Int(0),
            ],
          )
          .unwrap()
      };
      assert!(writer.enqueue(event));
    }
    assert_eq!(writer.stop(Duration::from_secs(10)), 0);

    let day = chrono::Local::now().date_naive();
    let path = dir.path().join(format!("{}-acct-1.col", day.format("%Y-%m-%d")));
    let blocks = read_blocks(path).unwrap();
    assert_eq!(blocks.len(), 3);
    assert_eq!(blocks[0].len(), 10);
    assert_eq!(blocks[1].len(), 10);
    assert_eq!(blocks[2].len(), 5);
    // Mixed arities: the tickPrice rows fill four slots, currentTime rows
    // carry None beyond slot 0.
    assert_eq!(blocks[0].columns.len(), 4);
    assert!(blocks[0].columns[3][0].is_none()); // row 0 is currentTime
    assert!(blocks[0].columns[3][1].is_some());
    let all: Vec<u64> = blocks.iter().flat_map(|b| b.timestamps.clone()).collect();
    assert_eq!(all, (0..25u64).map(|i| 1000 + i).collect::<Vec<_>>());
  }
}
