// ibpipe/src/writer_csv.rs
// CSV writer: one line per event, appended to a per-day file named
// `<YYYY-MM-DD>-<sourceId>.csv`, with a `## <date>` comment written at
// file open. A failed single write drops that event and keeps the writer
// alive; losing the file resource itself is fatal.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use log::{info, warn};
use parking_lot::Mutex;

use crate::base::PipeError;
use crate::engine::EventWatcher;
use crate::event::Event;
use crate::queue::{ErrorAction, Hooks, QueueWorker, QueueWorkerConfig};
use crate::writer::{EventWriter, WriterKind};

struct CsvSink {
  dir: PathBuf,
  source_id: String,
  out: Option<BufWriter<File>>,
  last_day: Option<NaiveDate>,
}

impl CsvSink {
  fn file_name(&self, day: NaiveDate) -> PathBuf {
    self.dir.join(format!("{}-{}.csv", day.format("%Y-%m-%d"), self.source_id))
  }

  fn open(&mut self) -> Result<&mut BufWriter<File>, PipeError> {
    let today = chrono::Local::now().date_naive();
    if self.out.is_none() || self.last_day != Some(today) {
      if let Some(mut old) = self.out.take() {
        info!("{}: new day, flushing old file", self.source_id);
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
      let mut out = BufWriter::new(file);
      writeln!(out, "## {}", today).map_err(PipeError::from)?;
      out.flush().map_err(PipeError::from)?;
      info!("{}: writing to log file {}", self.source_id, path.display());
      self.out = Some(out);
      self.last_day = Some(today);
    }
    Ok(self.out.as_mut().unwrap())
  }

  fn write(&mut self, event: &Event) -> Result<(), PipeError> {
    let out = self.open()?;
    match writeln!(out, "{}", event).and_then(|_| out.flush()) {
      Ok(()) => Ok(()),
      Err(e) => {
        // Drop the handle so the next write reopens; this single event is
        // lost but the writer stays alive.
        self.out = None;
        Err(PipeError::IoError(e.to_string()))
      }
    }
  }

  fn close(&mut self) {
    if let Some(mut out) = self.out.take() {
      if let Err(e) = out.flush() {
        warn!("{}: flush on close failed: {}", self.source_id, e);
      }
    }
    self.last_day = None;
  }
}

pub struct CsvWriter {
  source_id: String,
  worker: QueueWorker<Event>,
  ready: Arc<AtomicBool>,
}

impl CsvWriter {
  /// Creates the writer and starts its queue worker. The file is opened on
  /// the first write.
  pub fn new(dir: impl Into<PathBuf>, source_id: impl Into<String>) -> CsvWriter {
    let source_id = source_id.into();
    let sink = Arc::new(Mutex::new(CsvSink {
      dir: dir.into(),
      source_id: source_id.clone(),
      out: None,
      last_day: None,
    }));
    let ready = Arc::new(AtomicBool::new(true));

    let process_sink = sink.clone();
    let stop_sink = sink;
    let stop_ready = ready.clone();
    let id = source_id.clone();
    let worker = QueueWorker::new(
      QueueWorkerConfig::new(source_id.clone()),
      Hooks::new(move |event: Event| process_sink.lock().write(&event))
        .classify(|e| match e {
          PipeError::ResourceClosed(_) => ErrorAction::Fatal,
          _ => ErrorAction::Retry,
        })
        .on_start({
          let id = source_id.clone();
          move || info!("Started csv writer @{}", id)
        })
        .on_stop(move |remaining| {
          info!("Stopped csv writer @{} at queue={}", id, remaining);
          stop_ready.store(false, Ordering::Release);
          stop_sink.lock().close();
        }),
    );
    worker.start();
    CsvWriter { source_id, worker, ready }
  }
}

impl EventWriter for CsvWriter {
  fn kind(&self) -> WriterKind {
    WriterKind::Csv
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

impl EventWatcher for CsvWriter {
  fn update(&self, event: &Event) {
    self.enqueue(event.clone());
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::ApiRegistry;
  use crate::event::FieldValue;

  #[test]
  fn csv_writer_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let registry = ApiRegistry::standard();
    let builder = registry.get("tickPrice").unwrap();
    let writer = CsvWriter::new(dir.path(), "acct-1");
    assert!(writer.is_ready());

    for i in 0..500u64 {
      let event = builder
        .build(
          "acct-1",
          1_000_000 + i * 2000,
          &[
            FieldValue::Int(1000),
            FieldValue::Int(0),
            FieldValue::Double(45.0),
            FieldValue::Int(0),
          ],
        )
        .unwrap();
      assert!(writer.enqueue(event));
    }
    let remaining = writer.stop(Duration::from_secs(30));
    assert_eq!(remaining, 0);
    assert_eq!(writer.processed(), 500);

    let day = chrono::Local::now().date_naive();
    let path = dir.path().join(format!("{}-acct-1.csv", day.format("%Y-%m-%d")));
    let contents = std::fs::read_to_string(path).unwrap();
    let lines: Vec<&str> = contents
      .lines()
      .filter(|l| !l.starts_with("##") && !l.is_empty())
      .collect();
    assert_eq!(lines.len(), 500);
    let mut last_ts = 0u64;
    for line in lines {
      assert!(line.contains("tickPrice"), "line missing method name: {}", line);
      let ts: u64 = line.split(',').next().unwrap().parse().unwrap();
      assert!(ts > last_ts);
      last_ts = ts;
    }
    assert!(contents.starts_with("## "));
  }

  #[test]
  fn writer_is_not_ready_after_stop() {
    let dir = tempfile::tempdir().unwrap();
    let writer = CsvWriter::new(dir.path(), "acct-2");
    writer.stop(Duration::from_secs(1));
    assert!(!writer.is_ready());
    // Enqueue after stop is a no-op, not a crash.
    let registry = ApiRegistry::standard();
    let event = registry
      .get("currentTime")
      .unwrap()
      .build("acct-2", 1, &[FieldValue::Long(1_700_000_000)])
      .unwrap();
    assert!(!writer.enqueue(event));
  }
}
