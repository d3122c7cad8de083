// ibpipe/src/record_file.rs
// Length-prefixed binary record files with daily rotation. One record is a
// u32 big-endian length followed by a wire-encoded Event. Files are named
// `<YYYY-MM-DD>-<root>.rec` and appended to when they already exist, so a
// restarted writer continues the current day's file.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use chrono::NaiveDate;
use log::info;

use crate::base::PipeError;
use crate::event::Event;

pub const RECORD_EXTENSION: &str = "rec";

/// Refuse records larger than this on read; a longer prefix means the file
/// is corrupt or not a record file.
const MAX_RECORD_LEN: u32 = 1024 * 1024;

pub fn record_file_name(dir: &Path, root: &str, day: NaiveDate) -> PathBuf {
  dir.join(format!("{}-{}.{}", day.format("%Y-%m-%d"), root, RECORD_EXTENSION))
}

/// Owns the current day's open record file and rotates it when the date
/// changes. The writer is created lazily on the first append.
pub struct RecordFile {
  dir: PathBuf,
  root: String,
  last_day: Option<NaiveDate>,
  writer: Option<RecordWriter>,
}

impl RecordFile {
  pub fn new(dir: impl Into<PathBuf>, root: impl Into<String>) -> RecordFile {
    RecordFile {
      dir: dir.into(),
      root: root.into(),
      last_day: None,
      writer: None,
    }
  }

  fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
  }

  /// The open writer for today's file, rotating first if the day changed.
  pub fn writer(&mut self) -> Result<&mut RecordWriter, PipeError> {
    let today = Self::today();
    if self.last_day != Some(today) {
      if let Some(old) = self.writer.take() {
        info!("{}: new day, closing {}", self.root, old.path().display());
        old.close()?;
      }
      let path = record_file_name(&self.dir, &self.root, today);
      info!("{}: writing records to {}", self.root, path.display());
      self.writer = Some(RecordWriter::open(&path)?);
      self.last_day = Some(today);
    }
    Ok(self.writer.as_mut().unwrap())
  }

  pub fn is_open(&self) -> bool {
    self.writer.is_some()
  }

  /// Flushes and closes the current file, if any.
  pub fn close(&mut self) -> Result<(), PipeError> {
    self.last_day = None;
    match self.writer.take() {
      Some(w) => w.close(),
      None => Ok(()),
    }
  }

  /// A reader over today's file.
  pub fn reader(&self) -> Result<RecordReader, PipeError> {
    RecordReader::open(record_file_name(&self.dir, &self.root, Self::today()))
  }
}

pub struct RecordWriter {
  out: BufWriter<File>,
  path: PathBuf,
  written: u64,
}

impl RecordWriter {
  pub fn open(path: impl Into<PathBuf>) -> Result<RecordWriter, PipeError> {
    let path = path.into();
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok(RecordWriter { out: BufWriter::new(file), path, written: 0 })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Records appended since this writer was opened.
  pub fn written(&self) -> u64 {
    self.written
  }

  pub fn append(&mut self, event: &Event) -> Result<(), PipeError> {
    let bytes = event.encode();
    self.out.write_u32::<BigEndian>(bytes.len() as u32)?;
    self.out.write_all(&bytes)?;
    self.out.flush()?;
    self.written += 1;
    Ok(())
  }

  pub fn close(mut self) -> Result<(), PipeError> {
    self.out.flush()?;
    Ok(())
  }
}

/// Iterates the events of one record file, in file order. A clean EOF ends
/// iteration; a truncated or oversized record yields a `DecodeError`.
pub struct RecordReader {
  input: BufReader<File>,
}

impl RecordReader {
  pub fn open(path: impl AsRef<Path>) -> Result<RecordReader, PipeError> {
    let file = File::open(path.as_ref())?;
    Ok(RecordReader { input: BufReader::new(file) })
  }

  fn read_record(&mut self) -> Result<Option<Event>, PipeError> {
    let len = match self.input.read_u32::<BigEndian>() {
      Ok(len) => len,
      Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
      Err(e) => return Err(e.into()),
    };
    if len > MAX_RECORD_LEN {
      return Err(PipeError::DecodeError(format!("record length {} exceeds limit", len)));
    }
    let mut buf = vec![0u8; len as usize];
    self
      .input
      .read_exact(&mut buf)
      .map_err(|e| PipeError::DecodeError(format!("truncated record: {}", e)))?;
    Event::decode(&buf).map(Some)
  }
}

impl Iterator for RecordReader {
  type Item = Result<Event, PipeError>;

  fn next(&mut self) -> Option<Self::Item> {
    self.read_record().transpose()
  }
}
