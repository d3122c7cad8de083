// ibpipe/src/base.rs
// Base types and error definitions for the event pipeline.

use thiserror::Error;

/// Errors that can occur anywhere in the pipeline.
///
/// Builder/parser errors (`ArityMismatch`, `TypeMismatch`, `UnsetField`)
/// indicate a registry/signature mismatch and are always surfaced to the
/// caller. I/O and connection errors are classified by the consuming
/// `QueueWorker` policy as retryable or fatal.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipeError {
  #[error("Arity mismatch for {method}: expected {expected} args, got {actual}")]
  ArityMismatch {
    method: &'static str,
    expected: usize,
    actual: usize,
  },

  #[error("Type mismatch for {method} arg {index} ({name}): expected {expected}")]
  TypeMismatch {
    method: &'static str,
    index: usize,
    name: &'static str,
    expected: &'static str,
  },

  #[error("Field at position {0} has no value set")]
  UnsetField(usize),

  #[error("Decode error: {0}")]
  DecodeError(String),

  #[error("Connection failed: {0}")]
  ConnectionFailed(String),

  #[error("Not connected")]
  NotConnected,

  #[error("Already connected")]
  AlreadyConnected,

  #[error("Already running: {0}")]
  AlreadyRunning(String),

  #[error("Socket error: {0}")]
  SocketError(String),

  #[error("Message parse error: {0}")]
  ParseError(String),

  #[error("Request timeout: {0}")]
  Timeout(String),

  #[error("I/O error: {0}")]
  IoError(String),

  #[error("Resource closed: {0}")]
  ResourceClosed(String),

  #[error("Misconfigured: {0}")]
  Misconfigured(String),

  #[error("Internal error: {0}")]
  InternalError(String),
}

impl From<std::io::Error> for PipeError {
  fn from(e: std::io::Error) -> Self {
    PipeError::IoError(e.to_string())
  }
}
