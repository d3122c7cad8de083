// ibpipe/src/lib.rs
// Main entry point for the broker event pipeline library.

//! # ibpipe - broker event pipeline
//!
//! Captures the Interactive Brokers TWS callback stream as typed, timestamped
//! events and persists them:
//!
//! - A uniform `Event` record with a compact tagged wire form
//! - Per-method signatures enforced by an `ApiBuilder` registry
//! - Bounded queue workers decoupling capture from file I/O
//! - CSV, binary record and columnar daily files
//! - A connection state machine with retries and synchronous call bridging
//! - Filtered fan-out of events to any number of watchers

mod base;
mod wire;
pub mod event;
pub mod api;
pub mod queue;
pub mod record_file;
pub mod writer;
pub mod writer_csv;
pub mod writer_record;
pub mod writer_columnar;
pub mod engine;
pub mod blocking;
pub mod adapter;
pub mod transport;
pub mod market;
pub mod client;
pub mod manager;

pub use base::PipeError;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
