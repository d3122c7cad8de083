// ibpipe/record_dump.rs
// Dumps a binary record file as CSV lines, one event per line. Useful for
// eyeballing what a record writer captured.

use clap::Parser;
use env_logger::Env;
use log::warn;

use ibpipe::event::Event;
use ibpipe::record_file::RecordReader;

/// Record file dumper
#[derive(Parser, Debug)]
#[clap(author, version, about = "Dump a binary event record file as CSV")]
struct CliArgs {
  /// Path to the record file
  file: std::path::PathBuf,

  /// Only print events from this source
  #[clap(long)]
  source: Option<String>,

  /// Stop after this many events
  #[clap(long)]
  limit: Option<usize>,
}

fn main() -> anyhow::Result<()> {
  env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
  let args = CliArgs::parse();

  let reader = RecordReader::open(&args.file)?;
  let mut printed = 0usize;
  for record in reader {
    let event: Event = match record {
      Ok(event) => event,
      Err(e) => {
        warn!("Stopping at unreadable record: {}", e);
        break;
      }
    };
    if let Some(source) = &args.source {
      if event.source() != source {
        continue;
      }
    }
    println!("{}", event);
    printed += 1;
    if args.limit.is_some_and(|limit| printed >= limit) {
      break;
    }
  }
  eprintln!("{} events", printed);
  Ok(())
}
