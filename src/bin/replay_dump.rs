use anyhow::{Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use umdf_replay::record::{CaptureReader, RecordFrame};
use umdf_replay::sink::Event;

#[derive(Debug, Parser)]
#[command(about = "Print a capture file written during a replay")]
struct Args {
    /// Capture file to read (.bin)
    #[arg(long, short = 'i')]
    input: PathBuf,

    /// Print decoded records, not just outcomes
    #[arg(long, short = 'r', default_value_t = false)]
    records: bool,

    /// Print sub-message decode errors
    #[arg(long, default_value_t = false)]
    errors: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let file = File::open(&args.input).with_context(|| format!("open {:?}", args.input))?;
    let mut reader = CaptureReader::new(BufReader::new(file));
    let (mut records, mut failures) = (0u64, 0u64);

    while let Some(frame) = reader.next_frame().with_context(|| format!("read {:?}", args.input))? {
        match frame {
            RecordFrame::Header(h) => {
                eprintln!(
                    "Header: v{} channel={} range={}..={} created={}ns",
                    h.version, h.channel, h.begin_seq, h.end_seq, h.created_unix_ns
                );
            }
            RecordFrame::Event(ev) => match ev.event {
                Event::Record { report, index, record } => {
                    records += 1;
                    if args.records {
                        println!("seq={} report={} index={} {}", ev.seq, report, index, record);
                    }
                }
                Event::RecordError { report, index, error } => {
                    failures += 1;
                    if args.errors {
                        println!("seq={} report={} index={} error: {}", ev.seq, report, index, error);
                    }
                }
                Event::ReportDecoded { .. } => {}
                Event::Request(outcome) => println!("seq={} request: {}", ev.seq, outcome),
                Event::Completion(outcome) => println!("seq={} completion: {}", ev.seq, outcome),
                Event::SessionEnded { state } => println!("seq={} session ended in {:?}", ev.seq, state),
            },
        }
    }
    eprintln!("Read {} frames: {} records, {} decode errors.", reader.frames(), records, failures);
    Ok(())
}
