use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::bounded;
use dotenvy::dotenv;
use std::process::ExitCode;
use std::thread;
use tracing::{error, info};
use umdf_replay::config::Args;
use umdf_replay::fast::{FastDecoder, TemplateDictionary};
use umdf_replay::logging;
use umdf_replay::protocol::{ProtocolState, ReplayProtocol};
use umdf_replay::record::{now_unix_ns, writer_thread, CaptureSink, FileHeader, RecordFrame, FORMAT_VERSION};
use umdf_replay::session::Initiator;
use umdf_replay::sink::LogSink;

fn main() -> Result<ExitCode> {
    // Load environment variables from .env if present
    let _ = dotenv();
    let args = Args::parse();
    logging::init(args.verbose);

    let request = args.replay_request()?;
    let settings = args.session_settings()?;
    let dictionary = TemplateDictionary::load(&args.templates)
        .with_context(|| format!("load templates {:?}", args.templates))?;
    info!(templates = dictionary.len(), path = %args.templates.display(), "template dictionary loaded");

    // Optional capture: writer thread fed by a bounded channel
    let (capture, writer) = match &args.out {
        Some(out) => {
            let (tx, rx) = bounded::<RecordFrame>(8192);
            let out = out.clone();
            let handle = thread::Builder::new()
                .name("capture-writer".into())
                .spawn(move || writer_thread(&out, rx))
                .context("spawn capture writer")?;
            let header = FileHeader {
                version: FORMAT_VERSION,
                created_unix_ns: now_unix_ns(),
                channel: request.channel().to_string(),
                begin_seq: request.begin_sequence(),
                end_seq: request.end_sequence(),
            };
            (Some(CaptureSink::open(tx, header)), Some(handle))
        }
        None => (None, None),
    };
    let log = if args.quiet { LogSink::quiet() } else { LogSink::new() };

    // Ctrl+C asks the session to log out instead of killing the process
    let (stop_tx, stop_rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("install Ctrl+C handler")?;

    let mut protocol = ReplayProtocol::new(request, FastDecoder::new(dictionary), (log, capture))
        .with_request_id(args.request_id.as_str());
    let result = Initiator::new(settings).run(&mut protocol, stop_rx);
    let state = protocol.state();
    info!(
        ?state,
        reports = protocol.reports_received(),
        records = protocol.records_decoded(),
        "replay done"
    );
    // dropping the protocol closes the capture channel
    drop(protocol);

    if let Some(handle) = writer {
        match handle.join() {
            Ok(Ok(frames)) => info!(frames, "capture written"),
            Ok(Err(e)) => error!(error = %e, "capture writer failed"),
            Err(_) => error!("capture writer panicked"),
        }
    }

    result.context("replay session")?;
    Ok(if state == ProtocolState::Completed { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
