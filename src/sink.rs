//! Where replay outcomes and decoded records go.
use crate::demux::DecodeError;
use crate::fast::DecodedRecord;
use crate::protocol::{CompletionOutcome, ProtocolState, RequestOutcome};
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use tracing::{debug, info, warn};

/// Everything the protocol surfaces to the operator, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    Request(RequestOutcome),
    Completion(CompletionOutcome),
    /// `report` counts raw data reports from 1; `index` is the descriptor position.
    Record { report: u64, index: usize, record: DecodedRecord },
    RecordError { report: u64, index: usize, error: DecodeError },
    ReportDecoded { report: u64, decoded: usize, failed: usize },
    SessionEnded { state: ProtocolState },
}

pub trait OperatorSink {
    fn report(&mut self, event: &Event);
}

/// Records on stdout, one line each; everything else through tracing.
#[derive(Debug, Default)]
pub struct LogSink {
    quiet: bool,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep outcomes but drop record lines.
    pub fn quiet() -> Self {
        Self { quiet: true }
    }
}

impl OperatorSink for LogSink {
    fn report(&mut self, event: &Event) {
        match event {
            Event::Request(RequestOutcome::Accepted) => info!("request accepted"),
            Event::Request(outcome) => warn!(%outcome, "replay request refused"),
            Event::Completion(outcome @ CompletionOutcome::AllReceivedNoErrors) => info!(%outcome, "replay finished"),
            Event::Completion(outcome) => warn!(%outcome, "replay finished"),
            Event::Record { record, .. } => {
                if self.quiet {
                    return;
                }
                let mut out = io::stdout().lock();
                if let Err(e) = writeln!(out, "{record}") {
                    debug!(error = %e, "stdout closed");
                }
            }
            Event::RecordError { report, index, error } => {
                warn!(report, index, %error, "sub-message not decoded")
            }
            Event::ReportDecoded { report, decoded, failed } => {
                debug!(report, decoded, failed, "raw data report processed")
            }
            Event::SessionEnded { state } => info!(?state, "session ended"),
        }
    }
}

/// Collects events, mostly for tests.
impl OperatorSink for Vec<Event> {
    fn report(&mut self, event: &Event) {
        self.push(event.clone());
    }
}

impl<S: OperatorSink> OperatorSink for Option<S> {
    fn report(&mut self, event: &Event) {
        if let Some(sink) = self {
            sink.report(event);
        }
    }
}

impl<A: OperatorSink, B: OperatorSink> OperatorSink for (A, B) {
    fn report(&mut self, event: &Event) {
        self.0.report(event);
        self.1.report(event);
    }
}
