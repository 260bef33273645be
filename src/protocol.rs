//! Replay request protocol.
//!
//! On logon the client sends one ApplicationMessageRequest for a channel
//! and sequence range. The server answers with an acknowledgement (accept,
//! reject, not authorized), then streams raw data reports, then closes with
//! a resend-complete report. [`ReplayProtocol`] tracks that exchange:
//!
//! ```text
//! Idle -> RequestSent -> Rejected | Unauthorized
//!                     -> AwaitingReports -> Completed | CompletedWithError
//! ```
//!
//! Every terminal state ends the run; nothing is retried.
use crate::demux::{demultiplex, RawReport, SubMessageDecoder};
use crate::fix::{Field, FieldAccess, FieldError, Message};
use crate::session::{Application, Transport};
use crate::sink::{Event, OperatorSink};
use crate::tags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_REQUEST_ID: &str = "RequestId";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayRequest {
    channel: String,
    begin_sequence: u64,
    end_sequence: u64,
}

impl ReplayRequest {
    pub fn new(channel: impl Into<String>, begin_sequence: u64, end_sequence: u64) -> Self {
        Self { channel: channel.into(), begin_sequence, end_sequence }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn begin_sequence(&self) -> u64 {
        self.begin_sequence
    }

    pub fn end_sequence(&self) -> u64 {
        self.end_sequence
    }

    /// ApplicationMessageRequest with a single NoApplIDs entry.
    pub fn to_message(&self, request_id: &str) -> Message {
        let mut msg = Message::new(tags::msg_type::REPLAY_REQUEST);
        msg.push(tags::APPL_REQ_ID, request_id);
        msg.push(tags::APPL_REQ_TYPE, tags::APPL_REQ_TYPE_RETRANSMISSION);
        msg.push_group(
            tags::NO_APPL_IDS,
            vec![vec![
                Field::new(tags::REF_APPL_ID, self.channel.as_str()),
                Field::new(tags::APPL_BEG_SEQ_NUM, self.begin_sequence.to_string()),
                Field::new(tags::APPL_END_SEQ_NUM, self.end_sequence.to_string()),
            ]],
        );
        msg
    }

    /// Read a request back from its message form.
    pub fn from_message(msg: &Message) -> Result<Self, FieldError> {
        let entries = msg.group(tags::NO_APPL_IDS, tags::APPL_ID_MEMBERS)?;
        let entry = entries.first().ok_or(FieldError::Missing(tags::REF_APPL_ID))?;
        Ok(Self {
            channel: entry.get_str(tags::REF_APPL_ID)?.to_string(),
            begin_sequence: entry.get_parsed(tags::APPL_BEG_SEQ_NUM)?,
            end_sequence: entry.get_parsed(tags::APPL_END_SEQ_NUM)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    ApplicationNotSpecified,
    ApplicationDoesNotExist,
    InvalidRange,
    Unknown(u32),
}

impl RejectReason {
    /// Map ApplResponseError of a rejected request.
    pub fn from_error_code(code: u32) -> Self {
        match code {
            0 => Self::ApplicationDoesNotExist,
            3 => Self::InvalidRange,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApplicationNotSpecified => f.write_str("application does not exist (not specified)"),
            Self::ApplicationDoesNotExist => f.write_str("application does not exist"),
            Self::InvalidRange => f.write_str("invalid range requested"),
            Self::Unknown(code) => write!(f, "unknown reason {code}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestOutcome {
    Accepted,
    Rejected { reason: RejectReason },
    Unauthorized,
}

impl fmt::Display for RequestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted => f.write_str("request accepted"),
            Self::Rejected { reason } => write!(f, "request not accepted, reason: {reason}"),
            Self::Unauthorized => f.write_str("not authorized"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionErrorReason {
    MessagesNotAvailable,
    ResendLimitExceeded,
    BottomNTruncated,
    ResendLimitExceededAndBottomNTruncated,
    Unknown(u32),
}

impl CompletionErrorReason {
    /// Map ApplResponseError of a resend completed with errors.
    pub fn from_error_code(code: u32) -> Self {
        match code {
            1 => Self::MessagesNotAvailable,
            4 | 5 => Self::ResendLimitExceeded,
            6 => Self::BottomNTruncated,
            7 => Self::ResendLimitExceededAndBottomNTruncated,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for CompletionErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MessagesNotAvailable => f.write_str("messages requested are not available"),
            Self::ResendLimitExceeded => {
                f.write_str("exceeded the maximum limit of messages allowed per resend request")
            }
            Self::BottomNTruncated => f.write_str("ending bottom-N messages of the requested range"),
            Self::ResendLimitExceededAndBottomNTruncated => f.write_str(
                "exceeded the maximum limit of messages allowed per resend request \
                 and ending bottom-N messages of the requested range",
            ),
            Self::Unknown(code) => write!(f, "unknown reason {code}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionOutcome {
    AllReceivedNoErrors,
    CompletedWithError { reason: CompletionErrorReason },
}

impl fmt::Display for CompletionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllReceivedNoErrors => f.write_str("all messages received, no errors found"),
            Self::CompletedWithError { reason } => write!(f, "server returned error: {reason}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolState {
    Idle,
    RequestSent,
    AwaitingReports,
    Rejected(RejectReason),
    Unauthorized,
    Completed,
    CompletedWithError(CompletionErrorReason),
}

impl ProtocolState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Rejected(_) | Self::Unauthorized | Self::Completed | Self::CompletedWithError(_)
        )
    }
}

/// Why a single inbound message could not be handled. The session decides
/// whether an error ends it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("required tag {0} missing")]
    FieldMissing(u32),
    #[error("tag {0} has an incorrect data format")]
    BadFormat(u32),
    #[error("tag {0} has an incorrect value")]
    BadValue(u32),
    #[error("unsupported message type {0:?}")]
    UnsupportedType(String),
    #[error("not authorized")]
    NotAuthorized,
}

impl From<FieldError> for HandlerError {
    fn from(e: FieldError) -> Self {
        match e {
            FieldError::Missing(tag) => Self::FieldMissing(tag),
            FieldError::BadFormat(tag) => Self::BadFormat(tag),
            FieldError::BadValue(tag) => Self::BadValue(tag),
        }
    }
}

/// ApplResponseError of the first NoApplIDs entry.
fn response_error(msg: &Message) -> Result<u32, FieldError> {
    let entries = msg.group(tags::NO_APPL_IDS, tags::APPL_ID_MEMBERS)?;
    let entry = entries.first().ok_or(FieldError::Missing(tags::NO_APPL_IDS))?;
    entry.get_parsed(tags::APPL_RESPONSE_ERROR)
}

/// The replay exchange for one session. Owns the sub-message decoder and
/// the operator sink.
pub struct ReplayProtocol<D, S> {
    request: ReplayRequest,
    request_id: String,
    decoder: D,
    sink: S,
    state: ProtocolState,
    reports: u64,
    records: u64,
}

impl<D: SubMessageDecoder, S: OperatorSink> ReplayProtocol<D, S> {
    pub fn new(request: ReplayRequest, decoder: D, sink: S) -> Self {
        Self {
            request,
            request_id: DEFAULT_REQUEST_ID.to_string(),
            decoder,
            sink,
            state: ProtocolState::Idle,
            reports: 0,
            records: 0,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Raw data reports handled so far.
    pub fn reports_received(&self) -> u64 {
        self.reports
    }

    /// Sub-messages decoded successfully so far.
    pub fn records_decoded(&self) -> u64 {
        self.records
    }

    fn on_request_ack(&mut self, msg: &Message) -> Result<(), HandlerError> {
        let outcome = match msg.get_parsed::<u32>(tags::APPL_RESPONSE_TYPE)? {
            0 => RequestOutcome::Accepted,
            1 => RequestOutcome::Rejected { reason: RejectReason::ApplicationNotSpecified },
            2 => RequestOutcome::Rejected { reason: RejectReason::from_error_code(response_error(msg)?) },
            6 => RequestOutcome::Unauthorized,
            other => RequestOutcome::Rejected { reason: RejectReason::Unknown(other) },
        };
        if self.state != ProtocolState::RequestSent {
            warn!(state = ?self.state, %outcome, "acknowledgement without a pending request, ignored");
            return Ok(());
        }

        self.state = match outcome {
            RequestOutcome::Accepted => ProtocolState::AwaitingReports,
            RequestOutcome::Rejected { reason } => ProtocolState::Rejected(reason),
            RequestOutcome::Unauthorized => ProtocolState::Unauthorized,
        };
        debug!(state = ?self.state, "request acknowledged");
        self.sink.report(&Event::Request(outcome));
        if outcome == RequestOutcome::Unauthorized {
            return Err(HandlerError::NotAuthorized);
        }
        Ok(())
    }

    fn on_resend_complete(&mut self, msg: &Message) -> Result<(), HandlerError> {
        let outcome = match msg.get_parsed::<u32>(tags::APPL_REPORT_TYPE)? {
            3 => CompletionOutcome::AllReceivedNoErrors,
            4 => CompletionOutcome::CompletedWithError {
                reason: CompletionErrorReason::from_error_code(response_error(msg)?),
            },
            other => CompletionOutcome::CompletedWithError { reason: CompletionErrorReason::Unknown(other) },
        };
        match self.state {
            ProtocolState::AwaitingReports => {}
            ProtocolState::RequestSent => warn!(%outcome, "resend completed before the request was acknowledged"),
            state => {
                warn!(?state, %outcome, "resend report outside of an active request, ignored");
                return Ok(());
            }
        }

        self.state = match outcome {
            CompletionOutcome::AllReceivedNoErrors => ProtocolState::Completed,
            CompletionOutcome::CompletedWithError { reason } => ProtocolState::CompletedWithError(reason),
        };
        debug!(state = ?self.state, records = self.records, "resend complete");
        self.sink.report(&Event::Completion(outcome));
        Ok(())
    }

    fn on_raw_report(&mut self, msg: &Message) -> Result<(), HandlerError> {
        let report = RawReport::from_message(msg)?;
        self.reports += 1;
        let seq = self.reports;
        debug!(report = seq, messages = report.descriptors().len(), bytes = report.payload().len(), "raw data report");

        let (mut decoded, mut failed) = (0usize, 0usize);
        for (index, result) in demultiplex(&report, &self.decoder).enumerate() {
            match result {
                Ok(record) => {
                    decoded += 1;
                    self.sink.report(&Event::Record { report: seq, index, record });
                }
                Err(error) => {
                    failed += 1;
                    self.sink.report(&Event::RecordError { report: seq, index, error });
                }
            }
        }
        self.records += decoded as u64;
        self.sink.report(&Event::ReportDecoded { report: seq, decoded, failed });
        Ok(())
    }
}

impl<D: SubMessageDecoder, S: OperatorSink> Application for ReplayProtocol<D, S> {
    fn on_session_established(&mut self, transport: &mut dyn Transport) -> io::Result<()> {
        if self.state != ProtocolState::Idle {
            warn!(state = ?self.state, "session re-established, replay request already sent");
            return Ok(());
        }
        info!(
            channel = self.request.channel(),
            begin = self.request.begin_sequence(),
            end = self.request.end_sequence(),
            "connected, sending replay request"
        );
        transport.send(self.request.to_message(&self.request_id))?;
        self.state = ProtocolState::RequestSent;
        Ok(())
    }

    fn on_inbound_message(&mut self, msg: &Message) -> Result<(), HandlerError> {
        match msg.msg_type()? {
            tags::msg_type::REQUEST_ACK => self.on_request_ack(msg),
            tags::msg_type::RESEND_COMPLETE => self.on_resend_complete(msg),
            tags::msg_type::RAW_DATA_REPORT => self.on_raw_report(msg),
            other => {
                info!(msg_type = other, message = %msg, "received unknown message");
                Err(HandlerError::UnsupportedType(other.to_string()))
            }
        }
    }

    fn on_session_ended(&mut self) {
        if !self.state.is_terminal() {
            warn!(state = ?self.state, "session ended before the replay finished");
        }
        self.sink.report(&Event::SessionEnded { state: self.state });
    }

    fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }
}
