//! Command line and environment configuration.
use crate::protocol::{ReplayRequest, DEFAULT_REQUEST_ID};
use crate::session::SessionSettings;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Parser)]
#[command(version, about = "Request a UMDF market data replay and print the decoded messages")]
pub struct Args {
    /// Replay server host
    #[arg(long, env = "UMDF_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Replay server port
    #[arg(long, env = "UMDF_PORT", default_value_t = 10000)]
    pub port: u16,

    #[arg(long, env = "SENDER_COMP_ID")]
    pub sender_comp_id: String,

    #[arg(long, env = "TARGET_COMP_ID")]
    pub target_comp_id: String,

    #[arg(long, default_value = "FIX.4.4")]
    pub begin_string: String,

    /// Heartbeat interval in seconds
    #[arg(long, default_value_t = 30)]
    pub heartbeat: u64,

    /// Market data channel to replay (e.g. 003)
    #[arg(short = 'c', long, env = "CHANNEL")]
    pub channel: String,

    /// First application sequence number requested
    #[arg(short = 'b', long, env = "BEGIN_SEQ")]
    pub begin_seq: u64,

    /// Last application sequence number requested
    #[arg(short = 'e', long, env = "END_SEQ")]
    pub end_seq: u64,

    /// FAST template file (.xml, or a JSON dictionary)
    #[arg(short = 't', long, env = "TEMPLATES", default_value = "templates/umdf-replay.xml")]
    pub templates: PathBuf,

    #[arg(long, default_value = DEFAULT_REQUEST_ID)]
    pub request_id: String,

    /// Also record every event to this capture file (.bin)
    #[arg(long, env = "OUT_FILE")]
    pub out: Option<PathBuf>,

    /// Log outcomes only, no decoded records on stdout
    #[arg(short = 'q', long, default_value_t = false)]
    pub quiet: bool,

    /// More logging (-v debug, -vv trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("channel must not be empty")]
    EmptyChannel,
    #[error("end sequence {end} is before begin sequence {begin}")]
    InvertedRange { begin: u64, end: u64 },
    #[error("heartbeat interval must be positive")]
    ZeroHeartbeat,
}

impl Args {
    pub fn replay_request(&self) -> Result<ReplayRequest, ConfigError> {
        let channel = self.channel.trim();
        if channel.is_empty() {
            return Err(ConfigError::EmptyChannel);
        }
        if self.end_seq < self.begin_seq {
            return Err(ConfigError::InvertedRange { begin: self.begin_seq, end: self.end_seq });
        }
        Ok(ReplayRequest::new(channel, self.begin_seq, self.end_seq))
    }

    pub fn session_settings(&self) -> Result<SessionSettings, ConfigError> {
        if self.heartbeat == 0 {
            return Err(ConfigError::ZeroHeartbeat);
        }
        Ok(SessionSettings {
            host: self.host.clone(),
            port: self.port,
            begin_string: self.begin_string.clone(),
            sender_comp_id: self.sender_comp_id.clone(),
            target_comp_id: self.target_comp_id.clone(),
            heartbeat: Duration::from_secs(self.heartbeat),
            reset_on_logon: true,
            connect_timeout: Duration::from_secs(10),
        })
    }
}
