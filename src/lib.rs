//! UMDF market data replay client.
//!
//! Logs on to a replay server, requests a range of application sequence
//! numbers on one channel, and decodes what comes back:
//!
//! - `protocol`: the request/acknowledge/report exchange and its outcomes
//! - `demux`: splits raw data reports into FAST-encoded sub-messages
//! - `fast`: template dictionary and FAST decoder
//! - `fix`, `tags`: tag=value message model, wire codec and tag numbers
//! - `session`: minimal FIX initiator over TCP
//! - `sink`, `record`: where outcomes and records go, including capture files
//!
//! The binaries (`src/main.rs` and `src/bin/replay_dump.rs`) request a
//! replay and read back captures written during one.
pub mod config;
pub mod demux;
pub mod fast;
pub mod fix;
pub mod logging;
pub mod protocol;
pub mod record;
pub mod session;
pub mod sink;
pub mod tags;
