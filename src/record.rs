//! Capture file schema and framing.
//!
//! A capture is a sequence of frames `[len u32 LE][crc32 u32 LE][payload]`
//! where the payload is a bincode-encoded [`RecordFrame`]. The first frame
//! is always a [`FileHeader`].
use crate::sink::{Event, OperatorSink};
use crc32fast::Hasher as Crc32;
use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, warn};

pub const FORMAT_VERSION: u16 = 1;
const MAX_FRAME_LEN: usize = 64 << 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeader {
    pub version: u16,
    pub created_unix_ns: u128,
    pub channel: String,
    pub begin_seq: u64,
    pub end_seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub seq: u64,                      // per capture, from 0
    pub recv_unix_ns: u128,            // wall clock
    pub recv_mono_ns_from_start: u128, // since the capture opened
    pub event: Event,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordFrame {
    Header(FileHeader),
    Event(EventRecord),
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("bincode: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("CRC mismatch at frame {frame}: file={stored:#x}, calc={computed:#x}")]
    Crc { frame: usize, stored: u32, computed: u32 },
    #[error("frame {frame} declares {len} bytes")]
    TooLarge { frame: usize, len: usize },
    #[error("event of {0} bytes is too large for a capture frame")]
    PayloadTooLarge(usize),
}

pub fn now_unix_ns() -> u128 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos()
}

pub fn write_frame<W: Write>(w: &mut W, frame: &RecordFrame) -> Result<(), CaptureError> {
    let payload = bincode::serialize(frame)?;
    let mut hasher = Crc32::new();
    hasher.update(&payload);
    let crc = hasher.finalize();

    let len = frame_len(payload.len())?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(&crc.to_le_bytes())?;
    w.write_all(&payload)?;
    Ok(())
}

/// Length prefix for a payload, refusing what the reader would not take back.
fn frame_len(payload_len: usize) -> Result<u32, CaptureError> {
    u32::try_from(payload_len)
        .ok()
        .filter(|_| payload_len <= MAX_FRAME_LEN)
        .ok_or(CaptureError::PayloadTooLarge(payload_len))
}

fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Reads frames back, checking each CRC.
pub struct CaptureReader<R> {
    inner: R,
    frames: usize,
}

impl<R: Read> CaptureReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, frames: 0 }
    }

    /// Frames read so far.
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// `Ok(None)` at a clean end of file.
    pub fn next_frame(&mut self) -> Result<Option<RecordFrame>, CaptureError> {
        let len = match read_u32(&mut self.inner) {
            Ok(v) => v as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if len > MAX_FRAME_LEN {
            return Err(CaptureError::TooLarge { frame: self.frames, len });
        }
        let stored = read_u32(&mut self.inner)?;
        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload)?;
        let mut hasher = Crc32::new();
        hasher.update(&payload);
        let computed = hasher.finalize();
        if computed != stored {
            return Err(CaptureError::Crc { frame: self.frames, stored, computed });
        }
        let frame = bincode::deserialize(&payload)?;
        self.frames += 1;
        Ok(Some(frame))
    }
}

impl<R: Read> Iterator for CaptureReader<R> {
    type Item = Result<RecordFrame, CaptureError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame().transpose()
    }
}

/// Drain `rx` into a new capture file until every sender is dropped.
/// Returns the number of frames written.
pub fn writer_thread(out: &Path, rx: Receiver<RecordFrame>) -> Result<u64, CaptureError> {
    if let Some(parent) = out.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let file = OpenOptions::new().create(true).write(true).truncate(true).open(out)?;
    let mut w: BufWriter<File> = BufWriter::with_capacity(1 << 20, file);
    let mut written = 0u64;
    for frame in rx {
        write_frame(&mut w, &frame)?;
        written += 1;
    }
    w.flush()?;
    debug!(frames = written, path = %out.display(), "capture closed");
    Ok(written)
}

/// Sink that forwards every event to the capture writer.
pub struct CaptureSink {
    tx: Sender<RecordFrame>,
    seq: u64,
    start: Instant,
    closed: bool,
}

impl CaptureSink {
    /// Sends `header` as the first frame.
    pub fn open(tx: Sender<RecordFrame>, header: FileHeader) -> Self {
        let mut sink = Self { tx, seq: 0, start: Instant::now(), closed: false };
        sink.send(RecordFrame::Header(header));
        sink
    }

    fn send(&mut self, frame: RecordFrame) {
        if self.closed {
            return;
        }
        if self.tx.send(frame).is_err() {
            warn!("capture writer gone, no further events recorded");
            self.closed = true;
        }
    }
}

impl OperatorSink for CaptureSink {
    fn report(&mut self, event: &Event) {
        let record = EventRecord {
            seq: self.seq,
            recv_unix_ns: now_unix_ns(),
            recv_mono_ns_from_start: self.start.elapsed().as_nanos(),
            event: event.clone(),
        };
        self.seq += 1;
        self.send(RecordFrame::Event(record));
    }
}
