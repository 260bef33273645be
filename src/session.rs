//! Minimal FIX initiator session over TCP.
//!
//! Covers what a replay client needs: logon, heartbeats, test requests,
//! inbound sequence tracking and the logout handshake. A peer silent for a
//! heartbeat interval plus a fifth gets one TestRequest; if nothing arrives
//! within another interval the session ends with [`SessionError::Timeout`]. Application messages
//! are handed to an [`Application`] once logon completes.
//!
//! Threads: a reader thread parses frames off the socket and feeds a
//! crossbeam channel; the calling thread owns the write half and runs the
//! delivery loop, so every callback runs on one thread.
use crate::fix::{Field, FieldAccess, FrameReader, Message, WireError};
use crate::protocol::HandlerError;
use crate::tags::session as st;
use crossbeam_channel::{never, select, unbounded, Receiver, Sender};
use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{debug, info, trace, warn};

/// Outbound half of a session as seen by the application.
pub trait Transport {
    fn send(&mut self, message: Message) -> io::Result<()>;
}

/// Collects messages instead of sending them.
impl Transport for Vec<Message> {
    fn send(&mut self, message: Message) -> io::Result<()> {
        self.push(message);
        Ok(())
    }
}

pub trait Application {
    /// Logon completed. Called at most once per session.
    fn on_session_established(&mut self, transport: &mut dyn Transport) -> io::Result<()>;

    fn on_inbound_message(&mut self, msg: &Message) -> Result<(), HandlerError>;

    /// The session is over, whatever the reason. Called exactly once.
    fn on_session_ended(&mut self);

    /// When true the session logs out.
    fn is_finished(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub host: String,
    pub port: u16,
    pub begin_string: String,
    pub sender_comp_id: String,
    pub target_comp_id: String,
    pub heartbeat: Duration,
    pub reset_on_logon: bool,
    pub connect_timeout: Duration,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connect to {addr}: {source}")]
    Connect { addr: String, source: io::Error },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("logon rejected: {0}")]
    LogonRejected(String),
    #[error("connection closed by peer")]
    Disconnected,
    #[error("no inbound traffic for {0:?}")]
    Timeout(Duration),
}

fn sending_time() -> io::Result<String> {
    let format = format_description!("[year][month][day]-[hour]:[minute]:[second].[subsecond digits:3]");
    OffsetDateTime::now_utc().format(format).map_err(io::Error::other)
}

/// Stamps the standard header and writes framed messages.
pub struct Outbound<W> {
    writer: W,
    begin_string: String,
    sender_comp_id: String,
    target_comp_id: String,
    next_seq: u64,
    last_sent: Instant,
}

impl<W: Write> Outbound<W> {
    pub fn new(writer: W, settings: &SessionSettings) -> Self {
        Self {
            writer,
            begin_string: settings.begin_string.clone(),
            sender_comp_id: settings.sender_comp_id.clone(),
            target_comp_id: settings.target_comp_id.clone(),
            next_seq: 1,
            last_sent: Instant::now(),
        }
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> Transport for Outbound<W> {
    fn send(&mut self, message: Message) -> io::Result<()> {
        let header = [
            Field::new(st::SENDER_COMP_ID, self.sender_comp_id.as_str()),
            Field::new(st::TARGET_COMP_ID, self.target_comp_id.as_str()),
            Field::new(st::MSG_SEQ_NUM, self.next_seq.to_string()),
            Field::new(st::SENDING_TIME, sending_time()?),
        ];
        self.writer.write_all(&message.encode(&self.begin_string, &header))?;
        self.writer.flush()?;
        trace!(seq = self.next_seq, %message, "sent");
        self.next_seq += 1;
        self.last_sent = Instant::now();
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

struct Peer {
    expected_seq: u64,
    logged_on: bool,
    logout_sent: Option<Instant>,
}

/// Inbound silence supervision.
struct Liveness {
    interval: Duration,
    last_received: Instant,
    test_request_sent: Option<Instant>,
}

impl Liveness {
    fn new(interval: Duration) -> Self {
        Self { interval, last_received: Instant::now(), test_request_sent: None }
    }

    fn received(&mut self) {
        self.last_received = Instant::now();
        self.test_request_sent = None;
    }

    fn deadline(&self) -> Instant {
        match self.test_request_sent {
            Some(sent) => sent + self.interval,
            None => self.last_received + self.interval + self.interval / 5,
        }
    }

    /// One TestRequest to a silent peer, then give up on it.
    fn check<W: Write>(&mut self, out: &mut Outbound<W>) -> Result<(), SessionError> {
        if Instant::now() < self.deadline() {
            return Ok(());
        }
        let silent = self.last_received.elapsed();
        if self.test_request_sent.is_some() {
            warn!(?silent, "no reply to test request");
            return Err(SessionError::Timeout(silent));
        }
        debug!(?silent, "peer silent, sending test request");
        let mut msg = Message::new(st::TEST_REQUEST);
        msg.push(st::TEST_REQ_ID, format!("TEST{}", out.next_seq()));
        out.send(msg)?;
        self.test_request_sent = Some(Instant::now());
        Ok(())
    }
}

pub struct Initiator {
    settings: SessionSettings,
}

impl Initiator {
    pub fn new(settings: SessionSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    fn connect(&self) -> Result<TcpStream, SessionError> {
        let addr = format!("{}:{}", self.settings.host, self.settings.port);
        let resolved = (self.settings.host.as_str(), self.settings.port)
            .to_socket_addrs()
            .map_err(|source| SessionError::Connect { addr: addr.clone(), source })?;
        let mut last_err = None;
        for candidate in resolved {
            match TcpStream::connect_timeout(&candidate, self.settings.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(%candidate, error = %e, "connect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        let source = last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address resolved"));
        Err(SessionError::Connect { addr, source })
    }

    /// Connect, run one session to its end, close the socket.
    pub fn run<A: Application>(&self, app: &mut A, shutdown: Receiver<()>) -> Result<(), SessionError> {
        let stream = self.connect()?;
        info!(host = %self.settings.host, port = self.settings.port, "connected");
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        let result = self.run_on(app, reader, &stream, shutdown);
        if let Err(e) = stream.shutdown(Shutdown::Both) {
            debug!(error = %e, "socket shutdown");
        }
        result
    }

    /// Run a session over an already connected byte stream.
    pub fn run_on<A, R, W>(&self, app: &mut A, reader: R, writer: W, shutdown: Receiver<()>) -> Result<(), SessionError>
    where
        A: Application,
        R: Read + Send + 'static,
        W: Write,
    {
        let (tx, inbound) = unbounded();
        spawn_reader(reader, tx)?;
        let mut out = Outbound::new(writer, &self.settings);
        let result = self.drive(app, &mut out, inbound, shutdown);
        app.on_session_ended();
        result
    }

    fn logon(&self) -> Message {
        let mut msg = Message::new(st::LOGON);
        msg.push(st::ENCRYPT_METHOD, "0");
        msg.push(st::HEART_BT_INT, self.settings.heartbeat.as_secs().to_string());
        if self.settings.reset_on_logon {
            msg.push(st::RESET_SEQ_NUM_FLAG, "Y");
        }
        msg
    }

    fn begin_logout<W: Write>(&self, out: &mut Outbound<W>, peer: &mut Peer, reason: &str) -> io::Result<()> {
        if peer.logout_sent.is_some() {
            return Ok(());
        }
        info!(reason, "logging out");
        let mut msg = Message::new(st::LOGOUT);
        msg.push(st::TEXT, reason);
        out.send(msg)?;
        peer.logout_sent = Some(Instant::now());
        Ok(())
    }

    fn drive<A: Application, W: Write>(
        &self,
        app: &mut A,
        out: &mut Outbound<W>,
        inbound: Receiver<Result<Message, WireError>>,
        mut shutdown: Receiver<()>,
    ) -> Result<(), SessionError> {
        let heartbeat = self.settings.heartbeat;
        let mut peer = Peer { expected_seq: 1, logged_on: false, logout_sent: None };
        let mut liveness = Liveness::new(heartbeat);
        out.send(self.logon())?;

        loop {
            let wait = heartbeat
                .saturating_sub(out.last_sent.elapsed())
                .min(liveness.deadline().saturating_duration_since(Instant::now()));
            let mut stop_requested = false;
            select! {
                recv(inbound) -> msg => match msg {
                    Ok(Ok(msg)) => {
                        liveness.received();
                        if self.handle(app, out, &mut peer, &msg)? == Flow::Stop {
                            return Ok(());
                        }
                    }
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) if peer.logout_sent.is_some() => return Ok(()),
                    Err(_) => return Err(SessionError::Disconnected),
                },
                recv(shutdown) -> _ => stop_requested = true,
                default(wait) => {
                    if let Some(sent) = peer.logout_sent {
                        if sent.elapsed() >= heartbeat {
                            warn!("no logout reply, closing");
                            return Ok(());
                        }
                    }
                    liveness.check(out)?;
                    if out.last_sent.elapsed() >= heartbeat {
                        out.send(Message::new(st::HEARTBEAT))?;
                    }
                }
            }

            if stop_requested {
                shutdown = never();
                self.begin_logout(out, &mut peer, "shutdown requested")?;
            }
            if app.is_finished() {
                self.begin_logout(out, &mut peer, "replay finished")?;
            }
        }
    }

    fn handle<A: Application, W: Write>(
        &self,
        app: &mut A,
        out: &mut Outbound<W>,
        peer: &mut Peer,
        msg: &Message,
    ) -> Result<Flow, SessionError> {
        let msg_type = match msg.msg_type() {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, message = %msg, "dropping message");
                return Ok(Flow::Continue);
            }
        };
        trace!(message = %msg, "received");

        if msg_type == st::SEQUENCE_RESET {
            match msg.get_parsed::<u64>(st::NEW_SEQ_NO) {
                Ok(next) => {
                    let gap_fill = msg.get_str(st::GAP_FILL_FLAG) == Ok("Y");
                    debug!(from = peer.expected_seq, to = next, gap_fill, "inbound sequence reset");
                    peer.expected_seq = next;
                }
                Err(e) => warn!(error = %e, "sequence reset ignored"),
            }
            return Ok(Flow::Continue);
        }
        check_sequence(peer, msg);

        match msg_type {
            st::LOGON if peer.logged_on => warn!("duplicate logon ignored"),
            st::LOGON => {
                peer.logged_on = true;
                info!("logged on");
                app.on_session_established(out)?;
            }
            st::HEARTBEAT => {}
            st::TEST_REQUEST => {
                let mut reply = Message::new(st::HEARTBEAT);
                if let Some(id) = msg.get_bytes(st::TEST_REQ_ID) {
                    reply.push(st::TEST_REQ_ID, id);
                }
                out.send(reply)?;
            }
            st::RESEND_REQUEST => {
                // Nothing worth resending: skip the server past everything sent so far.
                warn!("resend requested by server, answering with a sequence reset");
                let mut reset = Message::new(st::SEQUENCE_RESET);
                reset.push(st::GAP_FILL_FLAG, "N");
                reset.push(st::NEW_SEQ_NO, (out.next_seq() + 1).to_string());
                out.send(reset)?;
            }
            st::REJECT => warn!(text = msg.get_str(st::TEXT).unwrap_or(""), "session reject from server"),
            st::LOGOUT => {
                let text = msg.get_str(st::TEXT).unwrap_or("").to_string();
                if !peer.logged_on {
                    return Err(SessionError::LogonRejected(text));
                }
                if peer.logout_sent.is_none() {
                    info!(%text, "logout from server");
                    out.send(Message::new(st::LOGOUT))?;
                }
                return Ok(Flow::Stop);
            }
            _ if !peer.logged_on => warn!(msg_type, "application message before logon ignored"),
            _ => match app.on_inbound_message(msg) {
                Ok(()) => {}
                Err(HandlerError::NotAuthorized) => info!("replay not authorized for this session"),
                Err(e) => warn!(error = %e, message = %msg, "message not processed"),
            },
        }
        Ok(Flow::Continue)
    }
}

/// Gaps are only logged; the replay itself carries application sequence numbers.
fn check_sequence(peer: &mut Peer, msg: &Message) {
    match msg.get_parsed::<u64>(st::MSG_SEQ_NUM) {
        Ok(seq) if seq == peer.expected_seq => peer.expected_seq += 1,
        Ok(seq) if seq > peer.expected_seq => {
            warn!(expected = peer.expected_seq, received = seq, "inbound sequence gap");
            peer.expected_seq = seq + 1;
        }
        Ok(seq) => warn!(expected = peer.expected_seq, received = seq, "inbound sequence number too low"),
        Err(e) => warn!(error = %e, "inbound message without a sequence number"),
    }
}

fn spawn_reader<R: Read + Send + 'static>(inner: R, tx: Sender<Result<Message, WireError>>) -> io::Result<()> {
    thread::Builder::new().name("fix-reader".into()).spawn(move || {
        let mut reader = FrameReader::new(BufReader::new(inner));
        loop {
            match reader.read_message() {
                Ok(Some(msg)) => {
                    if tx.send(Ok(msg)).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(Err(e));
                    break;
                }
            }
        }
        debug!("reader finished");
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn settings() -> SessionSettings {
        SessionSettings {
            host: "127.0.0.1".into(),
            port: 0,
            begin_string: "FIX.4.4".into(),
            sender_comp_id: "CLIENT".into(),
            target_comp_id: "UMDF".into(),
            heartbeat: Duration::from_secs(30),
            reset_on_logon: true,
            connect_timeout: Duration::from_secs(1),
        }
    }

    fn server_stream(messages: &[Message]) -> Cursor<Vec<u8>> {
        let mut bytes = Vec::new();
        for (i, msg) in messages.iter().enumerate() {
            bytes.extend(msg.encode("FIX.4.4", &[Field::new(st::MSG_SEQ_NUM, (i + 1).to_string())]));
        }
        Cursor::new(bytes)
    }

    /// Serves its bytes, then blocks until `release` is dropped.
    struct Stalled {
        bytes: Cursor<Vec<u8>>,
        release: Receiver<()>,
    }

    impl Read for Stalled {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.bytes.read(buf)?;
            if n == 0 {
                let _ = self.release.recv();
            }
            Ok(n)
        }
    }

    fn sent_messages(bytes: Vec<u8>) -> Vec<Message> {
        let mut reader = FrameReader::new(Cursor::new(bytes));
        let mut out = Vec::new();
        while let Some(msg) = reader.read_message().unwrap() {
            out.push(msg);
        }
        out
    }

    /// Sends one "XX" at logon and finishes on the first "YY".
    #[derive(Default)]
    struct Script {
        established: usize,
        seen: Vec<String>,
        ended: usize,
        done: bool,
    }

    impl Application for Script {
        fn on_session_established(&mut self, transport: &mut dyn Transport) -> io::Result<()> {
            self.established += 1;
            transport.send(Message::new("XX"))
        }

        fn on_inbound_message(&mut self, msg: &Message) -> Result<(), HandlerError> {
            let t = msg.msg_type()?.to_string();
            self.done |= t == "YY";
            self.seen.push(t);
            Ok(())
        }

        fn on_session_ended(&mut self) {
            self.ended += 1;
        }

        fn is_finished(&self) -> bool {
            self.done
        }
    }

    #[test]
    fn outbound_stamps_header_and_counts() {
        let mut out = Outbound::new(Vec::new(), &settings());
        out.send(Message::new(st::HEARTBEAT)).unwrap();
        out.send(Message::new(st::HEARTBEAT)).unwrap();
        assert_eq!(out.next_seq(), 3);
        let sent = sent_messages(out.into_inner());
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].get_str(st::MSG_SEQ_NUM).unwrap(), "2");
        assert_eq!(sent[0].get_str(st::SENDER_COMP_ID).unwrap(), "CLIENT");
        assert_eq!(sent[0].get_str(st::TARGET_COMP_ID).unwrap(), "UMDF");
        let stamp = sent[0].get_str(st::SENDING_TIME).unwrap();
        assert_eq!(stamp.len(), 21, "{stamp}");
        assert_eq!(&stamp[8..9], "-");
    }

    #[test]
    fn full_session_with_logout_handshake() {
        let server = server_stream(&[
            {
                let mut m = Message::new(st::LOGON);
                m.push(st::HEART_BT_INT, "30");
                m
            },
            {
                let mut m = Message::new(st::TEST_REQUEST);
                m.push(st::TEST_REQ_ID, "ping");
                m
            },
            Message::new("ZZ"),
            Message::new("YY"),
            Message::new(st::LOGOUT),
        ]);
        let mut app = Script::default();
        let mut written = Vec::new();
        Initiator::new(settings()).run_on(&mut app, server, &mut written, never()).unwrap();

        assert_eq!(app.established, 1);
        assert_eq!(app.ended, 1);
        assert_eq!(app.seen, vec!["ZZ", "YY"]);

        let sent = sent_messages(written);
        let types: Vec<&str> = sent.iter().map(|m| m.msg_type().unwrap()).collect();
        assert_eq!(types, vec!["A", "XX", "0", "5"]);
        assert_eq!(sent[0].get_str(st::RESET_SEQ_NUM_FLAG).unwrap(), "Y");
        assert_eq!(sent[0].get_str(st::HEART_BT_INT).unwrap(), "30");
        assert_eq!(sent[2].get_str(st::TEST_REQ_ID).unwrap(), "ping");
    }

    #[test]
    fn peer_close_before_logout_is_reported() {
        let server = server_stream(&[Message::new(st::LOGON), Message::new("ZZ")]);
        let mut app = Script::default();
        let err = Initiator::new(settings()).run_on(&mut app, server, Vec::new(), never()).unwrap_err();
        assert!(matches!(err, SessionError::Disconnected), "{err}");
        assert_eq!(app.ended, 1);
    }

    #[test]
    fn logout_before_logon_is_a_rejection() {
        let mut logout = Message::new(st::LOGOUT);
        logout.push(st::TEXT, "bad credentials");
        let mut app = Script::default();
        let err = Initiator::new(settings())
            .run_on(&mut app, server_stream(&[logout]), Vec::new(), never())
            .unwrap_err();
        assert!(matches!(err, SessionError::LogonRejected(ref t) if t == "bad credentials"));
        assert_eq!(app.established, 0);
        assert_eq!(app.ended, 1);
    }

    #[test]
    fn silent_peer_gets_a_test_request_then_times_out() {
        let (release, stalled) = crossbeam_channel::bounded::<()>(0);
        let server = Stalled { bytes: server_stream(&[Message::new(st::LOGON)]), release: stalled };
        let settings = SessionSettings { heartbeat: Duration::from_millis(200), ..settings() };
        let mut app = Script::default();
        let mut written = Vec::new();
        let started = Instant::now();
        let err = Initiator::new(settings).run_on(&mut app, server, &mut written, never()).unwrap_err();
        drop(release);

        assert!(matches!(err, SessionError::Timeout(_)), "{err}");
        assert!(started.elapsed() >= Duration::from_millis(400));
        assert_eq!(app.established, 1);
        assert_eq!(app.ended, 1);

        let sent = sent_messages(written);
        let types: Vec<&str> = sent.iter().map(|m| m.msg_type().unwrap()).collect();
        assert_eq!(&types[..2], ["A", "XX"]);
        let test_requests: Vec<&Message> = sent.iter().filter(|m| m.msg_type().unwrap() == st::TEST_REQUEST).collect();
        assert_eq!(test_requests.len(), 1, "{types:?}");
        assert!(test_requests[0].get_str(st::TEST_REQ_ID).unwrap().starts_with("TEST"));
    }

    #[test]
    fn resend_request_is_answered_with_a_reset() {
        let server = server_stream(&[
            Message::new(st::LOGON),
            Message::new(st::RESEND_REQUEST),
            Message::new("YY"),
            Message::new(st::LOGOUT),
        ]);
        let mut app = Script::default();
        let mut written = Vec::new();
        Initiator::new(settings()).run_on(&mut app, server, &mut written, never()).unwrap();

        let sent = sent_messages(written);
        let reset = sent.iter().find(|m| m.msg_type().unwrap() == st::SEQUENCE_RESET).unwrap();
        assert_eq!(reset.get_str(st::GAP_FILL_FLAG).unwrap(), "N");
        // logon, XX, then the reset itself as seq 3
        assert_eq!(reset.get_str(st::MSG_SEQ_NUM).unwrap(), "3");
        assert_eq!(reset.get_str(st::NEW_SEQ_NO).unwrap(), "4");
    }

    #[test]
    fn sequence_tracking_follows_resets_and_gaps() {
        let mut peer = Peer { expected_seq: 1, logged_on: true, logout_sent: None };
        let at = |seq: u64| {
            let mut m = Message::new(st::HEARTBEAT);
            m.push(st::MSG_SEQ_NUM, seq.to_string());
            m
        };
        check_sequence(&mut peer, &at(1));
        assert_eq!(peer.expected_seq, 2);
        check_sequence(&mut peer, &at(5));
        assert_eq!(peer.expected_seq, 6);
        check_sequence(&mut peer, &at(3));
        assert_eq!(peer.expected_seq, 6);
    }
}
