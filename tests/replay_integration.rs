use crossbeam_channel::{bounded, never};
use std::fs::File;
use std::io::BufReader;
use std::net::TcpListener;
use std::path::Path;
use std::thread;
use std::time::Duration;
use umdf_replay::fast::{FastDecoder, TemplateDictionary, Value};
use umdf_replay::fix::{Field, FieldAccess, FrameReader, Message};
use umdf_replay::protocol::{CompletionOutcome, ProtocolState, ReplayProtocol, ReplayRequest, RequestOutcome};
use umdf_replay::record::{writer_thread, CaptureReader, CaptureSink, FileHeader, RecordFrame};
use umdf_replay::session::{Application, Initiator, SessionSettings, Transport};
use umdf_replay::sink::Event;
use umdf_replay::tags;

// Heartbeat (template 2): seq 7, sending time 1000
const HEARTBEAT: &[u8] = &[0xC0, 0x82, 0x87, 0x07, 0xE8];
// SequenceReset (template 1): seq 1, sending time 1000, new seq 10
const SEQUENCE_RESET: &[u8] = &[0xC0, 0x81, 0x81, 0x07, 0xE8, 0x8A];
// MDIncRefresh (template 12): seq 5, one entry, px 123.45, size 10
const INC_REFRESH: &[u8] = &[
    0xC0, 0x8C, 0x85, 0x07, 0xE8, 0x81, // header, one entry
    0xF8, 0x80, 0xB2, 0xAA, 0x89, 0xFE, 0x00, 0x60, 0xB9, 0x8B,
];

fn dictionary(file: &str) -> TemplateDictionary {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("templates").join(file);
    TemplateDictionary::load(&path).unwrap()
}

fn decoder() -> FastDecoder {
    FastDecoder::new(dictionary("umdf-replay.xml"))
}

fn ack(code: &str) -> Message {
    let mut m = Message::new(tags::msg_type::REQUEST_ACK);
    m.push(tags::APPL_REQ_ID, "RequestId");
    m.push(tags::APPL_RESPONSE_TYPE, code);
    m
}

fn complete(code: &str) -> Message {
    let mut m = Message::new(tags::msg_type::RESEND_COMPLETE);
    m.push(tags::APPL_REPORT_TYPE, code);
    m
}

/// One raw data report carrying `parts` back to back, plus any extra descriptors.
fn raw_report(parts: &[&[u8]], extra: &[(u64, u64)]) -> Message {
    let mut payload = Vec::new();
    let mut descriptors = Vec::new();
    for part in parts {
        descriptors.push((payload.len() as u64, part.len() as u64));
        payload.extend_from_slice(part);
    }
    descriptors.extend_from_slice(extra);

    let mut m = Message::new(tags::msg_type::RAW_DATA_REPORT);
    m.push_group(
        tags::NO_RAW_MESSAGES,
        descriptors
            .iter()
            .enumerate()
            .map(|(i, (offset, length))| {
                vec![
                    Field::new(tags::APPL_SEQ_NUM, (i + 1).to_string()),
                    Field::new(tags::RAW_MESSAGE_OFFSET, offset.to_string()),
                    Field::new(tags::RAW_DATA_LENGTH, length.to_string()),
                ]
            })
            .collect(),
    );
    m.push(tags::RAW_DATA_LENGTH, payload.len().to_string());
    m.push(tags::RAW_DATA, payload);
    m
}

fn records(events: &[Event]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Record { record, .. } => Some(record.template_name.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn accepted_replay_decodes_every_sub_message() {
    let mut protocol = ReplayProtocol::new(ReplayRequest::new("003", 1, 10), decoder(), Vec::<Event>::new());
    let mut outbound: Vec<Message> = Vec::new();
    protocol.on_session_established(&mut outbound).unwrap();
    protocol.on_inbound_message(&ack("0")).unwrap();
    protocol
        .on_inbound_message(&raw_report(&[SEQUENCE_RESET, INC_REFRESH, HEARTBEAT], &[]))
        .unwrap();
    protocol.on_inbound_message(&complete("3")).unwrap();
    protocol.on_session_ended();

    assert_eq!(protocol.state(), ProtocolState::Completed);
    assert_eq!(protocol.records_decoded(), 3);
    let events = protocol.into_sink();
    assert_eq!(events[0], Event::Request(RequestOutcome::Accepted));
    assert_eq!(records(&events), vec!["SequenceReset", "MDIncRefresh", "Heartbeat"]);
    assert!(events.contains(&Event::ReportDecoded { report: 1, decoded: 3, failed: 0 }));
    assert!(events.contains(&Event::Completion(CompletionOutcome::AllReceivedNoErrors)));
    assert_eq!(events.last(), Some(&Event::SessionEnded { state: ProtocolState::Completed }));

    let refresh = events
        .iter()
        .find_map(|e| match e {
            Event::Record { record, .. } if record.template_id == 12 => Some(record.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(refresh.get("MsgSeqNum"), Some(&Value::UInt(5)));
    let Some(Value::Sequence(entries)) = refresh.get("MDEntries") else {
        panic!("no entries in {refresh}");
    };
    assert_eq!(entries.len(), 1);
    assert!(entries[0].contains(&("MDEntryType".to_string(), Value::Ascii("2".into()))));
    assert!(entries[0].contains(&("MDEntryPx".to_string(), Value::Decimal { exponent: -2, mantissa: 12345 })));
    assert!(entries[0].contains(&("MDEntrySize".to_string(), Value::Int(10))));
}

#[test]
fn bad_descriptors_do_not_stop_the_rest() {
    let mut protocol = ReplayProtocol::new(ReplayRequest::new("003", 1, 10), decoder(), Vec::<Event>::new());
    protocol.on_session_established(&mut Vec::<Message>::new()).unwrap();
    protocol.on_inbound_message(&ack("0")).unwrap();
    // a truncated heartbeat, a good one, then a descriptor past the payload
    let truncated = &HEARTBEAT[..3];
    let report = raw_report(&[truncated, HEARTBEAT], &[(2, 4000)]);
    protocol.on_inbound_message(&report).unwrap();

    let events = protocol.into_sink();
    assert_eq!(records(&events), vec!["Heartbeat"]);
    let failed: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            Event::RecordError { index, .. } => Some(*index),
            _ => None,
        })
        .collect();
    assert_eq!(failed, vec![0, 2]);
}

#[test]
fn capture_file_holds_every_event() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("replay.bin");
    let (tx, rx) = bounded::<RecordFrame>(64);
    let writer_path = path.clone();
    let writer = thread::spawn(move || writer_thread(&writer_path, rx));

    let header = FileHeader { version: 1, created_unix_ns: 0, channel: "003".into(), begin_seq: 1, end_seq: 10 };
    let sink = (Vec::<Event>::new(), CaptureSink::open(tx, header.clone()));
    let mut protocol = ReplayProtocol::new(ReplayRequest::new("003", 1, 10), decoder(), sink);
    protocol.on_session_established(&mut Vec::<Message>::new()).unwrap();
    protocol.on_inbound_message(&ack("0")).unwrap();
    protocol.on_inbound_message(&raw_report(&[HEARTBEAT], &[])).unwrap();
    protocol.on_inbound_message(&complete("3")).unwrap();
    protocol.on_session_ended();
    let (seen, capture) = protocol.into_sink();
    drop(capture);
    assert_eq!(writer.join().unwrap().unwrap(), seen.len() as u64 + 1);

    let mut reader = CaptureReader::new(BufReader::new(File::open(&path).unwrap()));
    assert_eq!(reader.next_frame().unwrap(), Some(RecordFrame::Header(header)));
    let captured: Vec<Event> = reader
        .map(|frame| match frame.unwrap() {
            RecordFrame::Event(ev) => ev.event,
            other => panic!("unexpected frame {other:?}"),
        })
        .collect();
    assert_eq!(captured, seen);
}

fn send(stream: &mut impl std::io::Write, seq: &mut u64, msg: &Message) {
    let header = [
        Field::new(tags::session::SENDER_COMP_ID, "UMDF"),
        Field::new(tags::session::TARGET_COMP_ID, "CLIENT"),
        Field::new(tags::session::MSG_SEQ_NUM, seq.to_string()),
    ];
    stream.write_all(&msg.encode("FIX.4.4", &header)).unwrap();
    *seq += 1;
}

#[test]
fn replay_over_tcp_ends_with_logout() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut reader = FrameReader::new(BufReader::new(stream.try_clone().unwrap()));
        let mut seq = 1;

        let logon = reader.read_message().unwrap().unwrap();
        assert_eq!(logon.msg_type().unwrap(), "A");
        send(&mut stream, &mut seq, &Message::new(tags::session::LOGON));

        let request = reader.read_message().unwrap().unwrap();
        send(&mut stream, &mut seq, &ack("0"));
        send(&mut stream, &mut seq, &raw_report(&[INC_REFRESH, HEARTBEAT], &[]));
        send(&mut stream, &mut seq, &complete("3"));

        let logout = reader.read_message().unwrap().unwrap();
        assert_eq!(logout.msg_type().unwrap(), "5");
        send(&mut stream, &mut seq, &Message::new(tags::session::LOGOUT));
        request
    });

    let settings = SessionSettings {
        host: "127.0.0.1".into(),
        port,
        begin_string: "FIX.4.4".into(),
        sender_comp_id: "CLIENT".into(),
        target_comp_id: "UMDF".into(),
        heartbeat: Duration::from_secs(30),
        reset_on_logon: true,
        connect_timeout: Duration::from_secs(5),
    };
    let mut protocol = ReplayProtocol::new(ReplayRequest::new("003", 40, 41), decoder(), Vec::<Event>::new());
    Initiator::new(settings).run(&mut protocol, never()).unwrap();

    let request = server.join().unwrap();
    assert_eq!(request.msg_type().unwrap(), "BW");
    assert_eq!(request.get_str(tags::session::SENDER_COMP_ID).unwrap(), "CLIENT");
    assert_eq!(ReplayRequest::from_message(&request).unwrap(), ReplayRequest::new("003", 40, 41));

    assert_eq!(protocol.state(), ProtocolState::Completed);
    let events = protocol.into_sink();
    assert_eq!(records(&events), vec!["MDIncRefresh", "Heartbeat"]);
    assert_eq!(events.last(), Some(&Event::SessionEnded { state: ProtocolState::Completed }));
}

#[test]
fn shipped_xml_and_json_templates_agree() {
    let (xml, json) = (dictionary("umdf-replay.xml"), dictionary("umdf-replay.json"));
    assert_eq!(xml.len(), 4);
    assert_eq!(json.len(), 4);
    for id in [1, 2, 12, 26] {
        assert!(xml.get(id).is_some(), "template {id}");
        assert_eq!(xml.get(id), json.get(id), "template {id}");
    }
}

#[test]
fn vec_transport_collects_outbound_messages() {
    let mut out: Vec<Message> = Vec::new();
    out.send(Message::new("0")).unwrap();
    assert_eq!(out.len(), 1);
}
