//! Message types and field tags of the UMDF replay protocol.
//!
//! Request building and response parsing both read from here, so the tags
//! can be audited against the exchange's message reference in one place.

/// Session-level header and admin tags.
pub mod session {
    pub const BEGIN_STRING: u32 = 8;
    pub const BODY_LENGTH: u32 = 9;
    pub const CHECK_SUM: u32 = 10;
    pub const MSG_SEQ_NUM: u32 = 34;
    pub const MSG_TYPE: u32 = 35;
    pub const NEW_SEQ_NO: u32 = 36;
    pub const SIGNATURE: u32 = 89;
    pub const SECURE_DATA_LEN: u32 = 90;
    pub const SECURE_DATA: u32 = 91;
    pub const SIGNATURE_LENGTH: u32 = 93;
    pub const SENDER_COMP_ID: u32 = 49;
    pub const SENDING_TIME: u32 = 52;
    pub const TARGET_COMP_ID: u32 = 56;
    pub const TEXT: u32 = 58;
    pub const ENCRYPT_METHOD: u32 = 98;
    pub const HEART_BT_INT: u32 = 108;
    pub const TEST_REQ_ID: u32 = 112;
    pub const GAP_FILL_FLAG: u32 = 123;
    pub const RESET_SEQ_NUM_FLAG: u32 = 141;

    pub const HEARTBEAT: &str = "0";
    pub const TEST_REQUEST: &str = "1";
    pub const RESEND_REQUEST: &str = "2";
    pub const REJECT: &str = "3";
    pub const SEQUENCE_RESET: &str = "4";
    pub const LOGOUT: &str = "5";
    pub const LOGON: &str = "A";
}

/// Application message types.
pub mod msg_type {
    /// ApplicationMessageRequest, sent once at logon.
    pub const REPLAY_REQUEST: &str = "BW";
    /// ApplicationMessageRequestAck.
    pub const REQUEST_ACK: &str = "BX";
    /// ApplicationMessageReport, sent when the resend is over.
    pub const RESEND_COMPLETE: &str = "BY";
    /// Raw data report carrying FAST-encoded sub-messages.
    pub const RAW_DATA_REPORT: &str = "URDR";
}

pub const APPL_SEQ_NUM: u32 = 1181;
pub const APPL_BEG_SEQ_NUM: u32 = 1182;
pub const APPL_END_SEQ_NUM: u32 = 1183;
pub const APPL_REQ_ID: u32 = 1346;
pub const APPL_REQ_TYPE: u32 = 1347;
pub const APPL_RESPONSE_TYPE: u32 = 1348;
pub const NO_APPL_IDS: u32 = 1351;
pub const APPL_RESPONSE_ERROR: u32 = 1354;
pub const REF_APPL_ID: u32 = 1355;
pub const REF_APPL_LAST_SEQ_NUM: u32 = 1357;
/// ApplReqID of the request an ack or report answers.
pub const REF_APPL_REQ_ID: u32 = 1433;
pub const APPL_NEW_SEQ_NUM: u32 = 1399;
pub const APPL_REPORT_TYPE: u32 = 1426;

pub const RAW_DATA_LENGTH: u32 = 95;
pub const RAW_DATA: u32 = 96;
/// Number of sub-message descriptors in a raw data report.
pub const NO_RAW_MESSAGES: u32 = 10054;
/// Byte offset of a sub-message inside RawData.
pub const RAW_MESSAGE_OFFSET: u32 = 10055;

/// ApplReqType value asking for a retransmission.
pub const APPL_REQ_TYPE_RETRANSMISSION: &str = "0";

/// Tags allowed inside a NoApplIDs entry (first tag is the delimiter).
pub const APPL_ID_MEMBERS: &[u32] = &[
    REF_APPL_ID,
    REF_APPL_REQ_ID,
    APPL_BEG_SEQ_NUM,
    APPL_END_SEQ_NUM,
    REF_APPL_LAST_SEQ_NUM,
    APPL_NEW_SEQ_NUM,
    APPL_RESPONSE_ERROR,
];

/// Tags allowed inside a raw report descriptor entry (first tag is the delimiter).
pub const RAW_MESSAGE_MEMBERS: &[u32] = &[APPL_SEQ_NUM, RAW_MESSAGE_OFFSET, RAW_DATA_LENGTH];

/// Length-prefixed binary fields as `(length tag, data tag)`.
pub const DATA_FIELDS: &[(u32, u32)] = &[
    (RAW_DATA_LENGTH, RAW_DATA),
    (session::SECURE_DATA_LEN, session::SECURE_DATA),
    (session::SIGNATURE_LENGTH, session::SIGNATURE),
];
