//! Tag=value message model and wire codec.
//!
//! A [`Message`] keeps its fields in wire order. Repeating groups are not
//! materialized: [`Message::group`] returns [`Group`] views that borrow
//! contiguous runs of the message's own fields. Length-prefixed data fields
//! (RawData and friends) may contain SOH bytes, so the body parser reads
//! them by the length declared in the field right before them.
use crate::tags::{self, session as st};
use std::fmt;
use std::io::{self, BufRead};
use std::str::FromStr;
use thiserror::Error;

pub const SOH: u8 = 0x01;

/// Upper bound accepted for BodyLength when reading from a stream.
const MAX_BODY_LEN: usize = 64 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub tag: u32,
    pub value: Vec<u8>,
}

impl Field {
    pub fn new(tag: u32, value: impl Into<Vec<u8>>) -> Self {
        Self { tag, value: value.into() }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FieldError {
    #[error("required tag {0} missing")]
    Missing(u32),
    #[error("tag {0} has an incorrect data format")]
    BadFormat(u32),
    #[error("tag {0} has an incorrect value")]
    BadValue(u32),
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("garbled message: {0}")]
    Garbled(String),
    #[error("checksum mismatch: declared {declared:03}, computed {computed:03}")]
    Checksum { declared: u8, computed: u8 },
}

/// Typed getters shared by whole messages and group entries.
pub trait FieldAccess {
    fn fields(&self) -> &[Field];

    fn get_bytes(&self, tag: u32) -> Option<&[u8]> {
        self.fields().iter().find(|f| f.tag == tag).map(|f| f.value.as_slice())
    }

    fn get_str(&self, tag: u32) -> Result<&str, FieldError> {
        let bytes = self.get_bytes(tag).ok_or(FieldError::Missing(tag))?;
        std::str::from_utf8(bytes).map_err(|_| FieldError::BadFormat(tag))
    }

    fn get_parsed<T: FromStr>(&self, tag: u32) -> Result<T, FieldError> {
        self.get_str(tag)?.parse().map_err(|_| FieldError::BadFormat(tag))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    fields: Vec<Field>,
}

/// One entry of a repeating group, borrowed from its message.
#[derive(Debug, Clone, Copy)]
pub struct Group<'a> {
    fields: &'a [Field],
}

impl FieldAccess for Message {
    fn fields(&self) -> &[Field] {
        &self.fields
    }
}

impl FieldAccess for Group<'_> {
    fn fields(&self) -> &[Field] {
        self.fields
    }
}

impl Message {
    /// Start an outbound message of the given type.
    pub fn new(msg_type: &str) -> Self {
        Self { fields: vec![Field::new(st::MSG_TYPE, msg_type)] }
    }

    pub fn from_fields(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn msg_type(&self) -> Result<&str, FieldError> {
        self.get_str(st::MSG_TYPE)
    }

    /// Append a field in wire order.
    pub fn push(&mut self, tag: u32, value: impl Into<Vec<u8>>) -> &mut Self {
        self.fields.push(Field::new(tag, value));
        self
    }

    /// Append a repeating group: the count field followed by every entry's fields.
    pub fn push_group(&mut self, count_tag: u32, entries: Vec<Vec<Field>>) -> &mut Self {
        self.push(count_tag, entries.len().to_string());
        for entry in entries {
            self.fields.extend(entry);
        }
        self
    }

    /// Entries of the repeating group introduced by `count_tag`.
    ///
    /// `members[0]` is the delimiter that opens each entry. An entry ends at
    /// the next delimiter, at a tag outside `members`, or at a tag it already
    /// holds. The declared count must match the entries found.
    pub fn group(&self, count_tag: u32, members: &[u32]) -> Result<Vec<Group<'_>>, FieldError> {
        let delimiter = *members.first().ok_or(FieldError::BadValue(count_tag))?;
        let pos = self
            .fields
            .iter()
            .position(|f| f.tag == count_tag)
            .ok_or(FieldError::Missing(count_tag))?;
        let count: usize = self.get_parsed(count_tag)?;

        let mut entries = Vec::with_capacity(count.min(self.fields.len()));
        let mut start: Option<usize> = None;
        let mut end = pos + 1;
        while end < self.fields.len() {
            let tag = self.fields[end].tag;
            if tag == delimiter {
                if let Some(s) = start {
                    entries.push(Group { fields: &self.fields[s..end] });
                }
                start = Some(end);
            } else {
                let belongs = match start {
                    Some(s) => members.contains(&tag) && !self.fields[s..end].iter().any(|f| f.tag == tag),
                    None => false,
                };
                if !belongs {
                    break;
                }
            }
            end += 1;
        }
        if let Some(s) = start {
            entries.push(Group { fields: &self.fields[s..end] });
        }
        if entries.len() != count {
            return Err(FieldError::BadValue(count_tag));
        }
        Ok(entries)
    }

    /// Serialize with BodyLength and CheckSum. MsgType goes first, then
    /// `header`, then the remaining fields in order.
    pub fn encode(&self, begin_string: &str, header: &[Field]) -> Vec<u8> {
        let mut body = Vec::with_capacity(128);
        let msg_type = self.fields.iter().filter(|f| f.tag == st::MSG_TYPE);
        let rest = self.fields.iter().filter(|f| f.tag != st::MSG_TYPE);
        for field in msg_type.chain(header.iter()).chain(rest) {
            body.extend_from_slice(field.tag.to_string().as_bytes());
            body.push(b'=');
            body.extend_from_slice(&field.value);
            body.push(SOH);
        }

        let mut out = Vec::with_capacity(body.len() + 32);
        out.extend_from_slice(format!("{}={begin_string}\u{1}{}={}\u{1}", st::BEGIN_STRING, st::BODY_LENGTH, body.len()).as_bytes());
        out.extend_from_slice(&body);
        let sum = checksum(&out);
        out.extend_from_slice(format!("{}={sum:03}\u{1}", st::CHECK_SUM).as_bytes());
        out
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for field in &self.fields {
            if data_length_tag(field.tag).is_some() {
                write!(f, "{}=<{} bytes>|", field.tag, field.value.len())?;
            } else {
                write!(f, "{}={}|", field.tag, String::from_utf8_lossy(&field.value))?;
            }
        }
        Ok(())
    }
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Value of `field` when it is exactly one `tag=value<SOH>`.
fn tag_value(field: &[u8], tag: u32) -> Option<&[u8]> {
    let prefix = format!("{tag}=");
    field.strip_prefix(prefix.as_bytes())?.strip_suffix(&[SOH])
}

fn data_length_tag(tag: u32) -> Option<u32> {
    tags::DATA_FIELDS.iter().find(|(_, data)| *data == tag).map(|(len, _)| *len)
}

/// Parse the fields between BodyLength and CheckSum.
pub fn parse_body(body: &[u8]) -> Result<Vec<Field>, WireError> {
    let mut fields: Vec<Field> = Vec::new();
    let mut pos = 0usize;
    while pos < body.len() {
        let eq = body[pos..]
            .iter()
            .position(|&b| b == b'=')
            .map(|p| p + pos)
            .ok_or_else(|| WireError::Garbled(format!("no '=' after offset {pos}")))?;
        let tag: u32 = std::str::from_utf8(&body[pos..eq])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| WireError::Garbled(format!("bad tag at offset {pos}")))?;
        let start = eq + 1;
        let end = match data_length_tag(tag) {
            Some(len_tag) => {
                let len: usize = fields
                    .last()
                    .filter(|f| f.tag == len_tag)
                    .and_then(|f| std::str::from_utf8(&f.value).ok())
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| WireError::Garbled(format!("data tag {tag} without preceding {len_tag}")))?;
                let end = start
                    .checked_add(len)
                    .filter(|e| *e < body.len())
                    .ok_or_else(|| WireError::Garbled(format!("data tag {tag} overruns body")))?;
                if body[end] != SOH {
                    return Err(WireError::Garbled(format!("data tag {tag} not terminated")));
                }
                end
            }
            None => body[start..]
                .iter()
                .position(|&b| b == SOH)
                .map(|p| p + start)
                .ok_or_else(|| WireError::Garbled(format!("tag {tag} not terminated")))?,
        };
        fields.push(Field { tag, value: body[start..end].to_vec() });
        pos = end + 1;
    }
    Ok(fields)
}

/// Reads framed messages off a byte stream, verifying BodyLength and CheckSum.
pub struct FrameReader<R> {
    inner: R,
}

impl<R: BufRead> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Next message, or `None` on a clean end of stream.
    pub fn read_message(&mut self) -> Result<Option<Message>, WireError> {
        let mut frame = Vec::with_capacity(256);
        if self.inner.read_until(SOH, &mut frame)? == 0 {
            return Ok(None);
        }
        if tag_value(&frame, st::BEGIN_STRING).is_none() {
            return Err(WireError::Garbled("expected BeginString".into()));
        }

        let len_start = frame.len();
        self.inner.read_until(SOH, &mut frame)?;
        let len_field = &frame[len_start..];
        let body_len: usize = tag_value(len_field, st::BODY_LENGTH)
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(|s| s.parse().ok())
            .filter(|n| *n <= MAX_BODY_LEN)
            .ok_or_else(|| WireError::Garbled("expected BodyLength".into()))?;

        let body_start = frame.len();
        frame.resize(body_start + body_len, 0);
        self.inner.read_exact(&mut frame[body_start..])?;

        let mut trailer = Vec::with_capacity(8);
        self.inner.read_until(SOH, &mut trailer)?;
        let declared: u8 = tag_value(&trailer, st::CHECK_SUM)
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| WireError::Garbled("expected CheckSum".into()))?;
        let computed = checksum(&frame);
        if declared != computed {
            return Err(WireError::Checksum { declared, computed });
        }

        let fields = parse_body(&frame[body_start..])?;
        Ok(Some(Message::from_fields(fields)))
    }
}
