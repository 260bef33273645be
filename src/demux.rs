//! Raw report demultiplexer.
//!
//! A raw data report carries one contiguous payload plus a descriptor group
//! locating each FAST sub-message inside it. [`demultiplex`] walks the
//! descriptors in the order they appear in the report and yields one result
//! per descriptor, decoding lazily. A bad descriptor or a bad sub-message
//! only affects its own element.
use crate::fast::{DecodedRecord, FastDecoder, FastError};
use crate::fix::{FieldAccess, FieldError, Message};
use crate::tags;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::ops::Range;
use thiserror::Error;

/// Decodes the bytes of exactly one sub-message.
pub trait SubMessageDecoder {
    type Error: Display;

    fn decode(&self, bytes: &[u8]) -> Result<DecodedRecord, Self::Error>;
}

impl SubMessageDecoder for FastDecoder {
    type Error = FastError;

    fn decode(&self, bytes: &[u8]) -> Result<DecodedRecord, FastError> {
        FastDecoder::decode(self, bytes)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecodeError {
    #[error("sub-message at offset {offset} with length {length} exceeds payload of {payload_len} bytes")]
    OutOfBounds { offset: u64, length: u64, payload_len: usize },
    #[error("malformed sub-message: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubMessageDescriptor {
    pub offset: u64,
    pub length: u64,
}

impl SubMessageDescriptor {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Byte range inside a payload of `payload_len` bytes. Overflowing
    /// `offset + length` counts as out of bounds.
    pub fn range(&self, payload_len: usize) -> Result<Range<usize>, DecodeError> {
        let out_of_bounds = || DecodeError::OutOfBounds { offset: self.offset, length: self.length, payload_len };
        let end = self
            .offset
            .checked_add(self.length)
            .filter(|end| *end <= payload_len as u64)
            .ok_or_else(out_of_bounds)?;
        // both fit: end <= payload_len
        Ok(self.offset as usize..end as usize)
    }
}

/// A raw data report borrowed from its inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawReport<'a> {
    payload: &'a [u8],
    descriptors: Vec<SubMessageDescriptor>,
}

impl<'a> RawReport<'a> {
    pub fn new(payload: &'a [u8], descriptors: Vec<SubMessageDescriptor>) -> Self {
        Self { payload, descriptors }
    }

    /// Extract payload and descriptors from a raw data report message.
    ///
    /// Every declared descriptor is taken; the declared count must match
    /// the entries present.
    pub fn from_message(msg: &'a Message) -> Result<Self, FieldError> {
        let fields = msg.fields();
        let data_pos = fields
            .iter()
            .position(|f| f.tag == tags::RAW_DATA)
            .ok_or(FieldError::Missing(tags::RAW_DATA))?;
        let payload = fields[data_pos].value.as_slice();
        if let Some(len_field) = data_pos.checked_sub(1).map(|i| &fields[i]) {
            if len_field.tag == tags::RAW_DATA_LENGTH {
                let declared: usize = std::str::from_utf8(&len_field.value)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or(FieldError::BadFormat(tags::RAW_DATA_LENGTH))?;
                if declared != payload.len() {
                    return Err(FieldError::BadValue(tags::RAW_DATA_LENGTH));
                }
            }
        }

        let descriptors = msg
            .group(tags::NO_RAW_MESSAGES, tags::RAW_MESSAGE_MEMBERS)?
            .iter()
            .map(|entry| -> Result<_, FieldError> {
                Ok(SubMessageDescriptor {
                    offset: entry.get_parsed(tags::RAW_MESSAGE_OFFSET)?,
                    length: entry.get_parsed(tags::RAW_DATA_LENGTH)?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { payload, descriptors })
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    pub fn descriptors(&self) -> &[SubMessageDescriptor] {
        &self.descriptors
    }
}

/// Lazily decode every sub-message of `report`, in descriptor order.
pub fn demultiplex<'r, D: SubMessageDecoder>(report: &'r RawReport<'_>, decoder: &'r D) -> Demultiplexer<'r, D> {
    Demultiplexer { payload: report.payload, descriptors: report.descriptors.iter(), decoder }
}

pub struct Demultiplexer<'r, D> {
    payload: &'r [u8],
    descriptors: std::slice::Iter<'r, SubMessageDescriptor>,
    decoder: &'r D,
}

impl<D: SubMessageDecoder> Iterator for Demultiplexer<'_, D> {
    type Item = Result<DecodedRecord, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        let descriptor = self.descriptors.next()?;
        let result = descriptor.range(self.payload.len()).and_then(|range| {
            self.decoder
                .decode(&self.payload[range])
                .map_err(|e| DecodeError::Malformed(e.to_string()))
        });
        Some(result)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.descriptors.size_hint()
    }
}

impl<D: SubMessageDecoder> ExactSizeIterator for Demultiplexer<'_, D> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fix::Field;
    use std::cell::Cell;

    /// Treats each slice as a record name; slices starting with `!` are malformed.
    #[derive(Default)]
    struct NameDecoder {
        calls: Cell<usize>,
    }

    impl SubMessageDecoder for NameDecoder {
        type Error = String;

        fn decode(&self, bytes: &[u8]) -> Result<DecodedRecord, String> {
            self.calls.set(self.calls.get() + 1);
            if bytes.is_empty() || bytes[0] == b'!' {
                return Err(format!("bad slice {bytes:?}"));
            }
            Ok(DecodedRecord {
                template_id: bytes.len() as u32,
                template_name: String::from_utf8_lossy(bytes).into_owned(),
                fields: Vec::new(),
            })
        }
    }

    const PAYLOAD: &[u8; 30] = b"aaaaaaaaaabbbbb!!!!!cccccccc!!";

    fn names(results: &[Result<DecodedRecord, DecodeError>]) -> Vec<String> {
        results
            .iter()
            .map(|r| match r {
                Ok(rec) => rec.template_name.clone(),
                Err(DecodeError::OutOfBounds { .. }) => "<oob>".into(),
                Err(DecodeError::Malformed(_)) => "<bad>".into(),
            })
            .collect()
    }

    #[test]
    fn decodes_every_descriptor_in_order() {
        let report = RawReport::new(
            PAYLOAD,
            vec![SubMessageDescriptor::new(0, 10), SubMessageDescriptor::new(10, 5), SubMessageDescriptor::new(20, 8)],
        );
        let results: Vec<_> = demultiplex(&report, &NameDecoder::default()).collect();
        assert_eq!(names(&results), ["aaaaaaaaaa", "bbbbb", "cccccccc"]);
    }

    #[test]
    fn out_of_bounds_does_not_cascade() {
        let report = RawReport::new(
            PAYLOAD,
            vec![SubMessageDescriptor::new(0, 10), SubMessageDescriptor::new(25, 10), SubMessageDescriptor::new(10, 5)],
        );
        let results: Vec<_> = demultiplex(&report, &NameDecoder::default()).collect();
        assert_eq!(names(&results), ["aaaaaaaaaa", "<oob>", "bbbbb"]);
        assert_eq!(results[1], Err(DecodeError::OutOfBounds { offset: 25, length: 10, payload_len: 30 }));
    }

    #[test]
    fn overflowing_descriptor_is_out_of_bounds() {
        let d = SubMessageDescriptor::new(u64::MAX, 2);
        assert!(matches!(d.range(30), Err(DecodeError::OutOfBounds { .. })));
        assert_eq!(SubMessageDescriptor::new(30, 0).range(30), Ok(30..30));
    }

    #[test]
    fn malformed_slice_is_isolated_and_order_follows_descriptors() {
        let report = RawReport::new(
            PAYLOAD,
            vec![SubMessageDescriptor::new(20, 8), SubMessageDescriptor::new(15, 5), SubMessageDescriptor::new(0, 10)],
        );
        let results: Vec<_> = demultiplex(&report, &NameDecoder::default()).collect();
        assert_eq!(names(&results), ["cccccccc", "<bad>", "aaaaaaaaaa"]);
    }

    #[test]
    fn decoding_is_lazy_and_repeatable() {
        let report = RawReport::new(PAYLOAD, vec![SubMessageDescriptor::new(0, 10), SubMessageDescriptor::new(10, 5)]);
        let decoder = NameDecoder::default();
        let mut iter = demultiplex(&report, &decoder);
        assert_eq!(iter.len(), 2);
        assert!(iter.next().is_some());
        assert_eq!(decoder.calls.get(), 1);

        let first: Vec<_> = demultiplex(&report, &decoder).collect();
        let second: Vec<_> = demultiplex(&report, &decoder).collect();
        assert_eq!(first, second);
    }

    fn report_message(entries: &[(u64, u64)], declared: usize) -> Message {
        let mut msg = Message::new(tags::msg_type::RAW_DATA_REPORT);
        msg.push(tags::NO_RAW_MESSAGES, declared.to_string());
        for (i, (offset, length)) in entries.iter().enumerate() {
            msg.push(tags::APPL_SEQ_NUM, (i + 1).to_string());
            msg.push(tags::RAW_MESSAGE_OFFSET, offset.to_string());
            msg.push(tags::RAW_DATA_LENGTH, length.to_string());
        }
        msg.push(tags::RAW_DATA_LENGTH, PAYLOAD.len().to_string());
        msg.push(tags::RAW_DATA, PAYLOAD.as_slice());
        msg
    }

    #[test]
    fn message_yields_all_declared_descriptors() {
        // first and last entries included, unlike a 1..count walk
        let msg = report_message(&[(0, 10), (10, 5), (20, 8)], 3);
        let report = RawReport::from_message(&msg).unwrap();
        assert_eq!(report.payload(), PAYLOAD);
        assert_eq!(
            report.descriptors(),
            &[SubMessageDescriptor::new(0, 10), SubMessageDescriptor::new(10, 5), SubMessageDescriptor::new(20, 8)]
        );
        let results: Vec<_> = demultiplex(&report, &NameDecoder::default()).collect();
        assert_eq!(names(&results), ["aaaaaaaaaa", "bbbbb", "cccccccc"]);
    }

    #[test]
    fn declared_count_must_match_entries() {
        let msg = report_message(&[(0, 10), (10, 5)], 3);
        assert_eq!(RawReport::from_message(&msg).unwrap_err(), FieldError::BadValue(tags::NO_RAW_MESSAGES));
    }

    #[test]
    fn raw_data_length_must_match_payload() {
        let mut msg = Message::new(tags::msg_type::RAW_DATA_REPORT);
        msg.push(tags::NO_RAW_MESSAGES, "0");
        msg.push(tags::RAW_DATA_LENGTH, "4");
        msg.push(tags::RAW_DATA, "abc");
        assert_eq!(RawReport::from_message(&msg).unwrap_err(), FieldError::BadValue(tags::RAW_DATA_LENGTH));

        let msg = Message::from_fields(vec![Field::new(tags::NO_RAW_MESSAGES, "0")]);
        assert_eq!(RawReport::from_message(&msg).unwrap_err(), FieldError::Missing(tags::RAW_DATA));
    }

    #[test]
    fn bad_descriptor_field_format() {
        let mut msg = Message::new(tags::msg_type::RAW_DATA_REPORT);
        msg.push(tags::NO_RAW_MESSAGES, "1");
        msg.push(tags::APPL_SEQ_NUM, "1");
        msg.push(tags::RAW_MESSAGE_OFFSET, "-1");
        msg.push(tags::RAW_DATA_LENGTH, "2");
        msg.push(tags::RAW_DATA_LENGTH, "3");
        msg.push(tags::RAW_DATA, "abc");
        assert_eq!(RawReport::from_message(&msg).unwrap_err(), FieldError::BadFormat(tags::RAW_MESSAGE_OFFSET));
    }
}
