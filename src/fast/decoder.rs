//! FAST decoding of a single sub-message.
//!
//! Layout: `[pmap][template id?][fields...]`. Integers are stop-bit encoded
//! (7 data bits per byte, high bit marks the last byte); signed integers
//! carry their sign in bit 6 of the first byte. Optional fields without a
//! constant operator use the nullable encodings (0 means null, non-negative
//! values shifted by one).
//!
//! Operator state (copy/increment/delta previous values) lives for one
//! `decode` call only, so each sub-message decodes on its own. A decimal
//! coded with separate operators keeps its exponent and mantissa state under
//! `<name>.exponent` and `<name>.mantissa`.
use super::template::{needs_pmap, Instruction, Kind, Operator, ScalarType, TemplateDictionary};
use super::{DecodedRecord, FieldList, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use thiserror::Error;

/// Upper bound on sequence lengths read off the wire.
const MAX_SEQUENCE_LEN: u64 = 1 << 16;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FastError {
    #[error("unexpected end of input at byte {0}")]
    Eof(usize),
    #[error("integer overflow at byte {0}")]
    Overflow(usize),
    #[error("template id missing from presence map")]
    NoTemplateId,
    #[error("unknown template id {0}")]
    UnknownTemplate(u32),
    #[error("mandatory field {0} has no value")]
    MissingValue(String),
    #[error("field {0}: invalid value")]
    InvalidValue(String),
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

type Result<T> = std::result::Result<T, FastError>;

pub struct FastDecoder {
    dictionary: TemplateDictionary,
}

impl FastDecoder {
    pub fn new(dictionary: TemplateDictionary) -> Self {
        Self { dictionary }
    }

    pub fn dictionary(&self) -> &TemplateDictionary {
        &self.dictionary
    }

    /// Decode exactly one message occupying all of `bytes`.
    pub fn decode(&self, bytes: &[u8]) -> Result<DecodedRecord> {
        let mut r = Reader { bytes, pos: 0 };
        let mut pmap = r.pmap()?;
        if !pmap.next_bit() {
            return Err(FastError::NoTemplateId);
        }
        let at = r.pos;
        let id = u32::try_from(r.uint()?).map_err(|_| FastError::Overflow(at))?;
        let template = self.dictionary.get(id).ok_or(FastError::UnknownTemplate(id))?;

        let mut state = OperatorState::default();
        let fields = state.decode_fields(&template.instructions, &mut pmap, &mut r)?;
        if r.remaining() > 0 {
            return Err(FastError::TrailingBytes(r.remaining()));
        }
        Ok(DecodedRecord { template_id: template.id, template_name: template.name.clone(), fields })
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn byte(&mut self) -> Result<u8> {
        let b = *self.bytes.get(self.pos).ok_or(FastError::Eof(self.pos))?;
        self.pos += 1;
        Ok(b)
    }

    /// Bytes up to and including the one with the stop bit.
    fn stop_bit_bytes(&mut self) -> Result<&'a [u8]> {
        let start = self.pos;
        while self.byte()? & 0x80 == 0 {}
        Ok(&self.bytes[start..self.pos])
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(FastError::Eof(self.bytes.len()))?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn uint(&mut self) -> Result<u64> {
        let at = self.pos;
        let mut v: u64 = 0;
        for &b in self.stop_bit_bytes()? {
            v = v.checked_mul(128).ok_or(FastError::Overflow(at))? | u64::from(b & 0x7f);
        }
        Ok(v)
    }

    fn int(&mut self) -> Result<i64> {
        let at = self.pos;
        let bytes = self.stop_bit_bytes()?;
        let mut v: i64 = if bytes[0] & 0x40 != 0 { -1 } else { 0 };
        for &b in bytes {
            v = v.checked_mul(128).ok_or(FastError::Overflow(at))? | i64::from(b & 0x7f);
        }
        Ok(v)
    }

    fn pmap(&mut self) -> Result<PresenceMap> {
        let bytes = self.stop_bit_bytes()?;
        let mut bits = Vec::with_capacity(bytes.len() * 7);
        for b in bytes {
            for shift in (0..7).rev() {
                bits.push((b >> shift) & 1 == 1);
            }
        }
        Ok(PresenceMap { bits, next: 0 })
    }
}

#[derive(Debug, Default)]
struct PresenceMap {
    bits: Vec<bool>,
    next: usize,
}

impl PresenceMap {
    /// Bits past the end of the map read as unset.
    fn next_bit(&mut self) -> bool {
        let bit = self.bits.get(self.next).copied().unwrap_or(false);
        self.next += 1;
        bit
    }
}

fn nullable_uint(raw: u64, nullable: bool) -> Option<u64> {
    match (nullable, raw) {
        (true, 0) => None,
        (true, v) => Some(v - 1),
        (false, v) => Some(v),
    }
}

fn nullable_int(raw: i64, nullable: bool) -> Option<i64> {
    if !nullable {
        return Some(raw);
    }
    match raw.cmp(&0) {
        Ordering::Equal => None,
        Ordering::Greater => Some(raw - 1),
        Ordering::Less => Some(raw),
    }
}

/// Range-check an integer against the field's declared width.
fn integer(ty: ScalarType, n: i128, name: &str) -> Result<Value> {
    let bad = || FastError::InvalidValue(name.to_string());
    match ty {
        ScalarType::UInt32 => u32::try_from(n).map(|v| Value::UInt(v.into())).map_err(|_| bad()),
        ScalarType::UInt64 => u64::try_from(n).map(Value::UInt).map_err(|_| bad()),
        ScalarType::Int32 => i32::try_from(n).map(|v| Value::Int(v.into())).map_err(|_| bad()),
        ScalarType::Int64 => i64::try_from(n).map(Value::Int).map_err(|_| bad()),
        _ => Err(bad()),
    }
}

fn decimal(exponent: i64, mantissa: i64, name: &str) -> Result<Value> {
    match i32::try_from(exponent) {
        Ok(exponent) if (-63..=63).contains(&exponent) => Ok(Value::Decimal { exponent, mantissa }),
        _ => Err(FastError::InvalidValue(name.to_string())),
    }
}

fn as_i128(value: &Value, name: &str) -> Result<i128> {
    match value {
        Value::UInt(v) => Ok((*v).into()),
        Value::Int(v) => Ok((*v).into()),
        _ => Err(FastError::InvalidValue(name.to_string())),
    }
}

fn read_scalar(r: &mut Reader<'_>, ty: ScalarType, nullable: bool, name: &str) -> Result<Option<Value>> {
    let value = match ty {
        ScalarType::UInt32 | ScalarType::UInt64 => match nullable_uint(r.uint()?, nullable) {
            Some(v) => integer(ty, v.into(), name)?,
            None => return Ok(None),
        },
        ScalarType::Int32 | ScalarType::Int64 => match nullable_int(r.int()?, nullable) {
            Some(v) => integer(ty, v.into(), name)?,
            None => return Ok(None),
        },
        ScalarType::Decimal => {
            let Some(exponent) = nullable_int(r.int()?, nullable) else {
                return Ok(None);
            };
            decimal(exponent, r.int()?, name)?
        }
        ScalarType::Ascii => {
            let masked: Vec<u8> = r.stop_bit_bytes()?.iter().map(|b| b & 0x7f).collect();
            let text = match (nullable, masked.as_slice()) {
                (true, [0]) => return Ok(None),
                (true, [0, 0]) | (false, [0]) => Vec::new(),
                (true, [0, 0, 0]) | (false, [0, 0]) => vec![0],
                _ => masked,
            };
            let text = String::from_utf8(text).map_err(|_| FastError::InvalidValue(name.to_string()))?;
            Value::Ascii(text)
        }
        ScalarType::Unicode | ScalarType::ByteVector => {
            let at = r.pos;
            let Some(len) = nullable_uint(r.uint()?, nullable) else {
                return Ok(None);
            };
            let len = usize::try_from(len).map_err(|_| FastError::Overflow(at))?;
            let bytes = r.take(len)?.to_vec();
            if ty == ScalarType::ByteVector {
                Value::Bytes(bytes)
            } else {
                Value::Unicode(String::from_utf8(bytes).map_err(|_| FastError::InvalidValue(name.to_string()))?)
            }
        }
    };
    Ok(Some(value))
}

/// Previous values keyed by field name. A missing key is "undefined",
/// `Some(None)` is "empty".
#[derive(Default)]
struct OperatorState<'t> {
    previous: HashMap<&'t str, Option<Value>>,
}

impl<'t> OperatorState<'t> {
    fn decode_fields(
        &mut self,
        fields: &'t [Instruction],
        pmap: &mut PresenceMap,
        r: &mut Reader<'_>,
    ) -> Result<FieldList> {
        let mut out = Vec::with_capacity(fields.len());
        for ins in fields {
            if let Some(value) = self.decode_instruction(ins, pmap, r)? {
                out.push((ins.name.clone(), value));
            }
        }
        Ok(out)
    }

    fn decode_instruction(
        &mut self,
        ins: &'t Instruction,
        pmap: &mut PresenceMap,
        r: &mut Reader<'_>,
    ) -> Result<Option<Value>> {
        match &ins.kind {
            Kind::Scalar(ty) => self.decode_scalar(ins, *ty, pmap, r),
            Kind::Decimal { exponent, mantissa } => {
                // an absent exponent means no mantissa on the wire or in the map
                let exponent = match self.decode_scalar(exponent, ScalarType::Int32, pmap, r)? {
                    Some(Value::Int(e)) => e,
                    Some(_) => return Err(FastError::InvalidValue(ins.name.clone())),
                    None => return Ok(None),
                };
                let mantissa = match self.decode_scalar(mantissa, ScalarType::Int64, pmap, r)? {
                    Some(Value::Int(m)) => m,
                    Some(_) => return Err(FastError::InvalidValue(ins.name.clone())),
                    None => return Err(FastError::MissingValue(mantissa.name.clone())),
                };
                decimal(exponent, mantissa, &ins.name).map(Some)
            }
            Kind::Sequence { length, fields } => {
                let n = match self.decode_scalar(length, ScalarType::UInt32, pmap, r)? {
                    Some(Value::UInt(n)) => n,
                    _ => return Ok(None),
                };
                if n > MAX_SEQUENCE_LEN {
                    return Err(FastError::InvalidValue(ins.name.clone()));
                }
                let with_pmap = needs_pmap(fields);
                let mut elements = Vec::with_capacity((n as usize).min(r.remaining()));
                for _ in 0..n {
                    let mut inner = if with_pmap { r.pmap()? } else { PresenceMap::default() };
                    elements.push(self.decode_fields(fields, &mut inner, r)?);
                }
                Ok(Some(Value::Sequence(elements)))
            }
            Kind::Group(fields) => {
                if ins.optional && !pmap.next_bit() {
                    return Ok(None);
                }
                let mut inner = if needs_pmap(fields) { r.pmap()? } else { PresenceMap::default() };
                Ok(Some(Value::Group(self.decode_fields(fields, &mut inner, r)?)))
            }
        }
    }

    fn decode_scalar(
        &mut self,
        ins: &'t Instruction,
        ty: ScalarType,
        pmap: &mut PresenceMap,
        r: &mut Reader<'_>,
    ) -> Result<Option<Value>> {
        let name = ins.name.as_str();
        match &ins.op {
            Operator::None => read_scalar(r, ty, ins.optional, name),
            Operator::Constant(value) => {
                let present = !ins.optional || pmap.next_bit();
                Ok(present.then(|| value.clone()))
            }
            Operator::Default(initial) => {
                if pmap.next_bit() {
                    read_scalar(r, ty, ins.optional, name)
                } else {
                    Ok(initial.clone())
                }
            }
            Operator::Copy(initial) => {
                if pmap.next_bit() {
                    let value = read_scalar(r, ty, ins.optional, name)?;
                    self.previous.insert(name, value.clone());
                    Ok(value)
                } else {
                    let value = self.previous_or_initial(name, initial);
                    self.present_or_missing(ins, value)
                }
            }
            Operator::Increment(initial) => {
                if pmap.next_bit() {
                    let value = read_scalar(r, ty, ins.optional, name)?;
                    self.previous.insert(name, value.clone());
                    return Ok(value);
                }
                let value = match self.previous.get(name) {
                    Some(Some(prev)) => {
                        let next = integer(ty, as_i128(prev, name)? + 1, name)?;
                        self.previous.insert(name, Some(next.clone()));
                        Some(next)
                    }
                    Some(None) => None,
                    None => self.previous_or_initial(name, initial),
                };
                self.present_or_missing(ins, value)
            }
            Operator::Delta(initial) if ty == ScalarType::Decimal => self.decimal_delta(ins, initial, r),
            Operator::Delta(initial) => {
                let at = r.pos;
                let Some(delta) = nullable_int(r.int()?, ins.optional) else {
                    return Ok(None);
                };
                let base = match self.previous.get(name) {
                    Some(Some(prev)) => as_i128(prev, name)?,
                    Some(None) => return Err(FastError::MissingValue(name.to_string())),
                    None => initial.as_ref().map(|v| as_i128(v, name)).transpose()?.unwrap_or(0),
                };
                let sum = base.checked_add(delta.into()).ok_or(FastError::Overflow(at))?;
                let value = integer(ty, sum, name)?;
                self.previous.insert(name, Some(value.clone()));
                Ok(Some(value))
            }
        }
    }

    /// Exponent and mantissa deltas applied to the previous decimal (or the
    /// initial value, or 0e0).
    fn decimal_delta(&mut self, ins: &'t Instruction, initial: &Option<Value>, r: &mut Reader<'_>) -> Result<Option<Value>> {
        let name = ins.name.as_str();
        let at = r.pos;
        let Some(exponent_delta) = nullable_int(r.int()?, ins.optional) else {
            return Ok(None);
        };
        let mantissa_delta = r.int()?;
        let (exponent, mantissa) = match (self.previous.get(name), initial) {
            (Some(Some(Value::Decimal { exponent, mantissa })), _) | (None, Some(Value::Decimal { exponent, mantissa })) => {
                (*exponent, *mantissa)
            }
            (Some(None), _) => return Err(FastError::MissingValue(name.to_string())),
            (None, None) => (0, 0),
            _ => return Err(FastError::InvalidValue(name.to_string())),
        };
        let exponent = i64::from(exponent).checked_add(exponent_delta).ok_or(FastError::Overflow(at))?;
        let mantissa = mantissa.checked_add(mantissa_delta).ok_or(FastError::Overflow(at))?;
        let value = decimal(exponent, mantissa, name)?;
        self.previous.insert(name, Some(value.clone()));
        Ok(Some(value))
    }

    /// Value carried over from the previous occurrence; an undefined entry
    /// takes the initial value (or becomes empty).
    fn previous_or_initial(&mut self, name: &'t str, initial: &Option<Value>) -> Option<Value> {
        match self.previous.get(name) {
            Some(prev) => prev.clone(),
            None => {
                self.previous.insert(name, initial.clone());
                initial.clone()
            }
        }
    }

    fn present_or_missing(&self, ins: &Instruction, value: Option<Value>) -> Result<Option<Value>> {
        match value {
            None if !ins.optional => Err(FastError::MissingValue(ins.name.clone())),
            other => Ok(other),
        }
    }
}
