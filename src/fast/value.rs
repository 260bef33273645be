use serde::{Deserialize, Serialize};
use std::fmt;

/// Field name/value pairs in template order. Absent optional fields are omitted.
pub type FieldList = Vec<(String, Value)>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    UInt(u64),
    Int(i64),
    /// `mantissa * 10^exponent`
    Decimal { exponent: i32, mantissa: i64 },
    Ascii(String),
    Unicode(String),
    Bytes(Vec<u8>),
    Sequence(Vec<FieldList>),
    Group(FieldList),
}

/// One decoded sub-message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedRecord {
    pub template_id: u32,
    pub template_name: String,
    pub fields: FieldList,
}

impl DecodedRecord {
    /// First top-level field with the given name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

fn write_fields(f: &mut fmt::Formatter<'_>, fields: &FieldList) -> fmt::Result {
    for (name, value) in fields {
        match value {
            Value::Sequence(elements) => {
                write!(f, "{name}={}|", elements.len())?;
                for element in elements {
                    write_fields(f, element)?;
                }
            }
            Value::Group(inner) => write_fields(f, inner)?,
            scalar => write!(f, "{name}={scalar}|")?,
        }
    }
    Ok(())
}

impl fmt::Display for DecodedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "template={}|", self.template_name)?;
        write_fields(f, &self.fields)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::UInt(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Decimal { exponent, mantissa } => fmt_decimal(f, *mantissa, *exponent),
            Value::Ascii(s) | Value::Unicode(s) => f.write_str(s),
            Value::Bytes(bytes) => {
                for b in bytes {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
            Value::Sequence(elements) => write!(f, "[{} entries]", elements.len()),
            Value::Group(fields) => write!(f, "{{{} fields}}", fields.len()),
        }
    }
}

fn fmt_decimal(f: &mut fmt::Formatter<'_>, mantissa: i64, exponent: i32) -> fmt::Result {
    if exponent >= 0 {
        write!(f, "{mantissa}")?;
        if mantissa != 0 {
            for _ in 0..exponent {
                f.write_str("0")?;
            }
        }
        return Ok(());
    }
    let sign = if mantissa < 0 { "-" } else { "" };
    let digits = mantissa.unsigned_abs().to_string();
    let scale = exponent.unsigned_abs() as usize;
    if digits.len() > scale {
        let (int, frac) = digits.split_at(digits.len() - scale);
        write!(f, "{sign}{int}.{frac}")
    } else {
        write!(f, "{sign}0.{}{digits}", "0".repeat(scale - digits.len()))
    }
}
