//! Template dictionary: the template document and its compiled form.
//!
//! Templates come either as the exchange's FAST 1.1 XML (see [`super::xml`])
//! or as a JSON document of the same shape. Both lists templates by id; every
//! field names its type, presence and field operator. Loading validates the
//! whole document up front so the decoder never meets an inconsistent
//! instruction.
use super::Value;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::{fs, io};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("cannot read {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("invalid template document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid template XML: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("duplicate template id {0}")]
    DuplicateId(u32),
    #[error("field {field}: {reason}")]
    InvalidField { field: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldType {
    UInt32,
    UInt64,
    Int32,
    Int64,
    Decimal,
    Ascii,
    Unicode,
    ByteVector,
    Sequence,
    Group,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    #[default]
    Mandatory,
    Optional,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatorDef {
    #[default]
    None,
    Constant {
        value: String,
    },
    Default {
        #[serde(default)]
        value: Option<String>,
    },
    Copy {
        #[serde(default)]
        value: Option<String>,
    },
    Increment {
        #[serde(default)]
        value: Option<String>,
    },
    Delta {
        #[serde(default)]
        value: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FieldDef {
    pub name: String,
    #[serde(default)]
    pub id: Option<u32>,
    #[serde(rename = "type")]
    pub kind: FieldType,
    #[serde(default)]
    pub presence: Presence,
    #[serde(default)]
    pub operator: OperatorDef,
    /// Children of a sequence or group.
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    /// Operator of a sequence's implicit length field.
    #[serde(default)]
    pub length_operator: OperatorDef,
    /// Operators of a decimal coded as separate exponent and mantissa.
    #[serde(default)]
    pub exponent: Option<OperatorDef>,
    #[serde(default)]
    pub mantissa: Option<OperatorDef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateDef {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
}

#[derive(Debug, Clone, Deserialize)]
struct DictionaryDef {
    templates: Vec<TemplateDef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScalarType {
    UInt32,
    UInt64,
    Int32,
    Int64,
    Decimal,
    Ascii,
    Unicode,
    ByteVector,
}

impl ScalarType {
    pub(crate) fn is_integer(self) -> bool {
        matches!(self, Self::UInt32 | Self::UInt64 | Self::Int32 | Self::Int64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Operator {
    None,
    Constant(Value),
    Default(Option<Value>),
    Copy(Option<Value>),
    Increment(Option<Value>),
    Delta(Option<Value>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Kind {
    Scalar(ScalarType),
    /// Decimal with its own exponent (int32) and mantissa (int64) operators.
    Decimal { exponent: Box<Instruction>, mantissa: Box<Instruction> },
    Sequence { length: Box<Instruction>, fields: Vec<Instruction> },
    Group(Vec<Instruction>),
}

/// A compiled field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Instruction {
    pub name: String,
    pub optional: bool,
    pub op: Operator,
    pub kind: Kind,
}

impl Instruction {
    /// Presence map bits this instruction consumes in its enclosing map.
    pub(crate) fn pmap_bits(&self) -> usize {
        match &self.kind {
            Kind::Scalar(_) => match self.op {
                Operator::None | Operator::Delta(_) => 0,
                Operator::Constant(_) => usize::from(self.optional),
                Operator::Default(_) | Operator::Copy(_) | Operator::Increment(_) => 1,
            },
            Kind::Decimal { exponent, mantissa } => exponent.pmap_bits() + mantissa.pmap_bits(),
            Kind::Sequence { length, .. } => length.pmap_bits(),
            Kind::Group(_) => usize::from(self.optional),
        }
    }
}

/// Whether a segment holding `fields` carries its own presence map.
pub(crate) fn needs_pmap(fields: &[Instruction]) -> bool {
    fields.iter().any(|f| f.pmap_bits() > 0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub id: u32,
    pub name: String,
    pub(crate) instructions: Vec<Instruction>,
}

#[derive(Debug, Clone, Default)]
pub struct TemplateDictionary {
    templates: HashMap<u32, Template>,
}

impl TemplateDictionary {
    /// Load a `.xml` FAST template file, or a JSON document otherwise.
    pub fn load(path: &Path) -> Result<Self, TemplateError> {
        let text = fs::read_to_string(path).map_err(|source| TemplateError::Io { path: path.to_path_buf(), source })?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("xml") => Self::from_xml(&text),
            _ => Self::from_json(&text),
        }
    }

    pub fn from_json(text: &str) -> Result<Self, TemplateError> {
        let def: DictionaryDef = serde_json::from_str(text)?;
        Self::from_defs(def.templates)
    }

    pub fn from_xml(text: &str) -> Result<Self, TemplateError> {
        Self::from_defs(super::xml::parse(text)?)
    }

    pub fn from_defs(defs: Vec<TemplateDef>) -> Result<Self, TemplateError> {
        let mut templates = HashMap::with_capacity(defs.len());
        for t in defs {
            let instructions = t.fields.iter().map(compile).collect::<Result<Vec<_>, _>>()?;
            let template = Template { id: t.id, name: t.name, instructions };
            if templates.insert(t.id, template).is_some() {
                return Err(TemplateError::DuplicateId(t.id));
            }
        }
        Ok(Self { templates })
    }

    pub fn get(&self, id: u32) -> Option<&Template> {
        self.templates.get(&id)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> TemplateError {
    TemplateError::InvalidField { field: field.to_string(), reason: reason.into() }
}

fn compile(def: &FieldDef) -> Result<Instruction, TemplateError> {
    let optional = def.presence == Presence::Optional;
    let scalar = match def.kind {
        FieldType::UInt32 => ScalarType::UInt32,
        FieldType::UInt64 => ScalarType::UInt64,
        FieldType::Int32 => ScalarType::Int32,
        FieldType::Int64 => ScalarType::Int64,
        FieldType::Decimal => ScalarType::Decimal,
        FieldType::Ascii => ScalarType::Ascii,
        FieldType::Unicode => ScalarType::Unicode,
        FieldType::ByteVector => ScalarType::ByteVector,
        FieldType::Sequence | FieldType::Group => return compile_composite(def, optional),
    };
    if !def.fields.is_empty() {
        return Err(invalid(&def.name, "scalar field cannot have children"));
    }
    if def.exponent.is_some() || def.mantissa.is_some() {
        if scalar != ScalarType::Decimal {
            return Err(invalid(&def.name, "exponent and mantissa operators apply to decimals only"));
        }
        return compile_split_decimal(def, optional);
    }
    let op = compile_operator(&def.name, scalar, optional, &def.operator)?;
    Ok(Instruction { name: def.name.clone(), optional, op, kind: Kind::Scalar(scalar) })
}

fn compile_composite(def: &FieldDef, optional: bool) -> Result<Instruction, TemplateError> {
    if def.fields.is_empty() {
        return Err(invalid(&def.name, "has no fields"));
    }
    if def.operator != OperatorDef::None {
        return Err(invalid(&def.name, "operators apply to scalar fields only"));
    }
    let fields = def.fields.iter().map(compile).collect::<Result<Vec<_>, _>>()?;
    let kind = if def.kind == FieldType::Sequence {
        let name = format!("{}.length", def.name);
        let op = compile_operator(&name, ScalarType::UInt32, optional, &def.length_operator)?;
        let length = Instruction { name, optional, op, kind: Kind::Scalar(ScalarType::UInt32) };
        Kind::Sequence { length: Box::new(length), fields }
    } else {
        if def.length_operator != OperatorDef::None {
            return Err(invalid(&def.name, "lengthOperator applies to sequences only"));
        }
        Kind::Group(fields)
    };
    Ok(Instruction { name: def.name.clone(), optional, op: Operator::None, kind })
}

/// A decimal whose exponent and mantissa carry their own operators. The
/// exponent takes the decimal's presence; the mantissa is always mandatory.
fn compile_split_decimal(def: &FieldDef, optional: bool) -> Result<Instruction, TemplateError> {
    if def.operator != OperatorDef::None {
        return Err(invalid(&def.name, "decimal takes one operator or exponent and mantissa operators, not both"));
    }
    let part = |suffix: &str, ty: ScalarType, optional: bool, op: &Option<OperatorDef>| {
        let name = format!("{}.{suffix}", def.name);
        let op = compile_operator(&name, ty, optional, op.as_ref().unwrap_or(&OperatorDef::None))?;
        Ok::<_, TemplateError>(Box::new(Instruction { name, optional, op, kind: Kind::Scalar(ty) }))
    };
    let exponent = part("exponent", ScalarType::Int32, optional, &def.exponent)?;
    let mantissa = part("mantissa", ScalarType::Int64, false, &def.mantissa)?;
    Ok(Instruction { name: def.name.clone(), optional, op: Operator::None, kind: Kind::Decimal { exponent, mantissa } })
}

fn compile_operator(
    name: &str,
    ty: ScalarType,
    optional: bool,
    def: &OperatorDef,
) -> Result<Operator, TemplateError> {
    let initial = |value: &Option<String>| value.as_deref().map(|v| parse_value(name, ty, v)).transpose();
    let op = match def {
        OperatorDef::None => Operator::None,
        OperatorDef::Constant { value } => Operator::Constant(parse_value(name, ty, value)?),
        OperatorDef::Default { value } => {
            if value.is_none() && !optional {
                return Err(invalid(name, "mandatory default needs a value"));
            }
            Operator::Default(initial(value)?)
        }
        OperatorDef::Copy { value } => Operator::Copy(initial(value)?),
        OperatorDef::Increment { .. } if !ty.is_integer() => {
            return Err(invalid(name, "increment needs an integer type"));
        }
        OperatorDef::Delta { .. } if !ty.is_integer() && ty != ScalarType::Decimal => {
            return Err(invalid(name, "delta needs an integer or decimal type"));
        }
        OperatorDef::Increment { value } => Operator::Increment(initial(value)?),
        OperatorDef::Delta { value } => Operator::Delta(initial(value)?),
    };
    Ok(op)
}

/// Parse an initial or constant value written in the template document.
pub(crate) fn parse_value(name: &str, ty: ScalarType, text: &str) -> Result<Value, TemplateError> {
    let bad = || invalid(name, format!("cannot parse {text:?} as {ty:?}"));
    let value = match ty {
        ScalarType::UInt32 => Value::UInt(text.parse::<u32>().map_err(|_| bad())?.into()),
        ScalarType::UInt64 => Value::UInt(text.parse().map_err(|_| bad())?),
        ScalarType::Int32 => Value::Int(text.parse::<i32>().map_err(|_| bad())?.into()),
        ScalarType::Int64 => Value::Int(text.parse().map_err(|_| bad())?),
        ScalarType::Decimal => parse_decimal(text).ok_or_else(bad)?,
        ScalarType::Ascii if !text.is_ascii() => return Err(bad()),
        ScalarType::Ascii => Value::Ascii(text.to_string()),
        ScalarType::Unicode => Value::Unicode(text.to_string()),
        ScalarType::ByteVector => Value::Bytes(text.as_bytes().to_vec()),
    };
    Ok(value)
}

fn parse_decimal(text: &str) -> Option<Value> {
    let (int, frac) = text.split_once('.').unwrap_or((text, ""));
    if !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let mantissa: i64 = format!("{int}{frac}").parse().ok()?;
    let exponent = -i32::try_from(frac.len()).ok()?;
    Some(Value::Decimal { exponent, mantissa })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_sequence_with_length_operator() {
        let dict = TemplateDictionary::from_json(
            r#"{"templates":[{"id":7,"name":"T","fields":[
                {"name":"MsgType","type":"ascii","operator":{"constant":{"value":"X"}}},
                {"name":"Entries","type":"sequence","lengthOperator":{"copy":{}},"fields":[
                    {"name":"Px","type":"decimal","presence":"optional","operator":{"default":{}}},
                    {"name":"Size","type":"int64","operator":{"delta":{}}}
                ]}
            ]}]}"#,
        )
        .unwrap();
        let t = dict.get(7).unwrap();
        assert_eq!(t.name, "T");
        assert_eq!(t.instructions[0].op, Operator::Constant(Value::Ascii("X".into())));
        assert_eq!(t.instructions[0].pmap_bits(), 0);
        match &t.instructions[1].kind {
            Kind::Sequence { length, fields } => {
                assert_eq!(length.pmap_bits(), 1);
                assert!(needs_pmap(fields));
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn rejects_inconsistent_documents() {
        let dup = r#"{"templates":[{"id":1,"name":"A"},{"id":1,"name":"B"}]}"#;
        assert!(matches!(TemplateDictionary::from_json(dup), Err(TemplateError::DuplicateId(1))));

        let delta_on_string = r#"{"templates":[{"id":1,"name":"A","fields":[
            {"name":"S","type":"ascii","operator":{"delta":{}}}]}]}"#;
        assert!(matches!(TemplateDictionary::from_json(delta_on_string), Err(TemplateError::InvalidField { .. })));

        let bad_constant = r#"{"templates":[{"id":1,"name":"A","fields":[
            {"name":"N","type":"uInt32","operator":{"constant":{"value":"-1"}}}]}]}"#;
        assert!(matches!(TemplateDictionary::from_json(bad_constant), Err(TemplateError::InvalidField { .. })));

        let mandatory_default = r#"{"templates":[{"id":1,"name":"A","fields":[
            {"name":"N","type":"uInt32","operator":{"default":{}}}]}]}"#;
        assert!(matches!(TemplateDictionary::from_json(mandatory_default), Err(TemplateError::InvalidField { .. })));

        assert!(matches!(TemplateDictionary::from_json("{"), Err(TemplateError::Json(_))));
    }

    #[test]
    fn decimal_operators_compile() {
        let dict = TemplateDictionary::from_json(
            r#"{"templates":[{"id":3,"name":"T","fields":[
                {"name":"Px","type":"decimal","operator":{"delta":{"value":"1.5"}}},
                {"name":"Qty","type":"decimal","presence":"optional",
                 "exponent":{"copy":{"value":"-2"}},"mantissa":{"delta":{}}}
            ]}]}"#,
        )
        .unwrap();
        let t = dict.get(3).unwrap();
        assert_eq!(t.instructions[0].op, Operator::Delta(Some(Value::Decimal { exponent: -1, mantissa: 15 })));
        assert_eq!(t.instructions[0].pmap_bits(), 0);
        match &t.instructions[1].kind {
            Kind::Decimal { exponent, mantissa } => {
                assert_eq!(exponent.name, "Qty.exponent");
                assert!(exponent.optional);
                assert_eq!(exponent.op, Operator::Copy(Some(Value::Int(-2))));
                assert_eq!(mantissa.name, "Qty.mantissa");
                assert!(!mantissa.optional);
                assert_eq!(mantissa.op, Operator::Delta(None));
            }
            other => panic!("unexpected kind {other:?}"),
        }
        assert_eq!(t.instructions[1].pmap_bits(), 1);

        let increment_on_decimal = r#"{"templates":[{"id":1,"name":"A","fields":[
            {"name":"Px","type":"decimal","operator":{"increment":{}}}]}]}"#;
        assert!(matches!(TemplateDictionary::from_json(increment_on_decimal), Err(TemplateError::InvalidField { .. })));

        let split_on_integer = r#"{"templates":[{"id":1,"name":"A","fields":[
            {"name":"N","type":"int64","mantissa":{"delta":{}}}]}]}"#;
        assert!(matches!(TemplateDictionary::from_json(split_on_integer), Err(TemplateError::InvalidField { .. })));

        let both = r#"{"templates":[{"id":1,"name":"A","fields":[
            {"name":"Px","type":"decimal","operator":{"copy":{}},"exponent":{"copy":{}}}]}]}"#;
        assert!(matches!(TemplateDictionary::from_json(both), Err(TemplateError::InvalidField { .. })));
    }

    #[test]
    fn load_picks_the_format_from_the_extension() {
        let dir = tempfile::tempdir().unwrap();
        let xml = dir.path().join("t.xml");
        fs::write(&xml, r#"<templates><template name="Hb" id="2"><uInt32 name="MsgSeqNum" id="34"/></template></templates>"#)
            .unwrap();
        assert_eq!(TemplateDictionary::load(&xml).unwrap().get(2).unwrap().name, "Hb");

        let json = dir.path().join("t.json");
        fs::write(&json, r#"{"templates":[{"id":4,"name":"J"}]}"#).unwrap();
        assert_eq!(TemplateDictionary::load(&json).unwrap().get(4).unwrap().name, "J");
    }

    #[test]
    fn decimal_initial_values() {
        assert_eq!(parse_decimal("12.50"), Some(Value::Decimal { exponent: -2, mantissa: 1250 }));
        assert_eq!(parse_decimal("-3"), Some(Value::Decimal { exponent: 0, mantissa: -3 }));
        assert_eq!(parse_decimal("1.-2"), None);
        assert_eq!(parse_decimal("abc"), None);
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = TemplateDictionary::load(Path::new("/nonexistent/templates.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/templates.json"));
    }
}
