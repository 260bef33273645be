//! FAST 1.1 XML template files, as the exchange publishes them.
//!
//! The document is read into the same [`TemplateDef`] tree the JSON loader
//! produces:
//!
//! ```xml
//! <templates xmlns="http://www.fixprotocol.org/ns/fast/td/1.1">
//!   <template name="MDIncRefresh" id="12">
//!     <string name="MsgType" id="35"><constant value="X"/></string>
//!     <sequence name="MDEntries">
//!       <length name="NoMDEntries" id="268"/>
//!       <decimal name="MDEntryPx" id="270" presence="optional">
//!         <exponent><copy/></exponent>
//!         <mantissa><delta/></mantissa>
//!       </decimal>
//!     </sequence>
//!   </template>
//! </templates>
//! ```
//!
//! Namespaces, `dictionary`/`key` attributes and `typeRef` are ignored.
//! `templateRef` and the tail operator are rejected.
use super::template::{invalid, FieldDef, FieldType, OperatorDef, Presence, TemplateDef, TemplateError};
use roxmltree::{Document, Node};

pub(crate) fn parse(text: &str) -> Result<Vec<TemplateDef>, TemplateError> {
    let doc = Document::parse(text)?;
    let root = doc.root_element();
    match root.tag_name().name() {
        "templates" => elements(root)
            .filter(|n| n.tag_name().name() == "template")
            .map(template)
            .collect(),
        "template" => Ok(vec![template(root)?]),
        other => Err(invalid(other, "expected <templates> at the document root")),
    }
}

fn elements<'a, 'input>(node: Node<'a, 'input>) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(|n| n.is_element())
}

fn required<'a>(node: Node<'a, '_>, attr: &str) -> Result<&'a str, TemplateError> {
    node.attribute(attr)
        .ok_or_else(|| invalid(node.tag_name().name(), format!("missing {attr} attribute")))
}

fn template(node: Node<'_, '_>) -> Result<TemplateDef, TemplateError> {
    let name = required(node, "name")?;
    let id = required(node, "id")?;
    let id = id.parse().map_err(|_| invalid(name, format!("bad template id {id:?}")))?;
    Ok(TemplateDef { id, name: name.to_string(), fields: fields(node)? })
}

/// Field children of a template, sequence or group.
fn fields(node: Node<'_, '_>) -> Result<Vec<FieldDef>, TemplateError> {
    elements(node)
        .filter(|n| !matches!(n.tag_name().name(), "typeRef" | "length"))
        .map(field)
        .collect()
}

fn field(node: Node<'_, '_>) -> Result<FieldDef, TemplateError> {
    let tag = node.tag_name().name();
    let name = required(node, "name")?;
    let kind = match tag {
        "uInt32" => FieldType::UInt32,
        "uInt64" => FieldType::UInt64,
        "int32" => FieldType::Int32,
        "int64" => FieldType::Int64,
        "decimal" => FieldType::Decimal,
        "string" if node.attribute("charset") == Some("unicode") => FieldType::Unicode,
        "string" => FieldType::Ascii,
        "byteVector" => FieldType::ByteVector,
        "sequence" => FieldType::Sequence,
        "group" => FieldType::Group,
        other => return Err(invalid(name, format!("unsupported element <{other}>"))),
    };
    let id = match node.attribute("id") {
        Some(id) => Some(id.parse().map_err(|_| invalid(name, format!("bad id {id:?}")))?),
        None => None,
    };
    let presence = match node.attribute("presence") {
        None | Some("mandatory") => Presence::Mandatory,
        Some("optional") => Presence::Optional,
        Some(other) => return Err(invalid(name, format!("bad presence {other:?}"))),
    };

    let mut def = FieldDef {
        name: name.to_string(),
        id,
        kind,
        presence,
        operator: OperatorDef::None,
        fields: Vec::new(),
        length_operator: OperatorDef::None,
        exponent: None,
        mantissa: None,
    };
    if matches!(kind, FieldType::Sequence | FieldType::Group) {
        def.fields = fields(node)?;
        if let Some(length) = elements(node).find(|n| n.tag_name().name() == "length") {
            def.length_operator = operator_in(length, name)?;
        }
        return Ok(def);
    }
    for child in elements(node) {
        match (kind, child.tag_name().name()) {
            (FieldType::Decimal, "exponent") => def.exponent = Some(operator_in(child, name)?),
            (FieldType::Decimal, "mantissa") => def.mantissa = Some(operator_in(child, name)?),
            // byte length of a unicode string or byte vector
            (_, "length") => {}
            _ if def.operator != OperatorDef::None => return Err(invalid(name, "more than one operator")),
            _ => def.operator = operator(child, name)?,
        }
    }
    Ok(def)
}

/// The operator inside `<length>`, `<exponent>` or `<mantissa>`, if any.
fn operator_in(node: Node<'_, '_>, field: &str) -> Result<OperatorDef, TemplateError> {
    match elements(node).next() {
        Some(op) => operator(op, field),
        None => Ok(OperatorDef::None),
    }
}

fn operator(node: Node<'_, '_>, field: &str) -> Result<OperatorDef, TemplateError> {
    let value = node.attribute("value").map(str::to_string);
    let op = match node.tag_name().name() {
        "constant" => OperatorDef::Constant { value: value.ok_or_else(|| invalid(field, "constant without a value"))? },
        "default" => OperatorDef::Default { value },
        "copy" => OperatorDef::Copy { value },
        "increment" => OperatorDef::Increment { value },
        "delta" => OperatorDef::Delta { value },
        other => return Err(invalid(field, format!("unsupported operator <{other}>"))),
    };
    Ok(op)
}
