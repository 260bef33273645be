//! FAST sub-message decoding.
//!
//! - `template`: the template dictionary loaded once at startup
//! - `xml`: reader for the exchange's FAST 1.1 XML template files
//! - `decoder`: stateless-per-call decoding of one encoded message
//! - `value`: the structured records produced
mod decoder;
mod template;
mod value;
mod xml;

pub use decoder::{FastDecoder, FastError};
pub use template::{FieldDef, FieldType, OperatorDef, Presence, Template, TemplateDef, TemplateDictionary, TemplateError};
pub use value::{DecodedRecord, FieldList, Value};
