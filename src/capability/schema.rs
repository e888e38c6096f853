//! Output descriptors: declarative field lists decoded at run time.
//!
//! A capability declares the shape of its result as a list of fields. Each
//! field is a primitive or a list of records whose own fields are primitives.
//! Model replies are decoded against the descriptor into a `serde_json::Value`
//! tree holding exactly the declared fields.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum SchemaError {
    #[error("field '{0}' is declared more than once")]
    DuplicateField(String),

    #[error("field name must not be empty")]
    EmptyName,

    #[error("list field '{0}' must declare its element fields")]
    MissingElementFields(String),

    #[error("field '{0}' is nested too deeply: list elements must be primitive fields")]
    TooDeep(String),

    #[error("field '{0}' of type {1} cannot declare element fields")]
    UnexpectedElementFields(String, &'static str),

    #[error("expected a JSON object at '{0}'")]
    NotAnObject(String),

    #[error("missing required field '{0}'")]
    MissingField(String),

    #[error("field '{path}' should be {expected}, got {found}")]
    TypeMismatch {
        path: String,
        expected: &'static str,
        found: String,
    },
}

/// Kind of a declared field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    #[serde(rename = "str", alias = "string")]
    Str,
    #[serde(rename = "int", alias = "integer")]
    Int,
    #[serde(rename = "float", alias = "number")]
    Float,
    #[serde(rename = "bool", alias = "boolean")]
    Bool,
    /// Any JSON value, kept as produced.
    #[serde(rename = "any", alias = "json")]
    Any,
    #[serde(rename = "list[str]")]
    StrList,
    /// A list of records described by the field's `fields`.
    #[serde(rename = "list")]
    List,
}

impl FieldKind {
    fn describe(&self) -> &'static str {
        match self {
            FieldKind::Str => "string",
            FieldKind::Int => "integer",
            FieldKind::Float => "number",
            FieldKind::Bool => "boolean",
            FieldKind::Any => "any JSON value",
            FieldKind::StrList => "list of strings",
            FieldKind::List => "list of objects",
        }
    }
}

/// One declared output field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FieldKind,
    /// Element fields, only for `list`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldDescriptor>,
    /// Missing or null values decode to null instead of failing.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            fields: Vec::new(),
            optional: false,
            description: None,
        }
    }

    pub fn list(name: impl Into<String>, fields: Vec<FieldDescriptor>) -> Self {
        Self {
            fields,
            ..Self::new(name, FieldKind::List)
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// The declared result shape of a capability.
///
/// An empty descriptor accepts any JSON value unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputDescriptor {
    pub fields: Vec<FieldDescriptor>,
}

impl OutputDescriptor {
    pub fn new(fields: Vec<FieldDescriptor>) -> Self {
        Self { fields }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Check the descriptor itself is well formed. Run at registry load time.
    pub fn validate(&self) -> Result<(), SchemaError> {
        validate_fields(&self.fields, 0)
    }

    /// Decode a model reply into a value tree holding exactly the declared fields.
    pub fn decode(&self, value: &Value) -> Result<Value, SchemaError> {
        if self.fields.is_empty() {
            return Ok(value.clone());
        }
        decode_record(&self.fields, value, "").map(Value::Object)
    }

    /// Format instructions appended to a prompt so the model answers in shape.
    pub fn format_instructions(&self) -> String {
        if self.fields.is_empty() {
            return "Respond in plain text.".to_string();
        }
        let mut out = String::from(
            "Respond with a single JSON object and nothing else. The object has these fields:\n",
        );
        for field in &self.fields {
            write_field_line(&mut out, field, 0);
        }
        out
    }
}

fn validate_fields(fields: &[FieldDescriptor], depth: usize) -> Result<(), SchemaError> {
    let mut seen = std::collections::HashSet::new();
    for field in fields {
        if field.name.trim().is_empty() {
            return Err(SchemaError::EmptyName);
        }
        if !seen.insert(field.name.as_str()) {
            return Err(SchemaError::DuplicateField(field.name.clone()));
        }
        match field.kind {
            FieldKind::List => {
                if depth > 0 {
                    return Err(SchemaError::TooDeep(field.name.clone()));
                }
                if field.fields.is_empty() {
                    return Err(SchemaError::MissingElementFields(field.name.clone()));
                }
                validate_fields(&field.fields, depth + 1)?;
            }
            kind if !field.fields.is_empty() => {
                return Err(SchemaError::UnexpectedElementFields(
                    field.name.clone(),
                    kind.describe(),
                ));
            }
            _ => {}
        }
    }
    Ok(())
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

fn found(value: &Value) -> String {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
    .to_string()
}

fn decode_record(
    fields: &[FieldDescriptor],
    value: &Value,
    path: &str,
) -> Result<Map<String, Value>, SchemaError> {
    let object = value.as_object().ok_or_else(|| {
        SchemaError::NotAnObject(if path.is_empty() { "$".to_string() } else { path.to_string() })
    })?;

    let mut out = Map::new();
    for field in fields {
        let field_path = join_path(path, &field.name);
        let decoded = match object.get(&field.name) {
            None | Some(Value::Null) if field.optional => Value::Null,
            None => return Err(SchemaError::MissingField(field_path)),
            Some(raw) => decode_field(field, raw, &field_path)?,
        };
        out.insert(field.name.clone(), decoded);
    }
    Ok(out)
}

fn decode_field(field: &FieldDescriptor, raw: &Value, path: &str) -> Result<Value, SchemaError> {
    let mismatch = || SchemaError::TypeMismatch {
        path: path.to_string(),
        expected: field.kind.describe(),
        found: found(raw),
    };

    match field.kind {
        FieldKind::Any => Ok(raw.clone()),
        FieldKind::Str => match raw {
            Value::String(_) => Ok(raw.clone()),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            _ => Err(mismatch()),
        },
        FieldKind::Int => match raw {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(raw.clone()),
            Value::Number(n) => match n.as_f64() {
                Some(f) if f.fract() == 0.0 => Ok(Value::from(f as i64)),
                _ => Err(mismatch()),
            },
            Value::String(s) => s.trim().parse::<i64>().map(Value::from).map_err(|_| mismatch()),
            _ => Err(mismatch()),
        },
        FieldKind::Float => match raw {
            Value::Number(_) => Ok(raw.clone()),
            Value::String(s) => s.trim().parse::<f64>().map(Value::from).map_err(|_| mismatch()),
            _ => Err(mismatch()),
        },
        FieldKind::Bool => match raw {
            Value::Bool(_) => Ok(raw.clone()),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" => Ok(Value::Bool(true)),
                "false" | "no" => Ok(Value::Bool(false)),
                _ => Err(mismatch()),
            },
            _ => Err(mismatch()),
        },
        FieldKind::StrList => match raw {
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(_) => Ok(item.clone()),
                    Value::Number(_) | Value::Bool(_) => Ok(Value::String(item.to_string())),
                    _ => Err(mismatch()),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            // A lone string is read as a one-element list.
            Value::String(_) => Ok(Value::Array(vec![raw.clone()])),
            _ => Err(mismatch()),
        },
        FieldKind::List => match raw {
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    decode_record(&field.fields, item, &format!("{}[{}]", path, i)).map(Value::Object)
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            _ => Err(mismatch()),
        },
    }
}

fn write_field_line(out: &mut String, field: &FieldDescriptor, indent: usize) {
    out.push_str(&"  ".repeat(indent));
    out.push_str(&format!("- \"{}\" ({}", field.name, field.kind.describe()));
    if field.optional {
        out.push_str(", optional");
    }
    out.push(')');
    if let Some(description) = &field.description {
        out.push_str(": ");
        out.push_str(description.trim());
    }
    out.push('\n');
    for nested in &field.fields {
        write_field_line(out, nested, indent + 1);
    }
}
