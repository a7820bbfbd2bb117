//! Typed tool argument schemas.
//!
//! Each tool declares an [`ArgumentSchema`]. Incoming JSON arguments are
//! checked against it and converted into [`Arguments`], a map of tagged
//! [`ArgValue`]s, before the tool implementation ever sees them.

use std::collections::BTreeMap;

use serde_json::{Map, Value, json};
use thiserror::Error;

/// The type a single argument must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    String,
    Integer,
    Number,
    Boolean,
}

impl ArgKind {
    fn json_type(self) -> &'static str {
        match self {
            ArgKind::String => "string",
            ArgKind::Integer => "integer",
            ArgKind::Number => "number",
            ArgKind::Boolean => "boolean",
        }
    }
}

/// A validated argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    String(String),
    Integer(i64),
    Number(f64),
    Boolean(bool),
}

impl ArgValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ArgValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ArgValue::Number(n) => Some(*n),
            ArgValue::Integer(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ArgValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

/// One named field of a schema.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: ArgKind,
    pub required: bool,
    pub description: &'static str,
}

/// Schema violations, reported back as `InvalidArgumentsError`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("missing required argument `{0}`")]
    Missing(&'static str),

    #[error("argument `{name}` must be {expected}, got {found}")]
    WrongType {
        name: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("unexpected argument `{0}`")]
    Unexpected(String),
}

/// Declared arguments of a tool.
#[derive(Debug, Clone, Default)]
pub struct ArgumentSchema {
    fields: Vec<FieldSpec>,
}

impl ArgumentSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: &'static str, kind: ArgKind, description: &'static str) -> Self {
        self.fields.push(FieldSpec {
            name,
            kind,
            required: true,
            description,
        });
        self
    }

    pub fn optional(mut self, name: &'static str, kind: ArgKind, description: &'static str) -> Self {
        self.fields.push(FieldSpec {
            name,
            kind,
            required: false,
            description,
        });
        self
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Check `arguments` and convert them to typed values.
    ///
    /// `null` for an optional field counts as absent.
    pub fn validate(&self, arguments: &Map<String, Value>) -> Result<Arguments, SchemaError> {
        if let Some(name) = arguments
            .keys()
            .find(|key| !self.fields.iter().any(|f| f.name == key.as_str()))
        {
            return Err(SchemaError::Unexpected(name.clone()));
        }

        let mut values = BTreeMap::new();
        for field in &self.fields {
            match arguments.get(field.name) {
                None | Some(Value::Null) if field.required => {
                    return Err(SchemaError::Missing(field.name));
                }
                None | Some(Value::Null) => {}
                Some(value) => {
                    values.insert(field.name.to_string(), convert(field, value)?);
                }
            }
        }

        Ok(Arguments(values))
    }

    /// JSON Schema rendering used for discovery.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        for field in &self.fields {
            properties.insert(
                field.name.to_string(),
                json!({
                    "type": field.kind.json_type(),
                    "description": field.description,
                }),
            );
        }
        let required: Vec<&str> = self
            .fields
            .iter()
            .filter(|f| f.required)
            .map(|f| f.name)
            .collect();

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }
}

fn convert(field: &FieldSpec, value: &Value) -> Result<ArgValue, SchemaError> {
    let converted = match (field.kind, value) {
        (ArgKind::String, Value::String(s)) => Some(ArgValue::String(s.clone())),
        (ArgKind::Integer, Value::Number(n)) => n.as_i64().map(ArgValue::Integer),
        (ArgKind::Number, Value::Number(n)) => n.as_f64().map(ArgValue::Number),
        (ArgKind::Boolean, Value::Bool(b)) => Some(ArgValue::Boolean(*b)),
        _ => None,
    };

    converted.ok_or_else(|| SchemaError::WrongType {
        name: field.name.to_string(),
        expected: field.kind.json_type(),
        found: json_type_name(value),
    })
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Validated arguments of a single call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Arguments(BTreeMap<String, ArgValue>);

impl Arguments {
    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        self.0.get(name)
    }

    /// String argument; `None` if absent or of another kind.
    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(ArgValue::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
