//! Function declarations and argument validation.
//!
//! Declarations are advertised to the backend in the setup frame. The same schema
//! is used to check the arguments of every incoming call before a handler sees them.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Parameter types understood by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchemaType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

/// A JSON-schema-like description of one parameter (or of the whole argument object).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterSchema {
    #[serde(rename = "type")]
    pub schema_type: SchemaType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, ParameterSchema>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<ParameterSchema>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    /// Groups where at least one member must be present and non-empty. Checked
    /// locally only; the backend schema has no equivalent.
    #[serde(skip)]
    pub one_of_required: Vec<Vec<String>>,
}

impl ParameterSchema {
    fn of(schema_type: SchemaType, description: Option<&str>) -> Self {
        Self {
            schema_type,
            description: description.map(str::to_string),
            properties: BTreeMap::new(),
            items: None,
            required: Vec::new(),
            one_of_required: Vec::new(),
        }
    }

    pub fn object() -> Self {
        Self::of(SchemaType::Object, None)
    }

    pub fn string(description: &str) -> Self {
        Self::of(SchemaType::String, Some(description))
    }

    pub fn number(description: &str) -> Self {
        Self::of(SchemaType::Number, Some(description))
    }

    pub fn integer(description: &str) -> Self {
        Self::of(SchemaType::Integer, Some(description))
    }

    pub fn boolean(description: &str) -> Self {
        Self::of(SchemaType::Boolean, Some(description))
    }

    pub fn array(items: ParameterSchema, description: &str) -> Self {
        let mut schema = Self::of(SchemaType::Array, Some(description));
        schema.items = Some(Box::new(items));
        schema
    }

    pub fn property(mut self, name: &str, schema: ParameterSchema) -> Self {
        self.properties.insert(name.to_string(), schema);
        self
    }

    pub fn required(mut self, names: &[&str]) -> Self {
        self.required.extend(names.iter().map(|n| n.to_string()));
        self
    }

    pub fn one_of_required(mut self, names: &[&str]) -> Self {
        self.one_of_required.push(names.iter().map(|n| n.to_string()).collect());
        self
    }

    fn accepts(&self, value: &Value) -> bool {
        match self.schema_type {
            SchemaType::String => value.is_string(),
            SchemaType::Number => value.is_number(),
            SchemaType::Integer => value.is_i64() || value.is_u64(),
            SchemaType::Boolean => value.is_boolean(),
            SchemaType::Object => value.is_object(),
            SchemaType::Array => match (value.as_array(), &self.items) {
                (Some(values), Some(items)) => values.iter().all(|v| items.accepts(v)),
                (Some(_), None) => true,
                (None, _) => false,
            },
        }
    }
}

/// A callable tool as advertised to the backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: ParameterSchema,
}

impl FunctionDeclaration {
    pub fn new(name: &str, description: &str, parameters: ParameterSchema) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        }
    }
}

fn invalid(field: &str, tool: &str) -> String {
    format!("Missing or invalid '{}' argument for {}.", field, tool)
}

fn missing_alternative(required: &[String], group: &[String], tool: &str) -> String {
    let alternatives = group.join(" or ");
    if required.is_empty() {
        format!(
            "Missing or invalid arguments for {}. Must provide at least one of {}.",
            tool, alternatives
        )
    } else {
        format!(
            "Missing or invalid arguments for {}. Must provide {} and at least one of {}.",
            tool,
            required.join(", "),
            alternatives
        )
    }
}

/// Present for a one-of group: not null, and not an empty array or string.
fn provided(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Array(items) => !items.is_empty(),
        Value::String(text) => !text.trim().is_empty(),
        _ => true,
    }
}

/// Check call arguments against a declaration.
///
/// `null` arguments are treated as an empty object. Unknown extra properties are
/// allowed. The error string is what gets sent back to the model.
pub fn validate_arguments(declaration: &FunctionDeclaration, args: &Value) -> Result<(), String> {
    let empty = serde_json::Map::new();
    let fields = match args {
        Value::Null => &empty,
        Value::Object(map) => map,
        _ => return Err(format!("Arguments for {} must be an object.", declaration.name)),
    };
    let schema = &declaration.parameters;

    for name in &schema.required {
        let present = fields.get(name).map(|v| !v.is_null()).unwrap_or(false);
        if !present {
            return Err(invalid(name, &declaration.name));
        }
    }

    for (name, value) in fields {
        if value.is_null() {
            continue;
        }
        if let Some(property) = schema.properties.get(name) {
            if !property.accepts(value) {
                return Err(invalid(name, &declaration.name));
            }
        }
    }

    for group in &schema.one_of_required {
        let satisfied = group.iter().any(|name| fields.get(name).map(provided).unwrap_or(false));
        if !satisfied {
            return Err(missing_alternative(&schema.required, group, &declaration.name));
        }
    }

    Ok(())
}
