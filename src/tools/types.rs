//! Structured tool results.
//!
//! Every tool returns one [`ToolResult`]. The serialized form is exactly what is
//! sent back to the model as the function response, tagged by `kind`.

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// One mandi price record, with the key names the market data API uses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MandiRecord {
    pub state: String,
    pub district: String,
    pub market: String,
    pub commodity: String,
    pub variety: String,
    pub grade: String,
    #[serde(rename = "Arrival_Date")]
    pub arrival_date: String,
    #[serde(rename = "Min_Price")]
    pub min_price: String,
    #[serde(rename = "Max_Price")]
    pub max_price: String,
    #[serde(rename = "Modal_Price")]
    pub modal_price: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketData {
    pub records: Vec<MandiRecord>,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GovernmentScheme {
    pub name: String,
    pub summary: String,
    pub eligibility: String,
    pub application_link: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GovernmentSchemes {
    pub summary: String,
    pub schemes: Vec<GovernmentScheme>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CropDiseaseDiagnosis {
    pub disease_name: String,
    pub cause: String,
    /// Treatment steps
    pub treatment: Vec<String>,
    pub warnings: Vec<String>,
    pub language: String,
}

/// Where a custom result's own `kind` field goes on the wire, so it cannot shadow
/// the result tag. An explicit `custom_kind` field wins over a renamed one.
pub const CUSTOM_KIND_KEY: &str = "custom_kind";

/// The result of one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolResult {
    MarketData(MarketData),
    /// Per-region market data, keyed by state or district name
    RegionalComparison { regions: BTreeMap<String, MarketData> },
    GovernmentSchemes(GovernmentSchemes),
    CropDiagnosis(CropDiseaseDiagnosis),
    /// Free-form result for tools that don't fit the shapes above
    Custom(#[serde(serialize_with = "serialize_custom_fields")] Map<String, Value>),
    Error { error: String },
}

impl ToolResult {
    pub fn error(message: impl Into<String>) -> Self {
        ToolResult::Error { error: message.into() }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ToolResult::Error { .. })
    }

    /// The failure message of an error result.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            ToolResult::Error { error } => Some(error),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ToolResult::MarketData(_) => "market_data",
            ToolResult::RegionalComparison { .. } => "regional_comparison",
            ToolResult::GovernmentSchemes(_) => "government_schemes",
            ToolResult::CropDiagnosis(_) => "crop_diagnosis",
            ToolResult::Custom(_) => "custom",
            ToolResult::Error { .. } => "error",
        }
    }

    /// Human-readable summary, if this result carries one.
    ///
    /// Regional comparisons render as `**region**: summary` blocks separated by
    /// blank lines.
    pub fn summary(&self) -> Option<String> {
        let text = match self {
            ToolResult::MarketData(data) => data.summary.clone(),
            ToolResult::GovernmentSchemes(schemes) => schemes.summary.clone(),
            ToolResult::RegionalComparison { regions } => regions
                .iter()
                .filter(|(_, data)| !data.summary.trim().is_empty())
                .map(|(region, data)| format!("**{}**: {}", region, data.summary))
                .collect::<Vec<_>>()
                .join("\n\n"),
            ToolResult::CropDiagnosis(d) => {
                let mut text = format!("**{}**: {}", d.disease_name, d.cause);
                for step in &d.treatment {
                    text.push_str("\n\n");
                    text.push_str(step);
                }
                text
            }
            ToolResult::Custom(fields) => fields
                .get("summary")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            ToolResult::Error { .. } => String::new(),
        };

        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

fn serialize_custom_fields<S: Serializer>(fields: &Map<String, Value>, serializer: S) -> Result<S::Ok, S::Error> {
    let shadowed = fields.contains_key("kind") && fields.contains_key(CUSTOM_KIND_KEY);
    let len = if shadowed { fields.len() - 1 } else { fields.len() };

    let mut map = serializer.serialize_map(Some(len))?;
    for (key, value) in fields {
        match key.as_str() {
            "kind" if shadowed => continue,
            "kind" => map.serialize_entry(CUSTOM_KIND_KEY, value)?,
            _ => map.serialize_entry(key, value)?,
        }
    }
    map.end()
}
