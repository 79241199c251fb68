//! MDL (Model Definition Language) types and validation.
//!
//! An MDL manifest is a JSON object with four collections: `models`,
//! `views`, `relationships`, and `metrics`. [`validate_mdl`] parses the raw
//! string, fills any missing collection with an empty list, and returns the
//! typed [`Mdl`]. Unknown keys are ignored; every field other than the
//! collections themselves is optional.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// The collections every normalized manifest carries.
pub const REQUIRED_COLLECTIONS: [&str; 4] = ["models", "views", "relationships", "metrics"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mdl {
    pub models: Vec<Model>,
    pub views: Vec<View>,
    pub relationships: Vec<Relationship>,
    pub metrics: Vec<Metric>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub columns: Vec<Column>,
    #[serde(default)]
    pub primary_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub data_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Map<String, Value>>,
    /// Name of the relationship this column traverses; such columns are
    /// join paths rather than physical columns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationship: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_calculated: Option<bool>,
}

impl Column {
    pub fn is_calculated(&self) -> bool {
        self.is_calculated.unwrap_or(false)
    }
}

/// How the two models of a [`Relationship`] relate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    ManyToOne,
    OneToMany,
    OneToOne,
}

impl JoinType {
    /// Case-insensitive parse; unsupported values (e.g. `MANY_TO_MANY`)
    /// yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "MANY_TO_ONE" => Some(JoinType::ManyToOne),
            "ONE_TO_MANY" => Some(JoinType::OneToMany),
            "ONE_TO_ONE" => Some(JoinType::OneToOne),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub join_type: String,
    #[serde(default)]
    pub condition: String,
}

impl Relationship {
    pub fn join_type(&self) -> Option<JoinType> {
        JoinType::parse(&self.join_type)
    }

    /// Split `a.x = b.y` into its two `(table, column)` sides.
    ///
    /// Returns `None` unless the condition is a single equality whose both
    /// sides are dotted `table.column` references.
    pub fn condition_sides(&self) -> Option<[(String, String); 2]> {
        let mut parts = self.condition.split('=');
        let left = parts.next()?;
        let right = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        Some([split_dotted(left)?, split_dotted(right)?])
    }
}

fn split_dotted(side: &str) -> Option<(String, String)> {
    let (table, column) = side.trim().split_once('.')?;
    let (table, column) = (table.trim(), column.trim());
    if table.is_empty() || column.is_empty() || column.contains('.') {
        return None;
    }
    Some((table.to_string(), column.to_string()))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct View {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub statement: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub base_object: String,
    #[serde(default)]
    pub dimension: Vec<MetricColumn>,
    #[serde(default)]
    pub measure: Vec<MetricColumn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricColumn {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub data_type: String,
    #[serde(default)]
    pub expression: String,
}

/// `properties.description` of an entity, or `""`.
pub fn description_of(properties: Option<&Map<String, Value>>) -> String {
    properties
        .and_then(|p| p.get("description"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Parse and normalize a raw MDL string.
///
/// # Errors
///
/// [`Error::InvalidSchema`] if the input is not JSON, is not a JSON object,
/// or a collection does not have the expected shape. A missing collection is
/// never an error.
pub fn validate_mdl(mdl_str: &str) -> Result<Mdl> {
    let value: Value = serde_json::from_str(mdl_str)
        .map_err(|e| Error::InvalidSchema(format!("invalid JSON: {}", e)))?;

    let Value::Object(mut object) = value else {
        return Err(Error::InvalidSchema(
            "expected a JSON object at the top level".to_string(),
        ));
    };

    for key in REQUIRED_COLLECTIONS {
        match object.get(key) {
            None | Some(Value::Null) => {
                object.insert(key.to_string(), Value::Array(Vec::new()));
            }
            Some(_) => {}
        }
    }
    tracing::debug!(
        models = object["models"].as_array().map_or(0, Vec::len),
        views = object["views"].as_array().map_or(0, Vec::len),
        "validated MDL"
    );

    serde_json::from_value(Value::Object(object))
        .map_err(|e| Error::InvalidSchema(format!("malformed collection: {}", e)))
}
