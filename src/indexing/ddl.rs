//! MDL → DDL chunk conversion.
//!
//! Every model becomes one `TABLE` chunk followed by its columns in
//! `TABLE_COLUMNS` chunks of at most `column_indexing_batch_size` entries
//! (foreign keys synthesized from relationships count as entries and come
//! after the physical columns). Views and metrics follow, one chunk each.
//!
//! Payloads are [`DdlPayload`] values serialized as JSON. Serialization is
//! deterministic, so converting the same MDL twice yields identical chunks.

use std::collections::HashMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::mdl::{JoinType, Mdl, Model, Relationship};
use crate::models::{scoped_meta, Document, DocumentType, DOCUMENT_TYPE};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DdlPayload {
    Table {
        comment: String,
        name: String,
    },
    TableColumns {
        columns: Vec<ColumnEntry>,
    },
    View {
        comment: String,
        name: String,
        statement: String,
    },
    Metric {
        comment: String,
        name: String,
        columns: Vec<ColumnEntry>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ColumnEntry {
    Column {
        comment: String,
        name: String,
        data_type: String,
        is_primary_key: bool,
    },
    ForeignKey {
        comment: String,
        constraint: String,
        /// The two models of the relationship.
        tables: Vec<String>,
    },
}

/// One retrievable DDL unit, keyed by the table/view/metric it describes.
#[derive(Debug, Clone, PartialEq)]
pub struct DdlChunk {
    pub name: String,
    pub payload: DdlPayload,
}

impl DdlChunk {
    /// `TABLE_SCHEMA` document whose content is the JSON payload.
    pub fn to_document(&self, project_id: Option<&str>) -> Result<Document> {
        let mut meta = scoped_meta(project_id);
        meta.insert(
            DOCUMENT_TYPE.to_string(),
            Value::String(DocumentType::TableSchema.as_str().to_string()),
        );
        meta.insert("name".to_string(), Value::String(self.name.clone()));
        Ok(Document::new(serde_json::to_string(&self.payload)?, meta))
    }
}

pub fn convert_to_ddl(mdl: &Mdl, column_indexing_batch_size: usize) -> Vec<DdlChunk> {
    let batch_size = column_indexing_batch_size.max(1);
    let primary_keys: HashMap<&str, &str> = mdl
        .models
        .iter()
        .map(|m| (m.name.as_str(), m.primary_key.as_str()))
        .collect();

    let mut chunks = Vec::new();
    for model in &mdl.models {
        let mut columns = model_columns(model);
        columns.extend(
            mdl.relationships
                .iter()
                .filter_map(|rel| foreign_key(&model.name, rel, &primary_keys)),
        );

        chunks.push(DdlChunk {
            name: model.name.clone(),
            payload: DdlPayload::Table {
                comment: model_comment(model.properties.as_ref()),
                name: model.name.clone(),
            },
        });
        chunks.extend(columns.chunks(batch_size).map(|batch| DdlChunk {
            name: model.name.clone(),
            payload: DdlPayload::TableColumns {
                columns: batch.to_vec(),
            },
        }));
    }

    for view in &mdl.views {
        chunks.push(DdlChunk {
            name: view.name.clone(),
            payload: DdlPayload::View {
                comment: view
                    .properties
                    .as_ref()
                    .map(|p| format!("/* {} */\n", Value::Object(p.clone())))
                    .unwrap_or_default(),
                name: view.name.clone(),
                statement: view.statement.clone(),
            },
        });
    }

    for metric in &mdl.metrics {
        let dimensions = metric.dimension.iter().map(|d| ColumnEntry::Column {
            comment: "-- This column is a dimension\n  ".to_string(),
            name: d.name.clone(),
            data_type: d.data_type.clone(),
            is_primary_key: false,
        });
        let measures = metric.measure.iter().map(|m| ColumnEntry::Column {
            comment: format!(
                "-- This column is a measure\n  -- expression: {}\n  ",
                m.expression
            ),
            name: m.name.clone(),
            data_type: m.data_type.clone(),
            is_primary_key: false,
        });
        chunks.push(DdlChunk {
            name: metric.name.clone(),
            payload: DdlPayload::Metric {
                comment: format!(
                    "\n/* This table is a metric */\n/* Metric Base Object: {} */\n",
                    metric.base_object
                ),
                name: metric.name.clone(),
                columns: dimensions.chain(measures).collect(),
            },
        });
    }

    chunks
}

/// Physical columns of `model`; relationship columns are join paths and
/// are left out.
fn model_columns(model: &Model) -> Vec<ColumnEntry> {
    model
        .columns
        .iter()
        .filter(|c| c.relationship.is_none())
        .map(|column| {
            let mut comment = column
                .properties
                .as_ref()
                .map(|p| format!("-- {}\n  ", column_properties(p)))
                .unwrap_or_default();
            if column.is_calculated() {
                comment.push_str(&format!(
                    "-- This column is a Calculated Field\n  -- column expression: {}\n  ",
                    column.expression.as_deref().unwrap_or_default()
                ));
            }
            ColumnEntry::Column {
                comment,
                name: column.name.clone(),
                data_type: column.data_type.clone(),
                is_primary_key: column.name == model.primary_key,
            }
        })
        .collect()
}

fn column_properties(properties: &Map<String, Value>) -> Value {
    let mut out = alias_and_description(properties);
    let nested: Map<String, Value> = properties
        .iter()
        .filter(|(k, _)| k.starts_with("nested"))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if !nested.is_empty() {
        out["nested_columns"] = Value::Object(nested);
    }
    out
}

fn alias_and_description(properties: &Map<String, Value>) -> Value {
    let text = |key: &str| {
        properties
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    json!({
        "alias": text("displayName"),
        "description": text("description"),
    })
}

/// Models without properties still get an empty alias and description.
fn model_comment(properties: Option<&Map<String, Value>>) -> String {
    let empty = Map::new();
    format!(
        "\n/* {} */\n",
        alias_and_description(properties.unwrap_or(&empty))
    )
}

/// The foreign key `rel` contributes to `table`, if any.
fn foreign_key(
    table: &str,
    rel: &Relationship,
    primary_keys: &HashMap<&str, &str>,
) -> Option<ColumnEntry> {
    let [left, right] = rel.models.as_slice() else {
        return None;
    };
    // (side of the condition holding the FK column, referenced model)
    let (side, related) = match rel.join_type()? {
        JoinType::ManyToOne if table == left => (0, right),
        JoinType::OneToMany if table == right => (1, left),
        JoinType::OneToOne if table == left => (0, right),
        JoinType::OneToOne if table == right => (1, left),
        _ => return None,
    };

    let Some(sides) = rel.condition_sides() else {
        warn!(
            relationship = %rel.name,
            condition = %rel.condition,
            "skipping foreign key: condition is not `a.x = b.y`"
        );
        return None;
    };
    let Some(pk) = primary_keys.get(related.as_str()) else {
        warn!(
            relationship = %rel.name,
            model = %related,
            "skipping foreign key: referenced model is not declared"
        );
        return None;
    };

    Some(ColumnEntry::ForeignKey {
        comment: format!(
            "-- {{\"condition\": {}, \"joinType\": {}}}\n  ",
            rel.condition, rel.join_type
        ),
        constraint: format!(
            "FOREIGN KEY ({}) REFERENCES {}({})",
            sides[side].1, related, pk
        ),
        tables: rel.models.clone(),
    })
}
