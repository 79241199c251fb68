//! One description record per named model, metric, and view.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::mdl::{description_of, Mdl};
use crate::models::{scoped_meta, Document, DocumentType, DOCUMENT_TYPE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MdlType {
    Model,
    Metric,
    View,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDescription {
    pub name: String,
    pub mdl_type: MdlType,
    pub description: String,
}

/// Models first, then metrics, then views. Entities without a name are
/// skipped.
pub fn table_descriptions(mdl: &Mdl) -> Vec<TableDescription> {
    let models = mdl
        .models
        .iter()
        .map(|m| (MdlType::Model, &m.name, m.properties.as_ref()));
    let metrics = mdl
        .metrics
        .iter()
        .map(|m| (MdlType::Metric, &m.name, m.properties.as_ref()));
    let views = mdl
        .views
        .iter()
        .map(|v| (MdlType::View, &v.name, v.properties.as_ref()));

    models
        .chain(metrics)
        .chain(views)
        .filter(|(_, name, _)| !name.is_empty())
        .map(|(mdl_type, name, properties)| TableDescription {
            name: name.clone(),
            mdl_type,
            description: description_of(properties),
        })
        .collect()
}

pub fn table_description_documents(mdl: &Mdl, project_id: Option<&str>) -> Result<Vec<Document>> {
    table_descriptions(mdl)
        .iter()
        .map(|record| {
            let mut meta = scoped_meta(project_id);
            meta.insert(
                DOCUMENT_TYPE.to_string(),
                Value::String(DocumentType::TableDescription.as_str().to_string()),
            );
            Ok(Document::new(serde_json::to_string(record)?, meta))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mdl::validate_mdl;

    #[test]
    fn test_records_in_collection_order_skipping_unnamed() {
        let mdl = validate_mdl(
            r#"{
                "models": [
                    {"name": "orders", "properties": {"description": "all orders"}},
                    {"name": ""},
                    {"columns": []}
                ],
                "views": [{"name": "v1", "statement": "SELECT 1"}],
                "metrics": [{"name": "revenue", "properties": {"description": "money"}}]
            }"#,
        )
        .unwrap();

        let records = table_descriptions(&mdl);
        let summary: Vec<(&str, MdlType, &str)> = records
            .iter()
            .map(|r| (r.name.as_str(), r.mdl_type, r.description.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("orders", MdlType::Model, "all orders"),
                ("revenue", MdlType::Metric, "money"),
                ("v1", MdlType::View, ""),
            ]
        );
    }

    #[test]
    fn test_documents_carry_type_and_scope() {
        let mdl = validate_mdl(r#"{"models": [{"name": "orders"}]}"#).unwrap();
        let docs = table_description_documents(&mdl, Some("p1")).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].meta_str("type"), Some("TABLE_DESCRIPTION"));
        assert_eq!(docs[0].project_id(), Some("p1"));

        let record: TableDescription = serde_json::from_str(&docs[0].content).unwrap();
        assert_eq!(record.mdl_type, MdlType::Model);
        assert!(docs[0].content.contains("\"mdl_type\":\"MODEL\""));

        let unscoped = table_description_documents(&mdl, None).unwrap();
        assert_eq!(unscoped[0].project_id(), None);
    }
}
