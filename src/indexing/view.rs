//! Historical view questions.
//!
//! Each view becomes one document whose content is the view's historical
//! queries followed by its question, space-joined, so retrieval matches on
//! how users have phrased it. The SQL and summary ride along in meta.

use serde_json::{Map, Value};

use crate::mdl::{Mdl, View};
use crate::models::{scoped_meta, Document};

pub fn view_documents(mdl: &Mdl, project_id: Option<&str>) -> Vec<Document> {
    mdl.views
        .iter()
        .map(|view| Document::new(view_content(view), view_meta(view, project_id)))
        .collect()
}

fn view_content(view: &View) -> String {
    let empty = Map::new();
    let properties = view.properties.as_ref().unwrap_or(&empty);

    let mut parts: Vec<&str> = properties
        .get("historical_queries")
        .and_then(Value::as_array)
        .map(|queries| queries.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    parts.push(
        properties
            .get("question")
            .and_then(Value::as_str)
            .unwrap_or_default(),
    );
    parts.join(" ")
}

fn view_meta(view: &View, project_id: Option<&str>) -> Map<String, Value> {
    let property = |key: &str| {
        view.properties
            .as_ref()
            .and_then(|p| p.get(key))
            .cloned()
            .unwrap_or_else(|| Value::String(String::new()))
    };

    let mut meta = scoped_meta(project_id);
    meta.insert("summary".to_string(), property("summary"));
    meta.insert(
        "statement".to_string(),
        Value::String(view.statement.clone()),
    );
    meta.insert("viewId".to_string(), property("viewId"));
    meta
}
