//! Flattens news-feed style payloads (`{section: [item, ...], ...}`) into a
//! single `articles` list.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::Transform;
use crate::store::StoredResult;

fn default_allowed_types() -> Vec<i64> {
    // article, other, video, flash
    vec![0, 1, 9, 15]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleListConfig {
    /// Payload key -> label written to `seriesType`.
    pub sections: BTreeMap<String, String>,
    #[serde(default = "default_allowed_types")]
    pub allowed_types: Vec<i64>,
    /// Article URL; `{id}` is replaced by the article id.
    pub url_template: String,
}

pub struct ArticleList {
    cfg: ArticleListConfig,
}

impl ArticleList {
    pub fn new(cfg: ArticleListConfig) -> Self {
        Self { cfg }
    }

    fn item(&self, item: &Value, label: &str) -> Option<Map<String, Value>> {
        let m = item.as_object()?;
        let cont_type = m.get("contType").and_then(cont_type)?;
        if !self.cfg.allowed_types.contains(&cont_type) {
            return None;
        }
        let id = ["contId", "originalContId"]
            .iter()
            .filter_map(|k| m.get(*k))
            .find(|v| !is_blank(v))
            .map(id_string)?;

        let mut out = Map::new();
        out.insert("articleID".into(), Value::String(id.clone()));
        if let Some(v) = m.get("seriesTagRecType").filter(|v| !is_blank(v)) {
            out.insert("partition".into(), v.clone());
        }
        if let Some(v) = m.get("pubTimeLong").filter(|v| !is_blank(v)) {
            out.insert("timestamp".into(), v.clone());
        }
        out.insert("seriesType".into(), Value::String(label.to_string()));
        out.insert(
            "origin_url".into(),
            Value::String(self.cfg.url_template.replace("{id}", &id)),
        );
        Some(out)
    }
}

impl Transform for ArticleList {
    fn name(&self) -> &'static str {
        "article_list"
    }

    fn apply(&self, raw: &StoredResult) -> Result<Map<String, Value>> {
        let data = &raw.result.data;
        if data.is_empty() {
            bail!("empty data");
        }

        let mut articles = Vec::new();
        for (key, label) in &self.cfg.sections {
            match data.get(key) {
                None | Some(Value::Null) => continue,
                Some(Value::Array(items)) => {
                    let before = articles.len();
                    articles.extend(items.iter().filter_map(|it| self.item(it, label)).map(Value::Object));
                    tracing::debug!(
                        target: "postprocess",
                        section = %key,
                        kept = articles.len() - before,
                        dropped = items.len() - (articles.len() - before),
                        "Section flattened"
                    );
                }
                Some(other) => {
                    tracing::warn!(
                        target: "postprocess",
                        section = %key,
                        kind = json_kind(other),
                        "Section is not an array, skipping"
                    );
                }
            }
        }

        let mut out = Map::new();
        out.insert("articles".into(), Value::Array(articles));
        Ok(out)
    }
}

/// Integer content type from a number or a numeric string.
fn cont_type(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn is_blank(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn id_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::types::FetchResult;
    use chrono::Utc;
    use serde_json::json;

    fn cfg() -> ArticleListConfig {
        ArticleListConfig {
            sections: BTreeMap::from([
                ("hotNews".to_string(), "Hot".to_string()),
                ("editorHandpicked".to_string(), "Picked".to_string()),
            ]),
            allowed_types: default_allowed_types(),
            url_template: "https://news.example/detail/{id}".into(),
        }
    }

    fn raw(data: Value) -> StoredResult {
        let Value::Object(data) = data else { panic!("object expected") };
        StoredResult {
            id: 7,
            result: FetchResult {
                date: "2025-09-06".into(),
                source: "news".into(),
                category: "general".into(),
                info_type: "daily".into(),
                data,
                processed: false,
                created_at: Utc::now(),
            },
            processed_at: None,
        }
    }

    #[test]
    fn flattens_sections_and_filters_items() {
        let doc = raw(json!({
            "hotNews": [
                {"contId": "100", "contType": 0, "pubTimeLong": 1725600000000i64, "seriesTagRecType": "top"},
                {"contId": "101", "contType": "9"},
                {"contId": "102", "contType": 3},
                {"contType": 1},
                {"contId": "", "originalContId": 555, "contType": 15},
                "not an object"
            ],
            "editorHandpicked": {"oops": true},
            "ignored": [{"contId": "1", "contType": 0}]
        }));
        let out = ArticleList::new(cfg()).apply(&doc).unwrap();
        let articles = out["articles"].as_array().unwrap();
        assert_eq!(articles.len(), 3);

        assert_eq!(
            articles[0],
            json!({
                "articleID": "100",
                "partition": "top",
                "timestamp": 1725600000000i64,
                "seriesType": "Hot",
                "origin_url": "https://news.example/detail/100"
            })
        );
        assert_eq!(articles[1]["articleID"], "101");
        assert!(articles[1].get("partition").is_none());
        assert_eq!(articles[2]["articleID"], "555");
        assert_eq!(articles[2]["origin_url"], "https://news.example/detail/555");
    }

    #[test]
    fn missing_cont_type_or_unparsable_string_is_dropped() {
        let doc = raw(json!({"hotNews": [
            {"contId": "1"},
            {"contId": "2", "contType": "abc"},
            {"contId": "3", "contType": null}
        ]}));
        let out = ArticleList::new(cfg()).apply(&doc).unwrap();
        assert_eq!(out["articles"], json!([]));
    }

    #[test]
    fn empty_payload_is_an_error() {
        assert!(ArticleList::new(cfg()).apply(&raw(json!({}))).is_err());
    }

    #[test]
    fn allowed_types_default_when_omitted() {
        let c: ArticleListConfig = serde_json::from_value(json!({
            "sections": {"hotNews": "Hot"},
            "url_template": "u/{id}"
        }))
        .unwrap();
        assert_eq!(c.allowed_types, vec![0, 1, 9, 15]);
    }
}
