use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Request mode of a source. Parsed case-insensitively from `"GET"`,
/// `"POST/JSON"` and `"POST/FORM"`; anything else is kept verbatim so the
/// request builder can reject it with the original spelling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Method {
    Get,
    PostJson,
    PostForm,
    Other(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::PostJson => "POST/JSON",
            Method::PostForm => "POST/FORM",
            Method::Other(s) => s.as_str(),
        }
    }
}

impl From<String> for Method {
    fn from(s: String) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Method::Get,
            "POST/JSON" => Method::PostJson,
            "POST/FORM" => Method::PostForm,
            _ => Method::Other(s),
        }
    }
}

impl From<Method> for String {
    fn from(m: Method) -> Self {
        m.as_str().to_string()
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_enabled() -> bool {
    true
}

/// Declarative fetch target as kept in the source registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDefinition {
    pub name: String,
    pub method: Method,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    pub source: String,
    #[serde(default)]
    pub category: String,
    #[serde(default, alias = "infoType")]
    pub info_type: String,
    /// key -> expected value; compared by string form, not by JSON type.
    #[serde(default, alias = "requiredFields")]
    pub required: BTreeMap<String, Value>,
    #[serde(default, alias = "dataField", skip_serializing_if = "Option::is_none")]
    pub data_field: Option<String>,
    #[serde(default, alias = "useFullResponse")]
    pub use_full_response: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// Which part of a parsed response becomes the stored payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extraction<'a> {
    Field(&'a str),
    FullResponse,
    DefaultData,
}

impl fmt::Display for Extraction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Extraction::Field(name) => write!(f, "custom field: {name}"),
            Extraction::FullResponse => f.write_str("full response"),
            Extraction::DefaultData => f.write_str("default data field"),
        }
    }
}

impl SourceDefinition {
    /// Custom field wins over full response, which wins over `"data"`.
    pub fn extraction(&self) -> Extraction<'_> {
        match self.data_field.as_deref().map(str::trim) {
            Some(field) if !field.is_empty() => Extraction::Field(field),
            _ if self.use_full_response => Extraction::FullResponse,
            _ => Extraction::DefaultData,
        }
    }
}

/// One stored document per successful attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchResult {
    /// YYYY-MM-DD in the reference timezone.
    pub date: String,
    pub source: String,
    pub category: String,
    pub info_type: String,
    pub data: Map<String, Value>,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

/// A source bound to the cycle that dispatched it. Retries keep writing into
/// the cycle's partition and date even when they finish after midnight.
#[derive(Debug, Clone)]
pub struct FetchJob {
    pub def: Arc<SourceDefinition>,
    pub partition: String,
    pub date: String,
}
