//! Response validation and payload extraction.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::fetch::error::FetchError;
use crate::fetch::types::{Extraction, SourceDefinition};

/// Shape of a parsed JSON value, as far as storage cares.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Object(Map<String, Value>),
    Array(Vec<Value>),
    Scalar(Value),
}

impl From<Value> for Payload {
    fn from(v: Value) -> Self {
        match v {
            Value::Object(m) => Payload::Object(m),
            Value::Array(a) => Payload::Array(a),
            other => Payload::Scalar(other),
        }
    }
}

impl Payload {
    /// Objects are stored as-is, arrays under `items`, scalars under `value`.
    pub fn into_document(self) -> Map<String, Value> {
        match self {
            Payload::Object(m) => m,
            Payload::Array(items) => wrap("items", Value::Array(items)),
            Payload::Scalar(v) => wrap("value", v),
        }
    }
}

fn wrap(key: &str, v: Value) -> Map<String, Value> {
    let mut m = Map::with_capacity(1);
    m.insert(key.to_string(), v);
    m
}

/// Parse the body and require a top-level object.
pub fn parse_object(body: &[u8]) -> Result<Map<String, Value>, FetchError> {
    let parsed: Value = serde_json::from_slice(body).map_err(FetchError::MalformedJson)?;
    match Payload::from(parsed) {
        Payload::Object(m) => Ok(m),
        Payload::Array(_) | Payload::Scalar(_) => Err(FetchError::NotAnObject),
    }
}

/// String form used for required-field comparison: strings without quotes,
/// integral numbers without a fraction (`200.0` reads as `200`), everything
/// else as compact JSON.
pub fn loose_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => n
            .as_i64()
            .map(|i| i.to_string())
            .or_else(|| {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && f.abs() < 9.0e15)
                    .map(|f| (f as i64).to_string())
            })
            .unwrap_or_else(|| n.to_string()),
        other => other.to_string(),
    }
}

pub fn check_required(
    obj: &Map<String, Value>,
    required: &BTreeMap<String, Value>,
) -> Result<(), FetchError> {
    for (key, want) in required {
        let got = obj
            .get(key)
            .ok_or_else(|| FetchError::MissingField(key.clone()))?;
        let (want, got) = (loose_string(want), loose_string(got));
        if want != got {
            return Err(FetchError::FieldMismatch {
                field: key.clone(),
                want,
                got,
            });
        }
    }
    Ok(())
}

pub fn extract_payload(
    mut obj: Map<String, Value>,
    extraction: Extraction<'_>,
) -> Result<Map<String, Value>, FetchError> {
    match extraction {
        Extraction::FullResponse => Ok(obj),
        Extraction::Field(field) => take_field(&mut obj, field),
        Extraction::DefaultData => take_field(&mut obj, "data"),
    }
}

fn take_field(obj: &mut Map<String, Value>, field: &str) -> Result<Map<String, Value>, FetchError> {
    obj.remove(field)
        .map(|v| Payload::from(v).into_document())
        .ok_or_else(|| FetchError::MissingPayload(field.to_string()))
}

/// Parse, validate and extract in one go.
pub fn shape_response(
    body: &[u8],
    def: &SourceDefinition,
) -> Result<Map<String, Value>, FetchError> {
    let obj = parse_object(body)?;
    check_required(&obj, &def.required)?;
    extract_payload(obj, def.extraction())
}

/// Bounded, lossy preview of a response body for logs.
pub fn body_preview(body: &[u8], max_chars: usize) -> String {
    let text = String::from_utf8_lossy(body);
    if text.chars().count() <= max_chars {
        return text.into_owned();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::types::Method;
    use serde_json::json;

    fn def() -> SourceDefinition {
        SourceDefinition {
            name: "t".into(),
            method: Method::Get,
            url: "https://api.test".into(),
            headers: BTreeMap::new(),
            params: BTreeMap::new(),
            source: "s".into(),
            category: "c".into(),
            info_type: "i".into(),
            required: BTreeMap::new(),
            data_field: None,
            use_full_response: false,
            enabled: true,
        }
    }

    fn shape(body: serde_json::Value, d: &SourceDefinition) -> Result<Map<String, Value>, FetchError> {
        shape_response(body.to_string().as_bytes(), d)
    }

    #[test]
    fn default_extraction_wraps_by_shape() {
        let d = def();
        assert_eq!(
            Value::Object(shape(json!({"data": [1, 2, 3]}), &d).unwrap()),
            json!({"items": [1, 2, 3]})
        );
        assert_eq!(
            Value::Object(shape(json!({"data": "x"}), &d).unwrap()),
            json!({"value": "x"})
        );
        assert_eq!(
            Value::Object(shape(json!({"data": {"a": 1}}), &d).unwrap()),
            json!({"a": 1})
        );
        assert_eq!(
            Value::Object(shape(json!({"data": null}), &d).unwrap()),
            json!({"value": null})
        );
    }

    #[test]
    fn custom_field_and_full_response() {
        let mut d = def();
        d.data_field = Some("result".into());
        d.use_full_response = true;
        let body = json!({"result": {"k": "v"}, "data": 1});
        assert_eq!(Value::Object(shape(body.clone(), &d).unwrap()), json!({"k": "v"}));

        d.data_field = None;
        assert_eq!(Value::Object(shape(body, &d).unwrap()), json!({"result": {"k": "v"}, "data": 1}));
    }

    #[test]
    fn missing_extraction_target_is_retryable() {
        let mut d = def();
        let err = shape(json!({"other": 1}), &d).unwrap_err();
        assert!(matches!(&err, FetchError::MissingPayload(f) if f == "data"));
        assert!(err.is_retryable());

        d.data_field = Some("list".into());
        let err = shape(json!({"data": 1}), &d).unwrap_err();
        assert!(matches!(err, FetchError::MissingPayload(f) if f == "list"));
    }

    #[test]
    fn required_fields_compare_loosely() {
        let mut d = def();
        d.required.insert("code".into(), json!(200));
        d.required.insert("status".into(), json!("ok"));

        assert!(shape(json!({"code": "200", "status": "ok", "data": {}}), &d).is_ok());
        assert!(shape(json!({"code": 200, "status": "ok", "data": {}}), &d).is_ok());
        assert!(shape_response(br#"{"code": 200.0, "status": "ok", "data": {}}"#, &d).is_ok());
        assert!(shape(json!({"code": 200.5, "status": "ok", "data": {}}), &d).is_err());
        assert_eq!(loose_string(&json!(-3.0)), "-3");
        assert_eq!(loose_string(&json!(1.25)), "1.25");

        let err = shape(json!({"code": 200, "status": "error", "data": {}}), &d).unwrap_err();
        assert!(matches!(
            &err,
            FetchError::FieldMismatch { field, want, got } if field == "status" && want == "ok" && got == "error"
        ));
        assert!(err.is_retryable());

        let err = shape(json!({"status": "ok", "data": {}}), &d).unwrap_err();
        assert!(matches!(err, FetchError::MissingField(f) if f == "code"));
    }

    #[test]
    fn malformed_and_non_object_bodies_are_terminal() {
        let d = def();
        let err = shape_response(b"<html>oops</html>", &d).unwrap_err();
        assert!(matches!(err, FetchError::MalformedJson(_)));
        assert!(!err.is_retryable());

        let err = shape(json!([{"data": 1}]), &d).unwrap_err();
        assert!(matches!(err, FetchError::NotAnObject));
        assert!(!err.is_retryable());
    }

    #[test]
    fn preview_is_bounded() {
        assert_eq!(body_preview(b"short", 10), "short");
        assert_eq!(body_preview("ééééé".as_bytes(), 3), "ééé...");
    }
}
