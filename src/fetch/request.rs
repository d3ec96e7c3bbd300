//! Turns a [`SourceDefinition`] into a concrete outbound request.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use std::collections::BTreeMap;
use url::Url;

use crate::fetch::error::BuildError;
use crate::fetch::types::{Method, SourceDefinition};

/// Fully formed request, independent of the HTTP client that sends it.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: reqwest::Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

pub fn build_request(def: &SourceDefinition) -> Result<OutboundRequest, BuildError> {
    let mut headers = HeaderMap::new();

    let (method, url, body) = match &def.method {
        Method::Get => {
            let mut url = parse_url(&def.url)?;
            merge_query(&mut url, &def.params);
            (reqwest::Method::GET, url, None)
        }
        Method::PostJson => {
            let body = serde_json::to_vec(&def.params)?;
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            (reqwest::Method::POST, parse_url(&def.url)?, Some(body))
        }
        Method::PostForm => {
            let body = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(def.params.iter())
                .finish();
            headers.insert(
                CONTENT_TYPE,
                HeaderValue::from_static("application/x-www-form-urlencoded"),
            );
            (reqwest::Method::POST, parse_url(&def.url)?, Some(body.into_bytes()))
        }
        Method::Other(m) => return Err(BuildError::UnsupportedMethod(m.clone())),
    };

    // Definition headers go last so they can override Content-Type.
    for (k, v) in &def.headers {
        let name = HeaderName::from_bytes(k.as_bytes())
            .map_err(|_| BuildError::InvalidHeader(k.clone()))?;
        let value = HeaderValue::from_str(v).map_err(|_| BuildError::InvalidHeader(k.clone()))?;
        headers.insert(name, value);
    }

    Ok(OutboundRequest {
        method,
        url,
        headers,
        body,
    })
}

fn parse_url(raw: &str) -> Result<Url, BuildError> {
    Url::parse(raw.trim()).map_err(|source| BuildError::InvalidUrl {
        url: raw.to_string(),
        source,
    })
}

/// Params replace existing query keys of the same name; other keys stay.
fn merge_query(url: &mut Url, params: &BTreeMap<String, String>) {
    if params.is_empty() {
        return;
    }
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !params.contains_key(k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let mut pairs = url.query_pairs_mut();
    pairs.clear();
    pairs.extend_pairs(kept);
    pairs.extend_pairs(params.iter());
}
