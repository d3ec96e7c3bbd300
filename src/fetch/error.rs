use thiserror::Error;

/// Request construction failures. These fail identically on every retry.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),
    #[error("invalid url {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("invalid header {0:?}")]
    InvalidHeader(String),
    #[error("encoding request body: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Everything that can end a single attempt.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("reading response body: {0}")]
    Body(String),
    #[error("malformed JSON response: {0}")]
    MalformedJson(#[source] serde_json::Error),
    #[error("top-level response is not a JSON object")]
    NotAnObject,
    #[error("missing required field {0:?}")]
    MissingField(String),
    #[error("required field {field:?} mismatch: want {want:?}, got {got:?}")]
    FieldMismatch {
        field: String,
        want: String,
        got: String,
    },
    #[error("missing payload field {0:?}")]
    MissingPayload(String),
    #[error("storage write failed: {0}")]
    Persist(String),
    #[error("cancelled by shutdown")]
    Cancelled,
}

impl FetchError {
    /// Whether a later attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Transport(_)
            | FetchError::Body(_)
            | FetchError::MissingField(_)
            | FetchError::FieldMismatch { .. }
            | FetchError::MissingPayload(_)
            | FetchError::Persist(_) => true,
            FetchError::Build(_)
            | FetchError::MalformedJson(_)
            | FetchError::NotAnObject
            | FetchError::Cancelled => false,
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Build(_) => "build",
            FetchError::Transport(_) => "transport",
            FetchError::Body(_) => "body",
            FetchError::MalformedJson(_) => "malformed_json",
            FetchError::NotAnObject => "not_object",
            FetchError::MissingField(_) => "missing_field",
            FetchError::FieldMismatch { .. } => "field_mismatch",
            FetchError::MissingPayload(_) => "missing_payload",
            FetchError::Persist(_) => "persist",
            FetchError::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_failure_table() {
        let bad_json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(FetchError::Transport("reset".into()).is_retryable());
        assert!(FetchError::Body("eof".into()).is_retryable());
        assert!(FetchError::MissingField("code".into()).is_retryable());
        assert!(FetchError::MissingPayload("data".into()).is_retryable());
        assert!(FetchError::Persist("disk full".into()).is_retryable());
        assert!(!FetchError::MalformedJson(bad_json).is_retryable());
        assert!(!FetchError::NotAnObject.is_retryable());
        assert!(!FetchError::Build(BuildError::UnsupportedMethod("PUT".into())).is_retryable());
        assert!(!FetchError::Cancelled.is_retryable());
    }
}
