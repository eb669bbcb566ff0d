//! Failure payloads recorded when a task finishes with an error.
//!
//! A stored error column may hold anything a worker ever sent: a structured
//! [`TaskFailure`] written by this engine, a JSON string, or arbitrary text.
//! [`ErrorPayload::decode`] classifies it and never fails.

use serde::{Deserialize, Serialize};

use super::blob::Blob;

/// Which path produced a structured failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The worker raised a BPMN error with a model-level error code.
    Bpmn,
    /// The worker's own service call failed.
    Service,
}

/// Structured failure written by `handle_bpmn_error` / `handle_service_error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl TaskFailure {
    pub fn bpmn(error_code: impl Into<String>) -> Self {
        let error_code = error_code.into();
        Self {
            kind: FailureKind::Bpmn,
            message: format!("ExternalTask failed due to BPMN error with code {error_code}"),
            error_code: Some(error_code),
            details: None,
        }
    }

    pub fn service(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Service,
            message: message.into(),
            error_code: None,
            details: Some(details.into()),
        }
    }

    pub fn to_blob(&self) -> Result<Blob, serde_json::Error> {
        Blob::from_json(self)
    }
}

/// Decoded view of a stored error blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorPayload {
    /// A [`TaskFailure`] this engine wrote.
    Structured(TaskFailure),
    /// A JSON string.
    Plain(String),
    /// Anything else, kept verbatim.
    Raw(String),
}

impl ErrorPayload {
    pub fn decode(raw: &str) -> Self {
        if let Ok(failure) = serde_json::from_str::<TaskFailure>(raw) {
            return Self::Structured(failure);
        }
        match serde_json::from_str::<String>(raw) {
            Ok(plain) => Self::Plain(plain),
            Err(_) => Self::Raw(raw.to_string()),
        }
    }

    /// Human-readable message regardless of shape.
    pub fn message(&self) -> &str {
        match self {
            Self::Structured(failure) => &failure.message,
            Self::Plain(s) | Self::Raw(s) => s,
        }
    }

    pub fn as_failure(&self) -> Option<&TaskFailure> {
        match self {
            Self::Structured(failure) => Some(failure),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn bpmn_failure_round_trips_as_structured() {
        let blob = TaskFailure::bpmn("E42").to_blob().unwrap();

        let decoded = ErrorPayload::decode(blob.as_str());
        let failure = decoded.as_failure().unwrap();
        assert_eq!(failure.kind, FailureKind::Bpmn);
        assert_eq!(failure.error_code.as_deref(), Some("E42"));
        assert_eq!(
            decoded.message(),
            "ExternalTask failed due to BPMN error with code E42"
        );
    }

    #[test]
    fn service_failure_keeps_details() {
        let blob = TaskFailure::service("upstream 503", "retry later")
            .to_blob()
            .unwrap();

        let v: serde_json::Value = serde_json::from_str(blob.as_str()).unwrap();
        assert_eq!(v["kind"], "service");
        assert_eq!(v["details"], "retry later");
        assert!(v.get("error_code").is_none());
    }

    #[rstest]
    #[case::json_string(r#""disk full""#, ErrorPayload::Plain("disk full".into()))]
    #[case::bare_text("disk full", ErrorPayload::Raw("disk full".into()))]
    #[case::foreign_object(r#"{"code":500}"#, ErrorPayload::Raw(r#"{"code":500}"#.into()))]
    #[case::truncated(r#"{"kind":"bpmn","mess"#, ErrorPayload::Raw(r#"{"kind":"bpmn","mess"#.into()))]
    #[case::empty("", ErrorPayload::Raw(String::new()))]
    fn decode_never_fails(#[case] raw: &str, #[case] expected: ErrorPayload) {
        assert_eq!(ErrorPayload::decode(raw), expected);
    }
}
