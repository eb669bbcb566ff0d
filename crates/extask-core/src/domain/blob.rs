//! Opaque blobs: payload, result, caller context.
//!
//! The engine never interprets these. They are stored as text exactly as the
//! caller wrote them; JSON helpers exist only for callers' convenience.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Opaque text blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Blob(String);

impl Blob {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Serialize a value as JSON text.
    pub fn from_json<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_string(value).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }

    /// Decode the blob as JSON into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.0)
    }

    /// Best-effort JSON view. Text that is not JSON comes back as a JSON string.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::from_str(&self.0).unwrap_or_else(|_| serde_json::Value::String(self.0.clone()))
    }
}

impl From<String> for Blob {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl From<&str> for Blob {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl From<serde_json::Value> for Blob {
    fn from(value: serde_json::Value) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        order: u32,
        items: Vec<String>,
    }

    #[test]
    fn json_payload_decodes_back() {
        let p = Payload {
            order: 7,
            items: vec!["a".into(), "b".into()],
        };
        let blob = Blob::from_json(&p).unwrap();

        assert_eq!(blob.decode::<Payload>().unwrap(), p);
    }

    #[test]
    fn non_json_text_falls_back_to_string() {
        let blob = Blob::new("not json {");

        assert!(blob.decode::<serde_json::Value>().is_err());
        assert_eq!(blob.to_json(), serde_json::json!("not json {"));
    }

    #[test]
    fn value_conversion_keeps_json_text() {
        let blob = Blob::from(serde_json::json!({"x": 1}));
        assert_eq!(blob.as_str(), r#"{"x":1}"#);
        assert_eq!(blob.to_json()["x"], 1);
    }
}
