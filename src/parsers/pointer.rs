use serde_json::Value;

use crate::parsers::ReferenceStrategy;

/// Reads a non-empty string at an RFC 6901 pointer (`/data/0/url`).
/// The empty pointer `""` addresses the whole document.
pub struct JsonPointer {
    path: String,
}

impl JsonPointer {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
        }
    }
}

impl ReferenceStrategy for JsonPointer {
    fn extract(&self, body: &Value) -> Option<String> {
        body.pointer(&self.path)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    fn describe(&self) -> String {
        format!("pointer:{}", self.path)
    }
}
