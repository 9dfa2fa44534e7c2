pub mod pointer;

use serde_json::Value;

pub use pointer::JsonPointer;

/// One way of locating a model reference inside a provider response.
pub trait ReferenceStrategy: Send + Sync {
    fn extract(&self, body: &Value) -> Option<String>;

    /// Short label used in logs.
    fn describe(&self) -> String;
}

/// Ordered list of strategies; the first one that yields a value wins.
pub struct ReferenceExtractor {
    strategies: Vec<Box<dyn ReferenceStrategy>>,
}

impl ReferenceExtractor {
    pub fn new(strategies: Vec<Box<dyn ReferenceStrategy>>) -> Self {
        Self { strategies }
    }

    /// Build from JSON pointer paths, tried in the given order.
    pub fn from_pointers<S: AsRef<str>>(paths: &[S]) -> Self {
        Self::new(
            paths
                .iter()
                .map(|p| Box::new(JsonPointer::new(p.as_ref())) as Box<dyn ReferenceStrategy>)
                .collect(),
        )
    }

    pub fn extract(&self, body: &Value) -> Option<String> {
        self.strategies.iter().find_map(|s| {
            let found = s.extract(body);
            if found.is_some() {
                tracing::debug!(strategy = s.describe(), "model reference located");
            }
            found
        })
    }

    pub fn describe(&self) -> Vec<String> {
        self.strategies.iter().map(|s| s.describe()).collect()
    }
}
