use serde::Serialize;

use crate::dispatch::InputKind;
use crate::dispatch::registry::ProviderEntry;

#[derive(Debug, Serialize)]
pub struct ProviderInfo {
    pub id: String,
    pub backend: String,
    pub input: InputKind,
    pub enabled: bool,
    pub has_credential: bool,
    pub credential_optional: bool,
    pub timeout_secs: u64,
}

impl From<&ProviderEntry> for ProviderInfo {
    fn from(entry: &ProviderEntry) -> Self {
        Self {
            id: entry.id.clone(),
            backend: entry.backend.name().to_string(),
            input: entry.input(),
            enabled: entry.enabled,
            has_credential: entry.has_credential(),
            credential_optional: entry.credential_optional,
            timeout_secs: entry.timeout_secs,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListProvidersResponse {
    pub providers: Vec<ProviderInfo>,
    pub image_synthesis: bool,
}
