use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use reqwest::multipart::{Form, Part};

use crate::dispatch::registry::{BackendConfig, ProviderEntry};
use crate::dispatch::{
    InputKind, MAX_MODEL_BYTES, ProviderAdapter, ProviderRequest, ProviderResult, check_status,
    load_image_bytes, persist_model_payload, read_capped, remaining_or_timeout,
};
use crate::error::GenerationError;
use crate::orchestrator::AttemptStatus;
use crate::parsers::ReferenceExtractor;

/// Max JSON response size (2MB). Binary models use `MAX_MODEL_BYTES`.
pub const MAX_RESPONSE_BYTES: usize = 2 * 1024 * 1024;

/// Pointers tried on a JSON response when none are configured.
pub const DEFAULT_REFERENCE_PATHS: &[&str] =
    &["/data/0/url", "/data/0", "/url", "/model_url", "/output"];

/// Content types treated as a binary model payload rather than JSON.
const BINARY_MODEL_TYPES: &[&str] = &[
    "model/gltf-binary",
    "model/gltf+json",
    "model/obj",
    "application/octet-stream",
];

/// Single blocking multipart call: image in, model (JSON reference or binary) out.
pub struct HttpDispatch {
    entry: ProviderEntry,
    client: Client,
    output_dir: PathBuf,
    image_field: String,
    form_fields: Vec<(String, String)>,
    extractor: ReferenceExtractor,
}

impl HttpDispatch {
    pub fn new(entry: ProviderEntry, client: Client, output_dir: PathBuf) -> Self {
        let (image_field, form_fields, paths) = match &entry.backend {
            BackendConfig::SyncHttp {
                image_field,
                form_fields,
                reference_paths,
            } => (
                image_field.clone(),
                form_fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                reference_paths.clone(),
            ),
            _ => ("image".to_string(), Vec::new(), Vec::new()),
        };
        let extractor = if paths.is_empty() {
            ReferenceExtractor::from_pointers(DEFAULT_REFERENCE_PATHS)
        } else {
            ReferenceExtractor::from_pointers(&paths)
        };
        Self {
            entry,
            client,
            output_dir,
            image_field,
            form_fields,
            extractor,
        }
    }

    fn is_binary_model(content_type: Option<&str>) -> bool {
        content_type
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_lowercase())
            .is_some_and(|ct| BINARY_MODEL_TYPES.contains(&ct.as_str()))
    }
}

#[async_trait]
impl ProviderAdapter for HttpDispatch {
    fn id(&self) -> &str {
        &self.entry.id
    }

    fn input(&self) -> InputKind {
        InputKind::Image
    }

    fn timeout(&self) -> Duration {
        self.entry.timeout()
    }

    async fn submit_and_await(
        &self,
        req: &ProviderRequest,
    ) -> Result<ProviderResult, GenerationError> {
        let provider = self.entry.id.as_str();
        let start = Instant::now();
        let api_key = self.entry.credential()?;
        let image = req.require_image(provider)?;

        let timeout = remaining_or_timeout(provider, req.deadline, start)?;
        let (bytes, mime) = load_image_bytes(&self.client, provider, image, timeout).await?;

        let file_part = Part::bytes(bytes.to_vec())
            .file_name(format!("input.{}", image.extension()))
            .mime_str(&mime)
            .map_err(|e| GenerationError::Other(format!("invalid image mime type {mime}: {e}")))?;
        let mut form = Form::new().part(self.image_field.clone(), file_part);
        for (k, v) in &self.form_fields {
            form = form.text(k.clone(), v.clone());
        }

        req.progress.report(50, format!("Converting image to 3D with {provider}..."));
        req.progress.enter(AttemptStatus::Submitted);

        // Re-derive after the image fetch so the upload gets only what is left.
        let timeout = remaining_or_timeout(provider, req.deadline, start)?;
        let mut request = self.client.post(&self.entry.endpoint).timeout(timeout);
        if let Some(key) = api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                GenerationError::from_transport(provider, e, start.elapsed().as_millis() as u64)
            })?;
        let response = check_status(provider, response, MAX_RESPONSE_BYTES).await?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        req.progress.report(90, "Processing 3D model...");

        let model_reference = if Self::is_binary_model(content_type.as_deref()) {
            let payload = read_capped(provider, response, MAX_MODEL_BYTES).await?;
            if payload.is_empty() {
                return Err(GenerationError::NoModelReference {
                    provider: provider.to_string(),
                });
            }
            let path = persist_model_payload(&self.output_dir, provider, &payload).await?;
            tracing::info!(
                provider = provider,
                bytes = payload.len(),
                path = %path.display(),
                "binary model payload persisted"
            );
            path.to_string_lossy().into_owned()
        } else {
            let body = read_capped(provider, response, MAX_RESPONSE_BYTES).await?;
            let value: serde_json::Value = serde_json::from_slice(&body).map_err(|e| {
                GenerationError::SchemaParse(format!("{provider} response: {e}"))
            })?;
            self.extractor.extract(&value).ok_or_else(|| {
                tracing::warn!(
                    provider = provider,
                    tried = ?self.extractor.describe(),
                    "no model reference in response"
                );
                GenerationError::NoModelReference {
                    provider: provider.to_string(),
                }
            })?
        };

        Ok(ProviderResult {
            model_reference,
            provider: provider.to_string(),
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }
}
