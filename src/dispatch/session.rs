use std::time::{Duration, Instant};

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::{Client, RequestBuilder};
use reqwest::multipart::{Form, Part};
use serde_json::Value;

use crate::dispatch::registry::{BackendConfig, ProviderEntry, SessionParam};
use crate::dispatch::{
    ImageRef, InputKind, ProviderAdapter, ProviderRequest, ProviderResult, check_status,
    read_capped, remaining_or_timeout,
};
use crate::error::GenerationError;
use crate::orchestrator::AttemptStatus;
use crate::parsers::ReferenceExtractor;
use crate::progress::scale;

/// `path` is checked before `url`: the Space's own file handle wins.
pub const DEFAULT_REFERENCE_PATHS: &[&str] = &["/0/path", "/0/url", "/0"];

const MAX_SESSION_RESPONSE_BYTES: usize = 1024 * 1024;

/// Streamed events after which progress stops advancing.
const PROGRESS_EVENT_HORIZON: u32 = 20;

/// The named predict call issued once per session.
#[derive(Debug, Clone)]
pub struct PredictCall {
    pub api_name: String,
    pub image_param: Option<String>,
    pub prompt_param: Option<String>,
    pub params: Vec<SessionParam>,
}

impl PredictCall {
    /// Positional argument list: configured params in order, with the image
    /// and prompt placed into their named slots. Slots that are not listed
    /// among the params are prepended (image first).
    pub fn data(&self, image: Option<Value>, prompt: Option<&str>) -> Vec<Value> {
        let is_slot = |slot: &Option<String>, name: &str| slot.as_deref() == Some(name);
        let prompt_value = prompt.map(Value::from).unwrap_or(Value::Null);
        let image_value = image.unwrap_or(Value::Null);

        let mut data: Vec<Value> = self
            .params
            .iter()
            .map(|p| {
                if is_slot(&self.image_param, &p.name) {
                    image_value.clone()
                } else if is_slot(&self.prompt_param, &p.name) {
                    prompt_value.clone()
                } else {
                    p.value.clone()
                }
            })
            .collect();

        let listed = |slot: &Option<String>| {
            slot.as_ref()
                .is_some_and(|name| self.params.iter().any(|p| &p.name == name))
        };
        if self.prompt_param.is_some() && !listed(&self.prompt_param) {
            data.insert(0, prompt_value);
        }
        if self.image_param.is_some() && !listed(&self.image_param) {
            data.insert(0, image_value);
        }
        data
    }
}

/// File handle in the shape the Space expects for file inputs.
pub fn file_data(path: &str, url: Option<&str>) -> Value {
    let mut v = serde_json::json!({
        "path": path,
        "meta": {"_type": "gradio.FileData"},
    });
    if let Some(url) = url {
        v["url"] = Value::String(url.to_string());
    }
    v
}

/// A stateful session against one Space, scoped to a single predict call.
/// Dropping the session releases it; every exit path of the adapter drops it.
pub struct SpaceSession<'a> {
    client: &'a Client,
    provider: &'a str,
    base_url: String,
    token: Option<&'a str>,
    session_hash: String,
    opened: Instant,
}

impl<'a> SpaceSession<'a> {
    pub fn open(client: &'a Client, provider: &'a str, base_url: &str, token: Option<&'a str>) -> Self {
        let session_hash = uuid::Uuid::new_v4().simple().to_string();
        tracing::debug!(provider = provider, session = session_hash, "session opened");
        Self {
            client,
            provider,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            session_hash,
            opened: Instant::now(),
        }
    }

    pub fn session_hash(&self) -> &str {
        &self.session_hash
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.token {
            Some(token) => builder.header("Authorization", format!("Bearer {token}")),
            None => builder,
        }
    }

    /// Upload an inline image; returns the server-side path.
    pub async fn upload(
        &self,
        bytes: &[u8],
        mime: &str,
        filename: String,
        timeout: Duration,
    ) -> Result<String, GenerationError> {
        let url = format!("{}/gradio_api/upload", self.base_url);
        let part = Part::bytes(bytes.to_vec())
            .file_name(filename)
            .mime_str(mime)
            .map_err(|e| GenerationError::Other(format!("invalid image mime type {mime}: {e}")))?;
        let request = self
            .client
            .post(&url)
            .query(&[("upload_id", self.session_hash.as_str())])
            .timeout(timeout)
            .multipart(Form::new().part("files", part));
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let response = check_status(self.provider, response, MAX_SESSION_RESPONSE_BYTES).await?;
        let body = read_capped(self.provider, response, MAX_SESSION_RESPONSE_BYTES).await?;
        let v: Value = serde_json::from_slice(&body)
            .map_err(|e| GenerationError::SchemaParse(format!("session upload response: {e}")))?;
        v[0].as_str().map(|s| s.to_string()).ok_or_else(|| {
            GenerationError::SchemaParse("session upload response missing file path".into())
        })
    }

    /// Issue the predict call; returns the event id to stream results from.
    pub async fn call(
        &self,
        api_name: &str,
        data: Vec<Value>,
        timeout: Duration,
    ) -> Result<String, GenerationError> {
        let url = format!("{}/gradio_api/call/{api_name}", self.base_url);
        let body = serde_json::json!({
            "data": data,
            "session_hash": self.session_hash,
        });
        let request = self.client.post(&url).timeout(timeout).json(&body);
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let response = check_status(self.provider, response, MAX_SESSION_RESPONSE_BYTES).await?;
        let body = read_capped(self.provider, response, MAX_SESSION_RESPONSE_BYTES).await?;
        let v: Value = serde_json::from_slice(&body)
            .map_err(|e| GenerationError::SchemaParse(format!("session call response: {e}")))?;
        v["event_id"].as_str().map(|s| s.to_string()).ok_or_else(|| {
            GenerationError::SchemaParse("session call response missing 'event_id'".into())
        })
    }

    /// Read the result stream until `complete` or `error`.
    /// Returns the `complete` payload (the output array).
    pub async fn await_result(
        &self,
        api_name: &str,
        event_id: &str,
        req: &ProviderRequest,
        start: Instant,
    ) -> Result<Value, GenerationError> {
        let url = format!("{}/gradio_api/call/{api_name}/{event_id}", self.base_url);
        // Only the header wait is bounded here; the event loop below owns the
        // deadline once the stream is open.
        let remaining = remaining_or_timeout(self.provider, req.deadline, start)?;
        let response = tokio::time::timeout(remaining, self.authorize(self.client.get(&url)).send())
            .await
            .map_err(|_| GenerationError::TaskTimedOut {
                provider: self.provider.to_string(),
                elapsed_ms: start.elapsed().as_millis() as u64,
            })?
            .map_err(|e| self.transport_error(e))?;
        let response = check_status(self.provider, response, MAX_SESSION_RESPONSE_BYTES).await?;

        let mut stream = std::pin::pin!(response.bytes_stream().eventsource());
        let mut events: u32 = 0;

        loop {
            let remaining = remaining_or_timeout(self.provider, req.deadline, start)?;
            let next = tokio::time::timeout(remaining, stream.next())
                .await
                .map_err(|_| GenerationError::TaskTimedOut {
                    provider: self.provider.to_string(),
                    elapsed_ms: start.elapsed().as_millis() as u64,
                })?;

            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    return Err(GenerationError::TaskFailed {
                        provider: self.provider.to_string(),
                        message: format!("result stream error: {e}"),
                    });
                }
                None => {
                    return Err(GenerationError::TaskFailed {
                        provider: self.provider.to_string(),
                        message: "result stream closed before completion".to_string(),
                    });
                }
            };

            match event.event.as_str() {
                "complete" => {
                    return serde_json::from_str(&event.data).map_err(|e| {
                        GenerationError::SchemaParse(format!("session result payload: {e}"))
                    });
                }
                "error" => {
                    let message = match event.data.trim() {
                        "" | "null" => "space reported an error".to_string(),
                        other => other.trim_matches('"').to_string(),
                    };
                    return Err(GenerationError::TaskFailed {
                        provider: self.provider.to_string(),
                        message,
                    });
                }
                "generating" | "heartbeat" => {
                    events += 1;
                    req.progress.enter(AttemptStatus::Polling);
                    req.progress.report(
                        scale(55, 90, events, PROGRESS_EVENT_HORIZON),
                        "Generating...",
                    );
                }
                other => {
                    tracing::debug!(provider = self.provider, event = other, "ignoring event");
                }
            }
        }
    }

    fn transport_error(&self, e: reqwest::Error) -> GenerationError {
        GenerationError::from_transport(
            self.provider,
            e,
            self.opened.elapsed().as_millis() as u64,
        )
    }
}

impl Drop for SpaceSession<'_> {
    fn drop(&mut self) {
        tracing::debug!(
            provider = self.provider,
            session = self.session_hash,
            elapsed_ms = self.opened.elapsed().as_millis() as u64,
            "session closed"
        );
    }
}

/// Stateful RPC-style Space: one session, one predict call, streamed result.
pub struct SessionDispatch {
    entry: ProviderEntry,
    client: Client,
    call: PredictCall,
    extractor: ReferenceExtractor,
}

impl SessionDispatch {
    pub fn new(entry: ProviderEntry, client: Client) -> Self {
        let (call, paths) = match &entry.backend {
            BackendConfig::Session {
                api_name,
                image_param,
                prompt_param,
                params,
                reference_paths,
            } => (
                PredictCall {
                    api_name: api_name.trim_start_matches('/').to_string(),
                    image_param: image_param.clone(),
                    prompt_param: prompt_param.clone(),
                    params: params.clone(),
                },
                reference_paths.clone(),
            ),
            _ => (
                PredictCall {
                    api_name: "predict".to_string(),
                    image_param: Some("image".to_string()),
                    prompt_param: None,
                    params: Vec::new(),
                },
                Vec::new(),
            ),
        };
        let extractor = if paths.is_empty() {
            ReferenceExtractor::from_pointers(DEFAULT_REFERENCE_PATHS)
        } else {
            ReferenceExtractor::from_pointers(&paths)
        };
        Self {
            entry,
            client,
            call,
            extractor,
        }
    }

    async fn image_argument(
        &self,
        session: &SpaceSession<'_>,
        image: &ImageRef,
        timeout: Duration,
    ) -> Result<Value, GenerationError> {
        match image {
            ImageRef::Url(url) => Ok(file_data(url, Some(url))),
            ImageRef::Inline { bytes, mime } => {
                let path = session
                    .upload(bytes, mime, format!("input.{}", image.extension()), timeout)
                    .await?;
                Ok(file_data(&path, None))
            }
        }
    }
}

#[async_trait]
impl ProviderAdapter for SessionDispatch {
    fn id(&self) -> &str {
        &self.entry.id
    }

    fn input(&self) -> InputKind {
        if self.call.image_param.is_some() {
            InputKind::Image
        } else {
            InputKind::Prompt
        }
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
        let token = self.entry.credential()?;

        let session = SpaceSession::open(&self.client, provider, &self.entry.endpoint, token);

        let image = match self.call.image_param {
            Some(_) => {
                let image = req.require_image(provider)?;
                let timeout = remaining_or_timeout(provider, req.deadline, start)?;
                Some(self.image_argument(&session, image, timeout).await?)
            }
            None => None,
        };
        let prompt = match self.call.prompt_param {
            Some(_) if self.input() == InputKind::Prompt => Some(req.require_prompt(provider)?),
            Some(_) => req.prompt.as_deref(),
            None => None,
        };

        req.progress
            .report(50, format!("Converting to 3D with {provider}..."));
        let timeout = remaining_or_timeout(provider, req.deadline, start)?;
        let event_id = session
            .call(&self.call.api_name, self.call.data(image, prompt), timeout)
            .await?;
        req.progress.enter(AttemptStatus::Submitted);
        tracing::info!(
            provider = provider,
            session = session.session_hash(),
            event_id = event_id,
            "predict call accepted"
        );

        let output = session
            .await_result(&self.call.api_name, &event_id, req, start)
            .await?;

        let model_reference = self.extractor.extract(&output).ok_or_else(|| {
            tracing::warn!(
                provider = provider,
                tried = ?self.extractor.describe(),
                "no model reference in session output"
            );
            GenerationError::NoModelReference {
                provider: provider.to_string(),
            }
        })?;

        req.progress.report(90, "Finalizing model...");
        Ok(ProviderResult {
            model_reference,
            provider: provider.to_string(),
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }
}
