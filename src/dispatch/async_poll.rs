use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use reqwest::multipart::{Form, Part};

use crate::dispatch::registry::{AsyncPollProviderType, BackendConfig, ProviderEntry};
use crate::dispatch::{
    InputKind, ProviderAdapter, ProviderRequest, ProviderResult, check_status, load_image_bytes,
    read_capped, remaining_or_timeout,
};
use crate::error::GenerationError;
use crate::orchestrator::AttemptStatus;
use crate::parsers::ReferenceExtractor;
use crate::progress::scale;

/// Max body size for upload/submit/poll responses.
const MAX_POLL_RESPONSE_BYTES: usize = 1024 * 1024;

/// Max consecutive poll failures before giving up.
pub const MAX_POLL_FAILURES: u32 = 5;

/// Upper bound on any single upload/submit/poll HTTP call.
const PER_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Remote status of a long-running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Processing,
    Success,
    Failed,
}

/// Snapshot of a remote task, as parsed from one poll response.
#[derive(Debug, Clone)]
pub struct ProviderTask {
    pub task_id: String,
    pub status: TaskStatus,
    /// Model reference, present once `status` is `Success`.
    pub result: Option<String>,
    pub error: Option<String>,
    /// Remote-reported completion, 0–100, when the API exposes one.
    pub progress: Option<u8>,
}

/// Inputs available to the submit step.
pub struct SubmitInput<'a> {
    pub prompt: Option<&'a str>,
    /// Opaque token from the upload step.
    pub image_token: Option<&'a str>,
    /// File extension of the uploaded image (`png`, `jpg`).
    pub image_ext: &'a str,
    pub model: Option<&'a str>,
}

/// Provider-specific request/response handling for upload → submit → poll APIs.
pub trait AsyncPollApi: Send + Sync {
    fn input(&self) -> InputKind;

    /// Build the upload request. Returns (url, headers, multipart field name),
    /// or None when the API takes its input inline with the submit call.
    fn build_upload_request(
        &self,
        base_url: &str,
        api_key: &str,
    ) -> Option<(String, Vec<(String, String)>, String)>;

    /// Parse the upload response to extract the image token.
    fn parse_upload_response(&self, body: &[u8]) -> Result<String, GenerationError>;

    /// Build the submit request. Returns (url, headers, body).
    fn build_submit_request(
        &self,
        base_url: &str,
        api_key: &str,
        input: &SubmitInput<'_>,
    ) -> (String, Vec<(String, String)>, serde_json::Value);

    /// Parse the submit response to extract the task ID.
    fn parse_submit_response(&self, body: &[u8]) -> Result<String, GenerationError>;

    /// Build the poll request. Returns (url, headers).
    fn build_poll_request(
        &self,
        base_url: &str,
        task_id: &str,
        api_key: &str,
    ) -> (String, Vec<(String, String)>);

    /// Parse the poll response into a task snapshot.
    fn parse_poll_response(&self, task_id: &str, body: &[u8])
    -> Result<ProviderTask, GenerationError>;
}

fn parse_json(label: &str, body: &[u8]) -> Result<serde_json::Value, GenerationError> {
    serde_json::from_slice(body)
        .map_err(|e| GenerationError::SchemaParse(format!("{label} response: {e}")))
}

// ---------------------------------------------------------------------------
// Tripo3D OpenAPI (upload → image_to_model task → poll)
// ---------------------------------------------------------------------------

pub struct Tripo3dApi {
    output: ReferenceExtractor,
}

impl Default for Tripo3dApi {
    fn default() -> Self {
        Self::new()
    }
}

impl Tripo3dApi {
    pub fn new() -> Self {
        Self {
            output: ReferenceExtractor::from_pointers(&[
                "/data/output/pbr_model",
                "/data/output/model",
                "/data/output/base_model",
                "/data/result/pbr_model/url",
                "/data/result/model/url",
            ]),
        }
    }

    /// Tripo wraps every payload in `{"code": 0, "data": {...}}`.
    fn unwrap_envelope(label: &str, body: &[u8]) -> Result<serde_json::Value, GenerationError> {
        let v = parse_json(label, body)?;
        match v["code"].as_i64() {
            Some(0) => Ok(v),
            Some(code) => Err(GenerationError::Upstream {
                provider: "tripo3d".to_string(),
                message: format!(
                    "{label} rejected with code {code}: {}",
                    v["message"].as_str().unwrap_or("no message")
                ),
                status: None,
            }),
            None => Err(GenerationError::SchemaParse(format!(
                "{label} response missing 'code'"
            ))),
        }
    }
}

impl AsyncPollApi for Tripo3dApi {
    fn input(&self) -> InputKind {
        InputKind::Image
    }

    fn build_upload_request(
        &self,
        base_url: &str,
        api_key: &str,
    ) -> Option<(String, Vec<(String, String)>, String)> {
        let url = format!("{}/upload", base_url.trim_end_matches('/'));
        let headers = vec![("Authorization".to_string(), format!("Bearer {api_key}"))];
        Some((url, headers, "file".to_string()))
    }

    fn parse_upload_response(&self, body: &[u8]) -> Result<String, GenerationError> {
        let v = Self::unwrap_envelope("Tripo3D upload", body)?;
        v["data"]["image_token"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| {
                GenerationError::SchemaParse("Tripo3D upload response missing 'image_token'".into())
            })
    }

    fn build_submit_request(
        &self,
        base_url: &str,
        api_key: &str,
        input: &SubmitInput<'_>,
    ) -> (String, Vec<(String, String)>, serde_json::Value) {
        let url = format!("{}/task", base_url.trim_end_matches('/'));
        let headers = vec![
            ("Authorization".to_string(), format!("Bearer {api_key}")),
            ("Content-Type".to_string(), "application/json".to_string()),
        ];
        let mut body = serde_json::json!({
            "type": "image_to_model",
            "file": {
                "type": input.image_ext,
                "file_token": input.image_token.unwrap_or_default(),
            },
        });
        if let Some(model) = input.model {
            body["model_version"] = serde_json::Value::String(model.to_string());
        }
        (url, headers, body)
    }

    fn parse_submit_response(&self, body: &[u8]) -> Result<String, GenerationError> {
        let v = Self::unwrap_envelope("Tripo3D submit", body)?;
        v["data"]["task_id"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| {
                GenerationError::SchemaParse("Tripo3D submit response missing 'task_id'".into())
            })
    }

    fn build_poll_request(
        &self,
        base_url: &str,
        task_id: &str,
        api_key: &str,
    ) -> (String, Vec<(String, String)>) {
        let url = format!("{}/task/{task_id}", base_url.trim_end_matches('/'));
        let headers = vec![("Authorization".to_string(), format!("Bearer {api_key}"))];
        (url, headers)
    }

    fn parse_poll_response(
        &self,
        task_id: &str,
        body: &[u8],
    ) -> Result<ProviderTask, GenerationError> {
        let v = Self::unwrap_envelope("Tripo3D poll", body)?;
        let data = &v["data"];
        let progress = data["progress"].as_u64().map(|p| p.min(100) as u8);

        let (status, result, error) = match data["status"].as_str() {
            Some("queued" | "running") => (TaskStatus::Processing, None, None),
            Some("success") => (TaskStatus::Success, self.output.extract(&v), None),
            Some(status @ ("failed" | "cancelled" | "banned" | "expired" | "unknown")) => {
                (TaskStatus::Failed, None, Some(format!("task {status}")))
            }
            Some(other) => (
                TaskStatus::Failed,
                None,
                Some(format!("unknown status: {other}")),
            ),
            None => {
                return Err(GenerationError::SchemaParse(
                    "Tripo3D poll response missing 'status'".into(),
                ));
            }
        };

        Ok(ProviderTask {
            task_id: task_id.to_string(),
            status,
            result,
            error,
            progress,
        })
    }
}

// ---------------------------------------------------------------------------
// Replicate predictions (create → poll)
// ---------------------------------------------------------------------------

pub struct ReplicateApi {
    output: ReferenceExtractor,
}

impl Default for ReplicateApi {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicateApi {
    pub fn new() -> Self {
        Self {
            output: ReferenceExtractor::from_pointers(&["/output", "/output/0", "/output/mesh"]),
        }
    }
}

impl AsyncPollApi for ReplicateApi {
    fn input(&self) -> InputKind {
        InputKind::Prompt
    }

    fn build_upload_request(
        &self,
        _base_url: &str,
        _api_key: &str,
    ) -> Option<(String, Vec<(String, String)>, String)> {
        None
    }

    fn parse_upload_response(&self, _body: &[u8]) -> Result<String, GenerationError> {
        Err(GenerationError::Other(
            "Replicate predictions take no upload step".into(),
        ))
    }

    fn build_submit_request(
        &self,
        base_url: &str,
        api_key: &str,
        input: &SubmitInput<'_>,
    ) -> (String, Vec<(String, String)>, serde_json::Value) {
        let url = format!("{}/predictions", base_url.trim_end_matches('/'));
        let headers = vec![
            ("Authorization".to_string(), format!("Bearer {api_key}")),
            ("Content-Type".to_string(), "application/json".to_string()),
        ];
        let body = serde_json::json!({
            "version": input.model.unwrap_or_default(),
            "input": {
                "prompt": input.prompt.unwrap_or_default(),
                "guidance_scale": 15.0,
                "num_inference_steps": 64,
            },
        });
        (url, headers, body)
    }

    fn parse_submit_response(&self, body: &[u8]) -> Result<String, GenerationError> {
        let v = parse_json("Replicate submit", body)?;
        v["id"].as_str().map(|s| s.to_string()).ok_or_else(|| {
            GenerationError::SchemaParse("Replicate submit response missing 'id'".into())
        })
    }

    fn build_poll_request(
        &self,
        base_url: &str,
        task_id: &str,
        api_key: &str,
    ) -> (String, Vec<(String, String)>) {
        let url = format!(
            "{}/predictions/{task_id}",
            base_url.trim_end_matches('/')
        );
        let headers = vec![("Authorization".to_string(), format!("Bearer {api_key}"))];
        (url, headers)
    }

    fn parse_poll_response(
        &self,
        task_id: &str,
        body: &[u8],
    ) -> Result<ProviderTask, GenerationError> {
        let v = parse_json("Replicate poll", body)?;

        let (status, result, error) = match v["status"].as_str() {
            Some("starting" | "processing") => (TaskStatus::Processing, None, None),
            Some("succeeded") => (TaskStatus::Success, self.output.extract(&v), None),
            Some(status @ ("failed" | "canceled")) => {
                let msg = v["error"].as_str().unwrap_or(status);
                (TaskStatus::Failed, None, Some(msg.to_string()))
            }
            Some(other) => (
                TaskStatus::Failed,
                None,
                Some(format!("unknown status: {other}")),
            ),
            None => {
                return Err(GenerationError::SchemaParse(
                    "Replicate poll response missing 'status'".into(),
                ));
            }
        };

        Ok(ProviderTask {
            task_id: task_id.to_string(),
            status,
            result,
            error,
            progress: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Async Poll Dispatcher
// ---------------------------------------------------------------------------

/// Fixed-interval polling policy for one provider.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
    pub progress_low: u8,
    pub progress_high: u8,
}

impl PollPolicy {
    /// Progress for a poll tick: proportional position in the attempt budget,
    /// or the remote-reported percent mapped into the same range if further along.
    pub fn percent_for(&self, attempt: u32, remote: Option<u8>) -> u8 {
        let by_attempt = scale(self.progress_low, self.progress_high, attempt, self.max_attempts);
        let by_remote = remote
            .map(|p| scale(self.progress_low, self.progress_high, u32::from(p), 100))
            .unwrap_or(0);
        by_attempt.max(by_remote)
    }
}

pub struct AsyncPollDispatch {
    entry: ProviderEntry,
    client: Client,
    api: Box<dyn AsyncPollApi>,
    model: Option<String>,
    policy: PollPolicy,
}

impl AsyncPollDispatch {
    pub fn new(entry: ProviderEntry, client: Client) -> Self {
        let (provider_type, model, policy) = match &entry.backend {
            BackendConfig::AsyncPoll {
                api,
                model,
                poll_interval_ms,
                max_attempts,
                progress_low,
                progress_high,
            } => (
                *api,
                model.clone(),
                PollPolicy {
                    interval: Duration::from_millis(*poll_interval_ms),
                    max_attempts: *max_attempts,
                    progress_low: *progress_low,
                    progress_high: *progress_high,
                },
            ),
            _ => (
                AsyncPollProviderType::Tripo3d,
                None,
                PollPolicy {
                    interval: Duration::from_secs(5),
                    max_attempts: 60,
                    progress_low: 30,
                    progress_high: 90,
                },
            ),
        };
        Self {
            entry,
            client,
            api: Self::api_for(provider_type),
            model,
            policy,
        }
    }

    pub fn api_for(provider_type: AsyncPollProviderType) -> Box<dyn AsyncPollApi> {
        match provider_type {
            AsyncPollProviderType::Tripo3d => Box::new(Tripo3dApi::new()),
            AsyncPollProviderType::Replicate => Box::new(ReplicateApi::new()),
        }
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    async fn upload_image(
        &self,
        req: &ProviderRequest,
        api_key: &str,
        start: Instant,
    ) -> Result<Option<String>, GenerationError> {
        let provider = self.entry.id.as_str();
        let Some((url, headers, field)) = self.api.build_upload_request(&self.entry.endpoint, api_key)
        else {
            return Ok(None);
        };
        let image = req.require_image(provider)?;

        let remaining = remaining_or_timeout(provider, req.deadline, start)?;
        let (bytes, mime) =
            load_image_bytes(&self.client, provider, image, remaining.min(PER_CALL_TIMEOUT)).await?;

        let part = Part::bytes(bytes.to_vec())
            .file_name(format!("input.{}", image.extension()))
            .mime_str(&mime)
            .map_err(|e| GenerationError::Other(format!("invalid image mime type {mime}: {e}")))?;

        let remaining = remaining_or_timeout(provider, req.deadline, start)?;
        let mut upload = self
            .client
            .post(&url)
            .timeout(remaining.min(PER_CALL_TIMEOUT));
        for (k, v) in &headers {
            upload = upload.header(k, v);
        }

        let response = upload
            .multipart(Form::new().part(field, part))
            .send()
            .await
            .map_err(|e| {
                GenerationError::from_transport(provider, e, start.elapsed().as_millis() as u64)
            })?;
        let response = check_status(provider, response, MAX_POLL_RESPONSE_BYTES).await?;
        let body = read_capped(provider, response, MAX_POLL_RESPONSE_BYTES).await?;
        let token = self
            .api
            .parse_upload_response(&body)
            .map_err(|e| e.with_provider(provider))?;
        tracing::debug!(provider = provider, "image uploaded");
        Ok(Some(token))
    }
}

#[async_trait]
impl ProviderAdapter for AsyncPollDispatch {
    fn id(&self) -> &str {
        &self.entry.id
    }

    fn input(&self) -> InputKind {
        self.api.input()
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
        let api_key = self
            .entry
            .credential()?
            .ok_or_else(|| GenerationError::ProviderUnavailable {
                provider: provider.to_string(),
                message: "credential required".to_string(),
            })?;

        let prompt = match self.api.input() {
            InputKind::Prompt => Some(req.require_prompt(provider)?),
            InputKind::Image => req.prompt.as_deref(),
        };
        if self.api.input() == InputKind::Prompt && self.model.is_none() {
            return Err(GenerationError::ProviderUnavailable {
                provider: provider.to_string(),
                message: "no model version configured".to_string(),
            });
        }

        // 1. Upload the image (APIs with an upload step only)
        let image_token = self.upload_image(req, api_key, start).await?;
        let image_ext = req.image.as_ref().map(|i| i.extension()).unwrap_or("png");

        // 2. Submit the task
        req.progress.report(
            self.policy.progress_low.saturating_sub(10),
            format!("Creating {provider} task..."),
        );
        let input = SubmitInput {
            prompt,
            image_token: image_token.as_deref(),
            image_ext,
            model: self.model.as_deref(),
        };
        let (submit_url, submit_headers, submit_body) =
            self.api
                .build_submit_request(&self.entry.endpoint, api_key, &input);

        let remaining = remaining_or_timeout(provider, req.deadline, start)?;
        let mut submit = self
            .client
            .post(&submit_url)
            .timeout(remaining.min(PER_CALL_TIMEOUT));
        for (k, v) in &submit_headers {
            submit = submit.header(k, v);
        }
        let response = submit
            .json(&submit_body)
            .send()
            .await
            .map_err(|e| {
                GenerationError::from_transport(provider, e, start.elapsed().as_millis() as u64)
            })?;
        let response = check_status(provider, response, MAX_POLL_RESPONSE_BYTES).await?;
        let body = read_capped(provider, response, MAX_POLL_RESPONSE_BYTES).await?;
        let task_id = self
            .api
            .parse_submit_response(&body)
            .map_err(|e| e.with_provider(provider))?;

        req.progress.enter(AttemptStatus::Submitted);
        req.progress
            .report(self.policy.progress_low, "Generating 3D model...");
        tracing::info!(provider = provider, task_id = task_id, "task submitted");

        // 3. Poll loop
        let mut consecutive_failures: u32 = 0;

        for attempt in 1..=self.policy.max_attempts {
            // Abandonment checkpoint: before each tick, never mid-request.
            if req.is_cancelled() {
                tracing::info!(provider = provider, task_id = task_id, "poll cancelled");
                return Err(GenerationError::Cancelled);
            }

            let remaining = req.remaining().unwrap_or_default();
            if remaining < self.policy.interval {
                return Err(GenerationError::TaskTimedOut {
                    provider: provider.to_string(),
                    elapsed_ms: start.elapsed().as_millis() as u64,
                });
            }

            tokio::time::sleep(self.policy.interval).await;
            req.progress.enter(AttemptStatus::Polling);

            // Recalculate remaining AFTER sleep so the poll cannot overrun the deadline.
            let remaining = remaining_or_timeout(provider, req.deadline, start)?;

            let (poll_url, poll_headers) =
                self.api
                    .build_poll_request(&self.entry.endpoint, &task_id, api_key);
            let mut poll_req = self
                .client
                .get(&poll_url)
                .timeout(remaining.min(PER_CALL_TIMEOUT));
            for (k, v) in &poll_headers {
                poll_req = poll_req.header(k, v);
            }

            let poll_resp = match poll_req.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    consecutive_failures += 1;
                    tracing::warn!(
                        provider = provider,
                        task_id = task_id,
                        attempt = attempt,
                        failures = consecutive_failures,
                        "poll request failed: {e}"
                    );
                    if consecutive_failures >= MAX_POLL_FAILURES {
                        return Err(GenerationError::from_transport(
                            provider,
                            e,
                            start.elapsed().as_millis() as u64,
                        ));
                    }
                    continue;
                }
            };

            let status = poll_resp.status();

            // Auth failures during poll are not transient, fail fast
            if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
            {
                return Err(GenerationError::AuthFailed {
                    provider: provider.to_string(),
                    message: format!("poll HTTP {status}"),
                });
            }

            if !status.is_success() {
                consecutive_failures += 1;
                tracing::warn!(
                    provider = provider,
                    task_id = task_id,
                    status = status.as_u16(),
                    failures = consecutive_failures,
                    "poll returned non-success status"
                );
                if consecutive_failures >= MAX_POLL_FAILURES {
                    return Err(if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                        GenerationError::RateLimited {
                            provider: provider.to_string(),
                        }
                    } else {
                        GenerationError::Upstream {
                            provider: provider.to_string(),
                            message: format!("poll HTTP {status}"),
                            status: Some(status.as_u16()),
                        }
                    });
                }
                continue;
            }

            consecutive_failures = 0;

            let poll_body = read_capped(provider, poll_resp, MAX_POLL_RESPONSE_BYTES).await?;
            let task = self
                .api
                .parse_poll_response(&task_id, &poll_body)
                .map_err(|e| e.with_provider(provider))?;

            match task.status {
                TaskStatus::Processing => {
                    let percent = self.policy.percent_for(attempt, task.progress);
                    req.progress.report(percent, "Generating...");
                    tracing::debug!(
                        provider = provider,
                        task_id = task.task_id,
                        attempt = attempt,
                        percent = percent,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "task still processing"
                    );
                }
                TaskStatus::Success => {
                    let model_reference =
                        task.result
                            .ok_or_else(|| GenerationError::NoModelReference {
                                provider: provider.to_string(),
                            })?;
                    let latency_ms = start.elapsed().as_millis() as u64;
                    tracing::info!(
                        provider = provider,
                        task_id = task.task_id,
                        attempts = attempt,
                        elapsed_ms = latency_ms,
                        "task completed"
                    );
                    req.progress.report(self.policy.progress_high, "Finalizing model...");
                    return Ok(ProviderResult {
                        model_reference,
                        provider: provider.to_string(),
                        latency_ms,
                    });
                }
                TaskStatus::Failed => {
                    return Err(GenerationError::TaskFailed {
                        provider: provider.to_string(),
                        message: task
                            .error
                            .unwrap_or_else(|| "remote reported failure".to_string()),
                    });
                }
            }
        }

        tracing::warn!(
            provider = provider,
            task_id = task_id,
            max_attempts = self.policy.max_attempts,
            "poll attempt budget exhausted"
        );
        Err(GenerationError::TaskTimedOut {
            provider: provider.to_string(),
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
    }
}
