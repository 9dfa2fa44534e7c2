pub mod async_poll;
pub mod http;
pub mod registry;
pub mod session;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Response};
use tokio_util::sync::CancellationToken;

use crate::error::GenerationError;
use crate::progress::ProgressReporter;

/// Max image size fetched from a caller-supplied URL (20MB).
pub const MAX_IMAGE_BYTES: usize = 20 * 1024 * 1024;

/// Max model payload accepted from a provider (100MB).
pub const MAX_MODEL_BYTES: usize = 100 * 1024 * 1024;

/// Atomic counter for unique model filenames.
static PERSIST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// An input image, either a remote URL or bytes held in memory.
#[derive(Clone, PartialEq, Eq)]
pub enum ImageRef {
    Url(String),
    Inline { bytes: Bytes, mime: String },
}

impl ImageRef {
    pub fn inline(bytes: impl Into<Bytes>, mime: impl Into<String>) -> Self {
        Self::Inline {
            bytes: bytes.into(),
            mime: mime.into(),
        }
    }

    /// File extension matching the image's MIME type, for multipart uploads.
    pub fn extension(&self) -> &'static str {
        let mime = match self {
            Self::Inline { mime, .. } => mime.as_str(),
            Self::Url(url) => {
                let lower = url.to_lowercase();
                if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
                    "image/jpeg"
                } else if lower.ends_with(".webp") {
                    "image/webp"
                } else {
                    "image/png"
                }
            }
        };
        match mime {
            "image/jpeg" | "image/jpg" => "jpg",
            "image/webp" => "webp",
            _ => "png",
        }
    }
}

impl std::fmt::Debug for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Url(url) => f.debug_tuple("Url").field(url).finish(),
            Self::Inline { bytes, mime } => f
                .debug_struct("Inline")
                .field("len", &bytes.len())
                .field("mime", mime)
                .finish(),
        }
    }
}

/// Which input a provider consumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    Image,
    Prompt,
}

/// Internal request type accepted by every adapter.
pub struct ProviderRequest {
    pub prompt: Option<String>,
    pub image: Option<ImageRef>,
    pub deadline: Instant,
    /// Checked before each poll tick; adapters never abort mid-request.
    pub cancellation_token: Option<CancellationToken>,
    pub progress: ProgressReporter,
}

impl ProviderRequest {
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.checked_duration_since(Instant::now())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token
            .as_ref()
            .is_some_and(|t| t.is_cancelled())
    }

    pub fn require_image(&self, provider: &str) -> Result<&ImageRef, GenerationError> {
        self.image
            .as_ref()
            .ok_or_else(|| GenerationError::ProviderUnavailable {
                provider: provider.to_string(),
                message: "no input image available".to_string(),
            })
    }

    pub fn require_prompt(&self, provider: &str) -> Result<&str, GenerationError> {
        self.prompt
            .as_deref()
            .ok_or_else(|| GenerationError::ProviderUnavailable {
                provider: provider.to_string(),
                message: "no prompt available".to_string(),
            })
    }
}

/// Internal result type returned by every adapter.
#[derive(Debug)]
pub struct ProviderResult {
    pub model_reference: String,
    pub provider: String,
    pub latency_ms: u64,
}

/// Uniform contract over every provider wire protocol.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn id(&self) -> &str;

    fn input(&self) -> InputKind;

    /// Wall-clock budget for one attempt.
    fn timeout(&self) -> Duration;

    async fn submit_and_await(
        &self,
        req: &ProviderRequest,
    ) -> Result<ProviderResult, GenerationError>;
}

pub fn build_client() -> Result<Client, GenerationError> {
    let client = Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(4)
        .build()?;
    Ok(client)
}

/// Remaining time before `deadline`, or `TaskTimedOut` when too little is left.
pub fn remaining_or_timeout(
    provider: &str,
    deadline: Instant,
    start: Instant,
) -> Result<Duration, GenerationError> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|d| *d > Duration::from_millis(100))
        .ok_or_else(|| GenerationError::TaskTimedOut {
            provider: provider.to_string(),
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
}

/// Map non-success HTTP statuses to the error taxonomy.
/// Error bodies are read up to `max_bytes` and kept for logs only.
pub async fn check_status(
    provider: &str,
    response: Response,
    max_bytes: usize,
) -> Result<Response, GenerationError> {
    let status = response.status();

    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(GenerationError::RateLimited {
            provider: provider.to_string(),
        });
    }

    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(GenerationError::AuthFailed {
            provider: provider.to_string(),
            message: format!("{status}"),
        });
    }

    if !status.is_success() {
        let error_bytes = response.bytes().await.unwrap_or_default();
        let truncated = &error_bytes[..error_bytes.len().min(max_bytes)];
        let text = String::from_utf8_lossy(truncated);
        return Err(GenerationError::Upstream {
            provider: provider.to_string(),
            message: format!("{status}: {text}"),
            status: Some(status.as_u16()),
        });
    }

    Ok(response)
}

/// Read a response body, refusing anything larger than `max_bytes`.
pub async fn read_capped(
    provider: &str,
    response: Response,
    max_bytes: usize,
) -> Result<Bytes, GenerationError> {
    if response
        .content_length()
        .is_some_and(|len| len as usize > max_bytes)
    {
        return Err(GenerationError::Upstream {
            provider: provider.to_string(),
            message: format!("response too large (max {max_bytes} bytes)"),
            status: None,
        });
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| GenerationError::Upstream {
            provider: provider.to_string(),
            message: format!("failed to read response body: {e}"),
            status: None,
        })?;

    if bytes.len() > max_bytes {
        return Err(GenerationError::Upstream {
            provider: provider.to_string(),
            message: format!(
                "response too large: {} bytes (max {max_bytes})",
                bytes.len()
            ),
            status: None,
        });
    }

    Ok(bytes)
}

/// Materialize an image as bytes for multipart upload.
/// URL images are fetched once; inline images are returned as-is.
pub async fn load_image_bytes(
    client: &Client,
    provider: &str,
    image: &ImageRef,
    timeout: Duration,
) -> Result<(Bytes, String), GenerationError> {
    match image {
        ImageRef::Inline { bytes, mime } => Ok((bytes.clone(), mime.clone())),
        ImageRef::Url(url) => {
            let start = Instant::now();
            let response = client
                .get(url)
                .timeout(timeout)
                .send()
                .await
                .map_err(|e| {
                    GenerationError::from_transport(provider, e, start.elapsed().as_millis() as u64)
                })?;
            let response = check_status(provider, response, 4096).await?;
            let mime = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
                .filter(|v| v.starts_with("image/"))
                .unwrap_or_else(|| "image/png".to_string());
            let bytes = read_capped(provider, response, MAX_IMAGE_BYTES).await?;
            if bytes.is_empty() {
                return Err(GenerationError::Upstream {
                    provider: provider.to_string(),
                    message: "input image is empty".to_string(),
                    status: None,
                });
            }
            Ok((bytes, mime))
        }
    }
}

/// Only alphanumeric, `-` and `_` survive into filenames.
pub fn sanitize_provider_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Persist a binary model payload to `{dir}/{timestamp}_{seq}_{provider}.glb`
/// and return its path.
pub async fn persist_model_payload(
    dir: &Path,
    provider: &str,
    payload: &[u8],
) -> Result<PathBuf, std::io::Error> {
    tokio::fs::create_dir_all(dir).await?;

    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let seq = PERSIST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let filename = format!("{ts}_{seq}_{}.glb", sanitize_provider_name(provider));
    let path = dir.join(&filename);

    // Temp file + rename so readers never see a partial file.
    let tmp_path = path.with_extension("tmp");
    tokio::fs::write(&tmp_path, payload).await?;
    if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }

    Ok(path)
}
