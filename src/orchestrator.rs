use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::dispatch::registry::Registry;
use crate::dispatch::{ImageRef, InputKind, ProviderRequest};
use crate::error::GenerationError;
use crate::fallback::ProceduralFallback;
use crate::image_source::ImageSource;
use crate::progress::{self, ProgressCallback, ProgressReporter};

/// Slack added to a provider's budget before the orchestrator cuts it off.
/// Adapters enforce the budget themselves; this only catches ones that don't.
const OUTER_TIMEOUT_GRACE: Duration = Duration::from_secs(1);

/// A prompt, an image, or both.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: Option<String>,
    pub source_image: Option<ImageRef>,
    /// Why a caller-supplied image was dropped before the run.
    pub image_error: Option<String>,
}

impl GenerationRequest {
    /// Blank prompts are treated as absent.
    pub fn new(prompt: Option<String>, source_image: Option<ImageRef>) -> Self {
        Self {
            prompt: prompt
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty()),
            source_image,
            image_error: None,
        }
    }

    pub fn with_image_error(mut self, image_error: Option<String>) -> Self {
        self.image_error = image_error;
        self
    }

    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self::new(Some(prompt.into()), None)
    }

    pub fn validate(&self) -> Result<(), GenerationError> {
        if self.prompt.is_none() && self.source_image.is_none() {
            return Err(GenerationError::InvalidRequest(
                "A text prompt or an image URL is required.".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationResult {
    pub model_reference: String,
    /// Provider id, or `"procedural"` for the fallback.
    pub produced_by: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    #[default]
    Pending,
    Submitted,
    Polling,
    Succeeded,
    Failed,
    TimedOut,
    /// Required input (image or prompt) was not available.
    Skipped,
}

/// History entry for one provider try.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderAttempt {
    pub provider: String,
    pub started_at_ms: u64,
    pub status: AttemptStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    pub latency_ms: u64,
}

/// Result of one run plus its diagnostic history.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationOutcome {
    pub result: GenerationResult,
    pub attempts: Vec<ProviderAttempt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_error: Option<String>,
    pub elapsed_ms: u64,
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Sequential provider chain with an unconditional procedural fallback.
///
/// Unlike a fan-out, providers are tried one at a time in priority order:
/// - the first success is returned and no later provider is called
/// - every provider error is recorded and downgraded to "try the next one"
/// - when the list is exhausted the keyword fallback produces the result
///
/// Runs share nothing mutable, so one orchestrator serves concurrent requests.
pub struct Orchestrator {
    registry: Arc<Registry>,
    images: Arc<ImageSource>,
    fallback: ProceduralFallback,
}

impl Orchestrator {
    pub fn new(registry: Arc<Registry>, images: Arc<ImageSource>, fallback: ProceduralFallback) -> Self {
        Self {
            registry,
            images,
            fallback,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, GenerationError> {
        let registry = Arc::new(Registry::from_config(config)?);
        let images = Arc::new(ImageSource::from_config(&config.image)?);
        let fallback = ProceduralFallback::new(&config.pipeline.fallback_base);
        Ok(Self::new(registry, images, fallback))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn images(&self) -> &ImageSource {
        &self.images
    }

    /// Run the chain. Only `InvalidRequest` can fail.
    pub async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationResult, GenerationError> {
        self.run(request, progress::noop(), None)
            .await
            .map(|outcome| outcome.result)
    }

    /// Run the chain, returning the attempt history alongside the result.
    ///
    /// With a cancellation token, the run stops with `Cancelled` at the next
    /// checkpoint: before starting a provider or before a poll tick.
    pub async fn run(
        &self,
        request: GenerationRequest,
        progress: ProgressCallback,
        cancel: Option<CancellationToken>,
    ) -> Result<GenerationOutcome, GenerationError> {
        let start = Instant::now();
        request.validate()?;

        let root = ProgressReporter::new(progress);
        let prompt = request.prompt;
        let mut attempts: Vec<ProviderAttempt> = Vec::new();
        let mut image_error = request.image_error;

        let image = match request.source_image {
            Some(supplied) => Some(self.images.resolve(prompt.as_deref(), Some(supplied)).await?),
            None if self.registry.any_needs_image() && prompt.is_some() => {
                root.report(5, "Generating input image...");
                match self.images.resolve(prompt.as_deref(), None).await {
                    Ok(image) => Some(image),
                    Err(e) => {
                        tracing::warn!(
                            provider = e.provider().unwrap_or("-"),
                            reason = e.reason(),
                            "image synthesis failed: {e}"
                        );
                        image_error = Some(match image_error.take() {
                            Some(earlier) => format!("{earlier}; {}", e.user_message()),
                            None => e.user_message(),
                        });
                        None
                    }
                }
            }
            None => None,
        };

        for adapter in self.registry.adapters() {
            if cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
                tracing::info!("generation cancelled between providers");
                return Err(GenerationError::Cancelled);
            }

            let provider = adapter.id().to_string();
            let started_at_ms = epoch_ms();

            let missing = match adapter.input() {
                InputKind::Image if image.is_none() => Some("no input image available"),
                InputKind::Prompt if prompt.is_none() => Some("no prompt available"),
                _ => None,
            };
            if let Some(missing) = missing {
                tracing::info!(provider = provider, "skipping provider: {missing}");
                attempts.push(ProviderAttempt {
                    provider,
                    started_at_ms,
                    status: AttemptStatus::Skipped,
                    last_error: Some(missing.to_string()),
                    reason: None,
                    latency_ms: 0,
                });
                continue;
            }

            let reporter = root.for_provider(&provider);
            reporter.report(10, format!("Trying {provider}..."));

            let budget = adapter.timeout();
            let provider_req = ProviderRequest {
                prompt: prompt.clone(),
                image: image.clone(),
                deadline: Instant::now() + budget,
                cancellation_token: cancel.clone(),
                progress: reporter.clone(),
            };

            let attempt_start = Instant::now();
            let outcome = tokio::time::timeout(
                budget + OUTER_TIMEOUT_GRACE,
                adapter.submit_and_await(&provider_req),
            )
            .await
            .unwrap_or_else(|_| {
                Err(GenerationError::TaskTimedOut {
                    provider: provider.clone(),
                    elapsed_ms: attempt_start.elapsed().as_millis() as u64,
                })
            });
            let latency_ms = attempt_start.elapsed().as_millis() as u64;

            match outcome {
                Ok(result) => {
                    reporter.report(100, "Model generated successfully!");
                    tracing::info!(
                        provider = provider,
                        latency_ms = latency_ms,
                        "model generated"
                    );
                    attempts.push(ProviderAttempt {
                        provider: provider.clone(),
                        started_at_ms,
                        status: AttemptStatus::Succeeded,
                        last_error: None,
                        reason: None,
                        latency_ms,
                    });
                    return Ok(GenerationOutcome {
                        result: GenerationResult {
                            model_reference: result.model_reference,
                            produced_by: provider,
                        },
                        attempts,
                        image_error,
                        elapsed_ms: start.elapsed().as_millis() as u64,
                    });
                }
                Err(GenerationError::Cancelled) => {
                    tracing::info!(provider = provider, "generation cancelled during provider");
                    return Err(GenerationError::Cancelled);
                }
                Err(e) => {
                    tracing::warn!(
                        provider = provider,
                        reason = e.reason(),
                        phase = ?reporter.phase(),
                        latency_ms = latency_ms,
                        "provider failed: {e}"
                    );
                    attempts.push(ProviderAttempt {
                        provider,
                        started_at_ms,
                        status: if e.is_timeout() {
                            AttemptStatus::TimedOut
                        } else {
                            AttemptStatus::Failed
                        },
                        last_error: Some(e.user_message()),
                        reason: Some(e.reason()),
                        latency_ms,
                    });
                }
            }
        }

        root.report(100, "Using procedural generation...");
        let result = self.fallback.generate(prompt.as_deref().unwrap_or_default());
        tracing::info!(
            reference = result.model_reference,
            attempts = attempts.len(),
            "all providers exhausted, using procedural fallback"
        );

        Ok(GenerationOutcome {
            result,
            attempts,
            image_error,
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
    }
}
