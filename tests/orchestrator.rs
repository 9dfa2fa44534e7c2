//! Tests for the sequential provider chain: ordering, short-circuiting,
//! skipping, image synthesis, progress, timeouts and cancellation.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::{PNG_BYTES, recording_progress};
use meshforge::dispatch::registry::Registry;
use meshforge::dispatch::{ImageRef, InputKind, ProviderAdapter, ProviderRequest, ProviderResult};
use meshforge::error::GenerationError;
use meshforge::fallback::{PROCEDURAL, ProceduralFallback};
use meshforge::image_source::{ImageSource, ImageSynthesizer};
use meshforge::orchestrator::{AttemptStatus, GenerationRequest, Orchestrator};
use meshforge::progress;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

enum Behavior {
    Succeed(&'static str),
    Fail,
    Hang,
    CancelThenFail(CancellationToken),
}

struct ScriptedAdapter {
    id: &'static str,
    input: InputKind,
    behavior: Behavior,
    calls: Arc<AtomicUsize>,
}

impl ScriptedAdapter {
    fn new(
        id: &'static str,
        input: InputKind,
        behavior: Behavior,
    ) -> (Arc<dyn ProviderAdapter>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let adapter: Arc<dyn ProviderAdapter> = Arc::new(Self {
            id,
            input,
            behavior,
            calls: calls.clone(),
        });
        (adapter, calls)
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn id(&self) -> &str {
        self.id
    }

    fn input(&self) -> InputKind {
        self.input
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(50)
    }

    async fn submit_and_await(
        &self,
        req: &ProviderRequest,
    ) -> Result<ProviderResult, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        req.progress.report(50, "working");
        match &self.behavior {
            Behavior::Succeed(reference) => Ok(ProviderResult {
                model_reference: reference.to_string(),
                provider: self.id.to_string(),
                latency_ms: 1,
            }),
            Behavior::Fail => Err(GenerationError::TaskFailed {
                provider: self.id.to_string(),
                message: "remote said no".to_string(),
            }),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                unreachable!("outer timeout should have fired")
            }
            Behavior::CancelThenFail(token) => {
                token.cancel();
                Err(GenerationError::Upstream {
                    provider: self.id.to_string(),
                    message: "boom".to_string(),
                    status: Some(500),
                })
            }
        }
    }
}

struct CountingSynthesizer {
    calls: Arc<AtomicUsize>,
    succeed: bool,
}

#[async_trait]
impl ImageSynthesizer for CountingSynthesizer {
    fn name(&self) -> &str {
        "test-images"
    }

    async fn synthesize(&self, _prompt: &str) -> Result<ImageRef, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.succeed {
            Ok(ImageRef::inline(PNG_BYTES, "image/png"))
        } else {
            Err(GenerationError::Upstream {
                provider: "test-images".to_string(),
                message: "model loading".to_string(),
                status: Some(503),
            })
        }
    }
}

fn synthesizer(succeed: bool) -> (ImageSource, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let source = ImageSource::new(Some(Box::new(CountingSynthesizer {
        calls: calls.clone(),
        succeed,
    })));
    (source, calls)
}

fn orchestrator(adapters: Vec<Arc<dyn ProviderAdapter>>, images: ImageSource) -> Orchestrator {
    Orchestrator::new(
        Arc::new(Registry::from_adapters(adapters)),
        Arc::new(images),
        ProceduralFallback::default(),
    )
}

fn supplied_image() -> Option<ImageRef> {
    Some(ImageRef::Url("https://img.example/chair.png".to_string()))
}

// ---------------------------------------------------------------------------
// Ordering and short-circuit
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_success_wins_and_later_providers_are_not_called() {
    let (a, a_calls) = ScriptedAdapter::new("a", InputKind::Image, Behavior::Fail);
    let (b, b_calls) = ScriptedAdapter::new("b", InputKind::Image, Behavior::Succeed("https://b/m.glb"));
    let (c, c_calls) = ScriptedAdapter::new("c", InputKind::Image, Behavior::Succeed("https://c/m.glb"));
    let orch = orchestrator(vec![a, b, c], ImageSource::disabled());

    let outcome = assert_ok!(
        orch.run(
            GenerationRequest::new(Some("a chair".into()), supplied_image()),
            progress::noop(),
            None,
        )
        .await
    );

    assert_eq!(outcome.result.model_reference, "https://b/m.glb");
    assert_eq!(outcome.result.produced_by, "b");
    assert_eq!(a_calls.load(Ordering::SeqCst), 1);
    assert_eq!(b_calls.load(Ordering::SeqCst), 1);
    assert_eq!(c_calls.load(Ordering::SeqCst), 0);

    let statuses: Vec<_> = outcome.attempts.iter().map(|a| a.status).collect();
    assert_eq!(statuses, vec![AttemptStatus::Failed, AttemptStatus::Succeeded]);
    assert_eq!(outcome.attempts[0].reason, Some("task_failed"));
}

#[tokio::test]
async fn all_failures_fall_back_to_procedural_shape() {
    let (a, _) = ScriptedAdapter::new("a", InputKind::Image, Behavior::Fail);
    let (b, _) = ScriptedAdapter::new("b", InputKind::Prompt, Behavior::Fail);
    let orch = orchestrator(vec![a, b], ImageSource::disabled());

    let result = assert_ok!(
        orch.generate(GenerationRequest::new(Some("a red donut".into()), supplied_image()))
            .await
    );

    assert_eq!(result.produced_by, PROCEDURAL);
    assert_eq!(result.model_reference, "/models/fallback/torus.glb");
}

#[tokio::test]
async fn empty_registry_goes_straight_to_fallback() {
    let orch = orchestrator(Vec::new(), ImageSource::disabled());
    let result = assert_ok!(orch.generate(GenerationRequest::from_prompt("something random")).await);
    assert_eq!(result.model_reference, "/models/fallback/cube.glb");
    assert_eq!(result.produced_by, PROCEDURAL);
}

#[tokio::test]
async fn missing_prompt_and_image_is_invalid_request() {
    let (a, a_calls) = ScriptedAdapter::new("a", InputKind::Prompt, Behavior::Succeed("x"));
    let (images, synth_calls) = synthesizer(true);
    let orch = orchestrator(vec![a], images);

    let err = assert_err!(orch.generate(GenerationRequest::new(Some("   ".into()), None)).await);

    assert!(matches!(err, GenerationError::InvalidRequest(_)), "{err:?}");
    assert_eq!(a_calls.load(Ordering::SeqCst), 0);
    assert_eq!(synth_calls.load(Ordering::SeqCst), 0);
}

// ---------------------------------------------------------------------------
// Image synthesis and skipping
// ---------------------------------------------------------------------------

#[tokio::test]
async fn supplied_image_skips_synthesis() {
    let (a, _) = ScriptedAdapter::new("a", InputKind::Image, Behavior::Succeed("https://a/m.glb"));
    let (images, synth_calls) = synthesizer(true);
    let orch = orchestrator(vec![a], images);

    assert_ok!(
        orch.generate(GenerationRequest::new(Some("a chair".into()), supplied_image()))
            .await
    );
    assert_eq!(synth_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn text_only_request_synthesizes_once() {
    let (a, _) = ScriptedAdapter::new("a", InputKind::Image, Behavior::Fail);
    let (b, _) = ScriptedAdapter::new("b", InputKind::Image, Behavior::Succeed("https://b/m.glb"));
    let (images, synth_calls) = synthesizer(true);
    let orch = orchestrator(vec![a, b], images);

    let result = assert_ok!(orch.generate(GenerationRequest::from_prompt("a chair")).await);
    assert_eq!(result.produced_by, "b");
    assert_eq!(synth_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn prompt_only_chain_never_synthesizes() {
    let (a, _) = ScriptedAdapter::new("a", InputKind::Prompt, Behavior::Succeed("https://a/m.glb"));
    let (images, synth_calls) = synthesizer(true);
    let orch = orchestrator(vec![a], images);

    assert_ok!(orch.generate(GenerationRequest::from_prompt("a chair")).await);
    assert_eq!(synth_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn image_providers_are_skipped_when_synthesis_fails() {
    let (img, img_calls) = ScriptedAdapter::new("img", InputKind::Image, Behavior::Succeed("never"));
    let (txt, txt_calls) = ScriptedAdapter::new("txt", InputKind::Prompt, Behavior::Succeed("https://txt/m.glb"));
    let (images, synth_calls) = synthesizer(false);
    let orch = orchestrator(vec![img, txt], images);

    let outcome = assert_ok!(
        orch.run(GenerationRequest::from_prompt("a chair"), progress::noop(), None)
            .await
    );

    assert_eq!(synth_calls.load(Ordering::SeqCst), 1);
    assert_eq!(img_calls.load(Ordering::SeqCst), 0);
    assert_eq!(txt_calls.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.result.produced_by, "txt");
    assert_eq!(outcome.attempts[0].status, AttemptStatus::Skipped);
    assert!(outcome.image_error.is_some());
}

#[tokio::test]
async fn dropped_image_error_is_kept_alongside_synthesis_error() {
    let (img, _) = ScriptedAdapter::new("img", InputKind::Image, Behavior::Succeed("never"));
    let (images, synth_calls) = synthesizer(false);
    let orch = orchestrator(vec![img], images);

    let request = GenerationRequest::from_prompt("a red donut")
        .with_image_error(Some("imageUrl ignored: bad scheme".to_string()));
    let outcome = assert_ok!(orch.run(request, progress::noop(), None).await);

    assert_eq!(synth_calls.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.result.produced_by, "procedural");
    let image_error = outcome.image_error.unwrap();
    assert!(image_error.starts_with("imageUrl ignored: bad scheme; "), "{image_error}");
}

#[tokio::test]
async fn image_only_request_skips_prompt_providers() {
    let (txt, txt_calls) = ScriptedAdapter::new("txt", InputKind::Prompt, Behavior::Succeed("never"));
    let orch = orchestrator(vec![txt], ImageSource::disabled());

    let outcome = assert_ok!(
        orch.run(GenerationRequest::new(None, supplied_image()), progress::noop(), None)
            .await
    );

    assert_eq!(txt_calls.load(Ordering::SeqCst), 0);
    assert_eq!(outcome.attempts[0].status, AttemptStatus::Skipped);
    // No prompt: the fallback uses its default shape.
    assert_eq!(outcome.result.model_reference, "/models/fallback/cube.glb");
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

#[tokio::test]
async fn progress_announces_each_provider_and_finishes_at_100() {
    let (a, _) = ScriptedAdapter::new("a", InputKind::Image, Behavior::Fail);
    let (b, _) = ScriptedAdapter::new("b", InputKind::Image, Behavior::Succeed("https://b/m.glb"));
    let orch = orchestrator(vec![a, b], ImageSource::disabled());
    let (callback, seen) = recording_progress();

    assert_ok!(
        orch.run(GenerationRequest::new(None, supplied_image()), callback, None)
            .await
    );

    let seen = seen.lock().unwrap();
    let trying: Vec<_> = seen
        .iter()
        .filter(|p| p.message.starts_with("Trying "))
        .map(|p| (p.provider.clone().unwrap(), p.percent))
        .collect();
    assert_eq!(trying, vec![("a".to_string(), 10), ("b".to_string(), 10)]);
    let last = seen.last().unwrap();
    assert_eq!(last.percent, 100);
    assert_eq!(last.provider.as_deref(), Some("b"));
    assert!(seen.iter().all(|p| p.percent <= 100));
}

#[tokio::test]
async fn fallback_reports_procedural_message() {
    let (a, _) = ScriptedAdapter::new("a", InputKind::Image, Behavior::Fail);
    let orch = orchestrator(vec![a], ImageSource::disabled());
    let (callback, seen) = recording_progress();

    assert_ok!(
        orch.run(GenerationRequest::new(Some("ball".into()), supplied_image()), callback, None)
            .await
    );

    let last = seen.lock().unwrap().last().cloned().unwrap();
    assert_eq!(last.percent, 100);
    assert_eq!(last.message, "Using procedural generation...");
    assert!(last.provider.is_none());
}

// ---------------------------------------------------------------------------
// Timeouts and cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn hanging_provider_is_timed_out_and_chain_continues() {
    let (slow, _) = ScriptedAdapter::new("slow", InputKind::Image, Behavior::Hang);
    let (ok, ok_calls) = ScriptedAdapter::new("ok", InputKind::Image, Behavior::Succeed("https://ok/m.glb"));
    let orch = orchestrator(vec![slow, ok], ImageSource::disabled());

    let outcome = assert_ok!(
        orch.run(GenerationRequest::new(None, supplied_image()), progress::noop(), None)
            .await
    );

    assert_eq!(outcome.attempts[0].status, AttemptStatus::TimedOut);
    assert_eq!(ok_calls.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.result.produced_by, "ok");
}

#[tokio::test]
async fn cancelled_token_stops_before_first_provider() {
    let (a, a_calls) = ScriptedAdapter::new("a", InputKind::Image, Behavior::Succeed("x"));
    let orch = orchestrator(vec![a], ImageSource::disabled());
    let token = CancellationToken::new();
    token.cancel();

    let err = assert_err!(
        orch.run(GenerationRequest::new(None, supplied_image()), progress::noop(), Some(token))
            .await
    );

    assert!(matches!(err, GenerationError::Cancelled));
    assert_eq!(a_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancellation_between_providers_stops_the_chain() {
    let token = CancellationToken::new();
    let (a, _) = ScriptedAdapter::new("a", InputKind::Image, Behavior::CancelThenFail(token.clone()));
    let (b, b_calls) = ScriptedAdapter::new("b", InputKind::Image, Behavior::Succeed("x"));
    let orch = orchestrator(vec![a, b], ImageSource::disabled());

    let err = assert_err!(
        orch.run(GenerationRequest::new(None, supplied_image()), progress::noop(), Some(token))
            .await
    );

    assert!(matches!(err, GenerationError::Cancelled));
    assert_eq!(b_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn concurrent_runs_are_independent() {
    let (a, a_calls) = ScriptedAdapter::new("a", InputKind::Prompt, Behavior::Succeed("https://a/m.glb"));
    let orch = Arc::new(orchestrator(vec![a], ImageSource::disabled()));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let orch = orch.clone();
            tokio::spawn(async move {
                orch.generate(GenerationRequest::from_prompt(format!("chair {i}")))
                    .await
            })
        })
        .collect();
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.produced_by, "a");
    }
    assert_eq!(a_calls.load(Ordering::SeqCst), 8);
}
