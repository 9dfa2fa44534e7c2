use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::orchestrator::AttemptStatus;

/// One push-style progress event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationProgress {
    pub percent: u8,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

pub type ProgressCallback = Arc<dyn Fn(&GenerationProgress) + Send + Sync>;

/// Callback that drops every event.
pub fn noop() -> ProgressCallback {
    Arc::new(|_| {})
}

/// Progress handle given to one provider attempt.
///
/// Percent is clamped to 100 and never moves backwards within a reporter.
/// Each provider gets a fresh reporter via [`ProgressReporter::for_provider`],
/// so a provider switch may restart at a lower percent.
#[derive(Clone)]
pub struct ProgressReporter {
    callback: ProgressCallback,
    provider: Option<String>,
    last: Arc<AtomicU8>,
    phase: Arc<Mutex<AttemptStatus>>,
}

impl ProgressReporter {
    pub fn new(callback: ProgressCallback) -> Self {
        Self {
            callback,
            provider: None,
            last: Arc::new(AtomicU8::new(0)),
            phase: Arc::new(Mutex::new(AttemptStatus::Pending)),
        }
    }

    pub fn for_provider(&self, provider: &str) -> Self {
        Self {
            callback: self.callback.clone(),
            provider: Some(provider.to_string()),
            last: Arc::new(AtomicU8::new(0)),
            phase: Arc::new(Mutex::new(AttemptStatus::Pending)),
        }
    }

    pub fn report(&self, percent: u8, message: impl Into<String>) {
        let requested = percent.min(100);
        let previous = self.last.fetch_max(requested, Ordering::Relaxed);
        let event = GenerationProgress {
            percent: previous.max(requested),
            message: message.into(),
            provider: self.provider.clone(),
        };
        (self.callback)(&event);
    }

    pub fn last_percent(&self) -> u8 {
        self.last.load(Ordering::Relaxed)
    }

    /// Record the non-terminal phase the attempt has reached.
    pub fn enter(&self, status: AttemptStatus) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    pub fn phase(&self) -> AttemptStatus {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Linear position of `done / total` inside `[low, high]`.
pub fn scale(low: u8, high: u8, done: u32, total: u32) -> u8 {
    if total == 0 || high <= low {
        return low;
    }
    let span = u32::from(high - low);
    let step = span * done.min(total) / total;
    low + step as u8
}
