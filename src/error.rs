use thiserror::Error;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("image synthesis failed via {provider}: {message}")]
    ImageSynthesisFailed { provider: String, message: String },

    #[error("provider {provider} unavailable: {message}")]
    ProviderUnavailable { provider: String, message: String },

    #[error("task failed for {provider}: {message}")]
    TaskFailed { provider: String, message: String },

    #[error("task for {provider} timed out after {elapsed_ms}ms")]
    TaskTimedOut { provider: String, elapsed_ms: u64 },

    #[error("no model reference in response from {provider}")]
    NoModelReference { provider: String },

    #[error("rate limited by {provider}")]
    RateLimited { provider: String },

    #[error("auth failed for {provider}: {message}")]
    AuthFailed { provider: String, message: String },

    #[error("upstream error from {provider}: {message}")]
    Upstream {
        provider: String,
        message: String,
        status: Option<u16>,
    },

    #[error("schema parse error: {0}")]
    SchemaParse(String),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("generation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl GenerationError {
    /// Extract provider name from structured error variants.
    /// Returns None for variants that don't carry provider context.
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::ImageSynthesisFailed { provider, .. } => Some(provider),
            Self::ProviderUnavailable { provider, .. } => Some(provider),
            Self::TaskFailed { provider, .. } => Some(provider),
            Self::TaskTimedOut { provider, .. } => Some(provider),
            Self::NoModelReference { provider } => Some(provider),
            Self::RateLimited { provider } => Some(provider),
            Self::AuthFailed { provider, .. } => Some(provider),
            Self::Upstream { provider, .. } => Some(provider),
            _ => None,
        }
    }

    /// Relabel a provider-carrying error with the configured provider id.
    /// API parsers only know their API name, not the entry they serve.
    pub fn with_provider(mut self, id: &str) -> Self {
        match &mut self {
            Self::ImageSynthesisFailed { provider, .. }
            | Self::ProviderUnavailable { provider, .. }
            | Self::TaskFailed { provider, .. }
            | Self::TaskTimedOut { provider, .. }
            | Self::NoModelReference { provider }
            | Self::RateLimited { provider }
            | Self::AuthFailed { provider, .. }
            | Self::Upstream { provider, .. } => *provider = id.to_string(),
            _ => {}
        }
        self
    }

    /// Stable snake_case tag recorded on attempt history and logs.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::ImageSynthesisFailed { .. } => "image_synthesis_failed",
            Self::ProviderUnavailable { .. } => "provider_unavailable",
            Self::TaskFailed { .. } => "task_failed",
            Self::TaskTimedOut { .. } => "task_timed_out",
            Self::NoModelReference { .. } => "no_model_reference",
            Self::RateLimited { .. } => "rate_limited",
            Self::AuthFailed { .. } => "auth_failed",
            Self::Upstream { .. } => "upstream",
            Self::SchemaParse(_) => "parse_error",
            Self::Request(_) => "request",
            Self::Io(_) => "io",
            Self::Cancelled => "cancelled",
            Self::Other(_) => "error",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TaskTimedOut { .. })
    }

    /// Map a transport error to the pipeline taxonomy, folding reqwest's own
    /// timeouts into `TaskTimedOut` so the attempt is recorded as timed out.
    pub fn from_transport(provider: &str, err: reqwest::Error, elapsed_ms: u64) -> Self {
        if err.is_timeout() {
            Self::TaskTimedOut {
                provider: provider.to_string(),
                elapsed_ms,
            }
        } else {
            Self::Request(err)
        }
    }

    /// Produce a sanitized error message safe for returning to HTTP clients.
    /// Does not leak internal URLs, credentials, or upstream error bodies.
    pub fn user_message(&self) -> String {
        match self {
            Self::InvalidRequest(msg) => msg.clone(),
            Self::ImageSynthesisFailed { provider, .. } => {
                format!("image synthesis failed via {provider}")
            }
            Self::ProviderUnavailable { provider, .. } => {
                format!("provider {provider} is not configured")
            }
            Self::TaskFailed { provider, message } => {
                format!("generation task failed for {provider}: {message}")
            }
            Self::TaskTimedOut {
                provider,
                elapsed_ms,
            } => format!("{provider} timed out after {elapsed_ms}ms"),
            Self::NoModelReference { provider } => {
                format!("{provider} returned no model reference")
            }
            Self::RateLimited { provider } => {
                format!("rate limited by {provider}, try again shortly")
            }
            Self::AuthFailed { provider, .. } => format!("authentication failed for {provider}"),
            Self::Upstream {
                provider, status, ..
            } => match status {
                Some(code) => format!("upstream error from {provider} (HTTP {code})"),
                None => format!("upstream error from {provider}"),
            },
            Self::SchemaParse(_) => "failed to parse provider response".to_string(),
            Self::Request(_) => "request to provider failed".to_string(),
            Self::Io(_) => "failed to store generated model".to_string(),
            Self::Cancelled => "generation cancelled".to_string(),
            Self::Other(msg) => msg.clone(),
        }
    }
}
