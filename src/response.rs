use serde::Serialize;

use crate::error::GenerationError;
use crate::orchestrator::{GenerationOutcome, ProviderAttempt};

/// Success body for `/generate` and its alias.
/// The web client reads `modelUrl`; the rest is diagnostic.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    pub model_url: String,
    pub produced_by: String,
    pub attempts: Vec<ProviderAttempt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_error: Option<String>,
    pub elapsed_ms: u64,
}

impl From<GenerationOutcome> for GenerateResponse {
    fn from(outcome: GenerationOutcome) -> Self {
        Self {
            model_url: outcome.result.model_reference,
            produced_by: outcome.result.produced_by,
            attempts: outcome.attempts,
            image_error: outcome.image_error,
            elapsed_ms: outcome.elapsed_ms,
        }
    }
}

/// Error body: a short headline plus sanitized details.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub details: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: details.into(),
        }
    }

    pub fn from_error(err: &GenerationError) -> Self {
        let headline = match err {
            GenerationError::InvalidRequest(_) => "Invalid request",
            GenerationError::Cancelled => "Generation cancelled",
            _ => "Failed to generate 3D model",
        };
        Self::new(headline, err.user_message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::GenerationResult;

    #[test]
    fn generate_response_uses_camel_case_keys() {
        let outcome = GenerationOutcome {
            result: GenerationResult {
                model_reference: "/models/fallback/cube.glb".to_string(),
                produced_by: "procedural".to_string(),
            },
            attempts: vec![],
            image_error: None,
            elapsed_ms: 3,
        };
        let json = serde_json::to_value(GenerateResponse::from(outcome)).unwrap();
        assert_eq!(json["modelUrl"], "/models/fallback/cube.glb");
        assert_eq!(json["producedBy"], "procedural");
        assert!(json["attempts"].as_array().unwrap().is_empty());
        assert!(json.get("imageError").is_none());
    }

    #[test]
    fn invalid_request_headline() {
        let err = GenerationError::InvalidRequest("A text prompt or an image URL is required.".into());
        let body = ErrorBody::from_error(&err);
        assert_eq!(body.error, "Invalid request");
        assert_eq!(body.details, "A text prompt or an image URL is required.");
    }
}
