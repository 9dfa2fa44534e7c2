use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;

use crate::dispatch::ImageRef;
use crate::error::GenerationError;
use crate::orchestrator::GenerationRequest;

/// Body accepted by `/generate`, `/api/generate-3d` and `/generate/stream`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateBody {
    /// Text description of the object.
    pub prompt: Option<String>,
    /// `http(s)://` URL or `data:image/...;base64,` URL of a reference image.
    pub image_url: Option<String>,
}

impl GenerateBody {
    /// An unusable `imageUrl` is only fatal when there is no prompt to fall
    /// back on; otherwise it is dropped and reported as the image error.
    pub fn into_request(self) -> Result<GenerationRequest, GenerationError> {
        let has_prompt = self.prompt.as_deref().is_some_and(|p| !p.trim().is_empty());
        let mut image_error = None;
        let image = match self.image_url.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => match parse_image_url(raw) {
                Ok(image) => Some(image),
                Err(e) if has_prompt => {
                    tracing::warn!(reason = e.reason(), "ignoring unusable imageUrl: {e}");
                    image_error = Some(format!("imageUrl ignored: {}", e.user_message()));
                    None
                }
                Err(e) => return Err(e),
            },
        };
        let request = GenerationRequest::new(self.prompt, image).with_image_error(image_error);
        request.validate()?;
        Ok(request)
    }
}

/// Accepts remote URLs as-is and decodes base64 `data:` URLs in place.
pub fn parse_image_url(raw: &str) -> Result<ImageRef, GenerationError> {
    let lower = raw.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return Ok(ImageRef::Url(raw.to_string()));
    }

    let Some(rest) = raw.strip_prefix("data:") else {
        return Err(GenerationError::InvalidRequest(
            "imageUrl must be an http(s) URL or a data URL".to_string(),
        ));
    };
    let (meta, payload) = rest.split_once(',').ok_or_else(|| {
        GenerationError::InvalidRequest("malformed data URL".to_string())
    })?;
    let Some(mime) = meta.strip_suffix(";base64") else {
        return Err(GenerationError::InvalidRequest(
            "data URL must be base64-encoded".to_string(),
        ));
    };
    if !mime.starts_with("image/") {
        return Err(GenerationError::InvalidRequest(format!(
            "data URL is not an image: '{mime}'"
        )));
    }
    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| GenerationError::InvalidRequest(format!("invalid base64 image: {e}")))?;
    if bytes.is_empty() {
        return Err(GenerationError::InvalidRequest("empty image".to_string()));
    }
    Ok(ImageRef::inline(bytes, mime.to_string()))
}
