use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::ImageFormat;
use sha2::{Digest, Sha256};

use crate::error::MapError;

const FINGERPRINT_HEX_CHARS: usize = 16;

/// First 16 hex characters of the SHA-256 digest of `bytes`.
pub fn fingerprint(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut encoded = hex::encode(digest);
    encoded.truncate(FINGERPRINT_HEX_CHARS);
    encoded
}

/// An input photograph whose container format has been recognised.
#[derive(Debug, Clone, PartialEq)]
pub struct ImagePayload {
    bytes: Vec<u8>,
    format: ImageFormat,
}

impl ImagePayload {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, MapError> {
        if bytes.is_empty() {
            return Err(MapError::InvalidInput("image payload is empty".to_string()));
        }
        let format = image::guess_format(&bytes).map_err(|_| {
            MapError::InvalidInput("payload is not a recognised image format".to_string())
        })?;
        Ok(Self { bytes, format })
    }

    /// Accepts `data:image/<type>;base64,<payload>`.
    pub fn from_data_url(url: &str) -> Result<Self, MapError> {
        let trimmed = url.trim();
        let Some(rest) = trimmed.strip_prefix("data:") else {
            return Err(MapError::InvalidInput(
                "expected a data: URL".to_string(),
            ));
        };
        let Some((header, payload)) = rest.split_once(',') else {
            return Err(MapError::InvalidInput(
                "data URL has no payload separator".to_string(),
            ));
        };
        let mut parts = header.split(';');
        let mime = parts.next().unwrap_or_default().trim();
        if !mime.to_ascii_lowercase().starts_with("image/") {
            return Err(MapError::InvalidInput(format!(
                "data URL media type '{mime}' is not an image"
            )));
        }
        if !parts.any(|part| part.trim().eq_ignore_ascii_case("base64")) {
            return Err(MapError::InvalidInput(
                "data URL payload is not base64 encoded".to_string(),
            ));
        }
        let compact: String = payload.chars().filter(|ch| !ch.is_whitespace()).collect();
        let bytes = BASE64
            .decode(compact.as_bytes())
            .map_err(|err| MapError::InvalidInput(format!("data URL base64 is invalid: {err}")))?;
        Self::from_bytes(bytes)
    }

    /// Data URLs are decoded; anything else is taken as bare base64.
    pub fn parse(input: &str) -> Result<Self, MapError> {
        let trimmed = input.trim();
        if trimmed.starts_with("data:") {
            return Self::from_data_url(trimmed);
        }
        let compact: String = trimmed.chars().filter(|ch| !ch.is_whitespace()).collect();
        let bytes = BASE64
            .decode(compact.as_bytes())
            .map_err(|err| MapError::InvalidInput(format!("image base64 is invalid: {err}")))?;
        Self::from_bytes(bytes)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn extension(&self) -> &'static str {
        self.format.extensions_str().first().copied().unwrap_or("img")
    }

    pub fn mime_type(&self) -> &'static str {
        self.format.to_mime_type()
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.bytes)
    }
}
