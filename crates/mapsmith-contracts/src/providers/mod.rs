use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::models::{ModelSelector, DEFAULT_REMOTE_MODEL, MAP_TRANSFORM};

pub const DEFAULT_MAX_RETRIES: u8 = 1;
pub const MAX_RETRIES_CEILING: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Local,
    Remote,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 2] = [ProviderKind::Local, ProviderKind::Remote];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Local => "local",
            ProviderKind::Remote => "remote",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(ProviderKind::Local),
            "remote" => Ok(ProviderKind::Remote),
            other => Err(format!("Unknown map provider '{other}'.")),
        }
    }
}

/// Caller-supplied provider options; every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfigInput {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub allow_fallback: Option<bool>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub max_retries: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub provider: ProviderKind,
    pub allow_fallback: bool,
    pub model_id: String,
    pub max_retries: u8,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Local,
            allow_fallback: true,
            model_id: DEFAULT_REMOTE_MODEL.to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Outcome of normalizing a [`ProviderConfigInput`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedConfig {
    pub config: ProviderConfig,
    pub warnings: Vec<String>,
}

impl ProviderConfig {
    /// Resolves caller input against the documented defaults.
    ///
    /// Unknown providers fall back to `local`, unknown models to the catalog
    /// default, and retries are clamped to `0..=5`. Each substitution is
    /// reported as a warning rather than an error.
    pub fn normalize(input: &ProviderConfigInput, selector: &ModelSelector) -> NormalizedConfig {
        let defaults = ProviderConfig::default();
        let mut warnings = Vec::new();

        let provider = match input.provider.as_deref().map(str::trim) {
            None | Some("") => defaults.provider,
            Some(raw) => raw.parse::<ProviderKind>().unwrap_or_else(|err| {
                warnings.push(format!("{err} Using '{}'.", defaults.provider));
                defaults.provider
            }),
        };

        let requested_model = input
            .model_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty());
        let model_id = match selector.select(requested_model, MAP_TRANSFORM) {
            Ok(selection) => {
                if requested_model.is_some() {
                    if let Some(reason) = selection.fallback_reason {
                        warnings.push(reason);
                    }
                }
                selection.model.name
            }
            Err(reason) => {
                warnings.push(reason);
                defaults.model_id
            }
        };

        let max_retries = match input.max_retries {
            None => defaults.max_retries,
            Some(raw) => {
                let clamped = raw.clamp(0, i64::from(MAX_RETRIES_CEILING));
                if clamped != raw {
                    warnings.push(format!("maxRetries {raw} clamped to {clamped}."));
                }
                clamped as u8
            }
        };

        NormalizedConfig {
            config: ProviderConfig {
                provider,
                allow_fallback: input.allow_fallback.unwrap_or(defaults.allow_fallback),
                model_id,
                max_retries,
            },
            warnings,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::models::ModelSelector;

    use super::{ProviderConfig, ProviderConfigInput, ProviderKind};

    #[test]
    fn empty_input_uses_documented_defaults() {
        let normalized =
            ProviderConfig::normalize(&ProviderConfigInput::default(), &ModelSelector::new(None));
        assert_eq!(normalized.config, ProviderConfig::default());
        assert!(normalized.warnings.is_empty());
        assert_eq!(normalized.config.provider, ProviderKind::Local);
        assert!(normalized.config.allow_fallback);
        assert_eq!(normalized.config.max_retries, 1);
    }

    #[test]
    fn retries_are_clamped_and_reported() {
        let input = ProviderConfigInput {
            provider: Some("REMOTE".to_string()),
            max_retries: Some(12),
            ..ProviderConfigInput::default()
        };
        let normalized = ProviderConfig::normalize(&input, &ModelSelector::new(None));
        assert_eq!(normalized.config.provider, ProviderKind::Remote);
        assert_eq!(normalized.config.max_retries, 5);
        assert_eq!(normalized.warnings, vec!["maxRetries 12 clamped to 5."]);

        let input = ProviderConfigInput {
            max_retries: Some(-3),
            ..ProviderConfigInput::default()
        };
        let normalized = ProviderConfig::normalize(&input, &ModelSelector::new(None));
        assert_eq!(normalized.config.max_retries, 0);
    }

    #[test]
    fn unknown_provider_and_model_fall_back() {
        let input = ProviderConfigInput {
            provider: Some("cloud".to_string()),
            model_id: Some("made-up-model".to_string()),
            allow_fallback: Some(false),
            max_retries: Some(2),
        };
        let normalized = ProviderConfig::normalize(&input, &ModelSelector::new(None));
        assert_eq!(normalized.config.provider, ProviderKind::Local);
        assert_eq!(normalized.config.model_id, "gemini-2.5-flash-image");
        assert!(!normalized.config.allow_fallback);
        assert_eq!(normalized.config.max_retries, 2);
        assert_eq!(normalized.warnings.len(), 2);
        assert!(normalized.warnings[1].contains("made-up-model"));
    }

    #[test]
    fn camel_case_input_deserializes() -> anyhow::Result<()> {
        let input: ProviderConfigInput = serde_json::from_str(
            r#"{"provider":"remote","allowFallback":false,"modelId":"gemini-3-pro-image-preview","maxRetries":3}"#,
        )?;
        let normalized = ProviderConfig::normalize(&input, &ModelSelector::new(None));
        assert_eq!(normalized.config.model_id, "gemini-3-pro-image-preview");
        assert!(normalized.warnings.is_empty());
        Ok(())
    }
}
