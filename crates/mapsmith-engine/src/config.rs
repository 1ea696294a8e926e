use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use mapsmith_contracts::events::EventWriter;
use mapsmith_contracts::models::{ModelRegistry, ModelSelector};
use mapsmith_contracts::{MapCacheStore, MapKind};

use crate::coordinator::GenerationCoordinator;
use crate::error::MapError;
use crate::remote::{GeminiImageClient, RemoteModelProvider, DEFAULT_GEMINI_API_BASE};
use crate::validator::MapValidator;
use crate::worker::{LocalWorkerProvider, ProcessWorker};

pub const DEFAULT_CACHE_DIR: &str = ".mapsmith/cache";
pub const DEFAULT_WORKER_COMMAND: &str = "python3 scripts/generate_maps.py";
pub const DEFAULT_MAX_MEGAPIXELS: f64 = 1.0;
pub const DEFAULT_MAPS: &str = "depth,edges,segmentation,faceMask,handsMask";
pub const DEFAULT_REMOTE_TIMEOUT_S: f64 = 180.0;
pub const DEFAULT_RETRY_BACKOFF_S: f64 = 1.2;

const EVENTS_FILE: &str = "events.jsonl";

/// Process-level settings, read once from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub cache_dir: PathBuf,
    pub worker_command: String,
    pub max_megapixels: f64,
    pub enabled_maps: Vec<MapKind>,
    pub remote_timeout: Duration,
    pub retry_backoff: Duration,
    pub gemini_api_base: String,
    pub gemini_api_key: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            worker_command: DEFAULT_WORKER_COMMAND.to_string(),
            max_megapixels: DEFAULT_MAX_MEGAPIXELS,
            enabled_maps: MapKind::parse_csv(DEFAULT_MAPS).unwrap_or_default(),
            remote_timeout: Duration::from_secs_f64(DEFAULT_REMOTE_TIMEOUT_S),
            retry_backoff: Duration::from_secs_f64(DEFAULT_RETRY_BACKOFF_S),
            gemini_api_base: DEFAULT_GEMINI_API_BASE.to_string(),
            gemini_api_key: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, MapError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, MapError> {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();

        let enabled_maps = match get("MAPSMITH_MAPS") {
            Some(raw) => MapKind::parse_csv(&raw)
                .map_err(|reason| MapError::InvalidInput(format!("MAPSMITH_MAPS: {reason}")))?,
            None => defaults.enabled_maps,
        };
        if enabled_maps.is_empty() {
            return Err(MapError::InvalidInput(
                "MAPSMITH_MAPS must name at least one map kind".to_string(),
            ));
        }

        Ok(Self {
            cache_dir: get("MAPSMITH_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),
            worker_command: get("MAPSMITH_WORKER_CMD").unwrap_or(defaults.worker_command),
            max_megapixels: positive_number(&get, "MAPSMITH_MAX_MEGAPIXELS")?
                .unwrap_or(defaults.max_megapixels),
            enabled_maps,
            remote_timeout: seconds(
                "MAPSMITH_REMOTE_TIMEOUT_S",
                positive_number(&get, "MAPSMITH_REMOTE_TIMEOUT_S")?,
            )?
            .unwrap_or(defaults.remote_timeout),
            retry_backoff: seconds(
                "MAPSMITH_RETRY_BACKOFF_S",
                non_negative_number(&get, "MAPSMITH_RETRY_BACKOFF_S")?,
            )?
            .unwrap_or(defaults.retry_backoff),
            gemini_api_base: get("GEMINI_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or(defaults.gemini_api_base),
            gemini_api_key: get("GEMINI_API_KEY").or_else(|| get("GOOGLE_API_KEY")),
        })
    }

    pub fn events_path(&self) -> PathBuf {
        self.cache_dir.join(EVENTS_FILE)
    }

    /// Wires the worker, remote client, cache store, and event log into a
    /// coordinator serving both providers.
    pub fn build_coordinator(&self) -> Result<GenerationCoordinator, MapError> {
        let runner = ProcessWorker::from_command_line(&self.worker_command)?;
        let local = Arc::new(LocalWorkerProvider::new(
            Arc::new(runner),
            self.enabled_maps.clone(),
            self.max_megapixels,
        ));
        let client = GeminiImageClient::new(
            &self.gemini_api_base,
            self.gemini_api_key.clone(),
            self.remote_timeout,
        );
        let remote = RemoteModelProvider::new(
            Arc::new(client),
            local.clone(),
            MapValidator::default(),
            ModelRegistry::new(None),
            self.retry_backoff,
        );

        Ok(GenerationCoordinator::new(
            MapCacheStore::new(&self.cache_dir),
            ModelSelector::new(None),
        )
        .with_provider(local)
        .with_provider(Arc::new(remote))
        .with_events(EventWriter::new(self.events_path())))
    }
}

fn number(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<f64>, MapError> {
    let Some(raw) = get(key) else {
        return Ok(None);
    };
    let value: f64 = raw
        .parse()
        .map_err(|_| MapError::InvalidInput(format!("{key} must be a number, got '{raw}'")))?;
    if !value.is_finite() {
        return Err(MapError::InvalidInput(format!("{key} must be finite")));
    }
    Ok(Some(value))
}

fn positive_number(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<f64>, MapError> {
    match number(get, key)? {
        Some(value) if value <= 0.0 => Err(MapError::InvalidInput(format!(
            "{key} must be greater than zero"
        ))),
        other => Ok(other),
    }
}

fn non_negative_number(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<f64>, MapError> {
    match number(get, key)? {
        Some(value) if value < 0.0 => Err(MapError::InvalidInput(format!(
            "{key} must not be negative"
        ))),
        other => Ok(other),
    }
}

fn seconds(key: &str, value: Option<f64>) -> Result<Option<Duration>, MapError> {
    value
        .map(|secs| {
            Duration::try_from_secs_f64(secs)
                .map_err(|err| MapError::InvalidInput(format!("{key}: {err}")))
        })
        .transpose()
}
