//! Map generation engine: fingerprinting, providers, validation, and the
//! coordinator that ties them to the cache.

use std::path::Path;

use mapsmith_contracts::{MapKind, MapPack, ProviderConfig, ProviderKind};

pub mod config;
pub mod coordinator;
pub mod diagnostics;
pub mod error;
pub mod fingerprint;
pub mod remote;
pub mod validator;
pub mod worker;

pub use config::EngineConfig;
pub use coordinator::GenerationCoordinator;
pub use error::MapError;
pub use fingerprint::{fingerprint, ImagePayload};
pub use remote::{GeminiImageClient, ImageModelClient, RemoteModelProvider};
pub use validator::{MapValidator, ValidationThresholds};
pub use worker::{LocalWorkerProvider, ProcessWorker, WorkerRunner};

/// `modelUsed` stamped on assets the local worker produced in place of a
/// rejected remote result.
pub const LOCAL_FALLBACK_MODEL: &str = "local-fallback";

#[derive(Debug, Clone, Copy)]
pub struct MapRequest<'a> {
    pub fingerprint: &'a str,
    pub image: &'a ImagePayload,
    /// Provider-owned cache directory; map files are written here.
    pub output_dir: &'a Path,
    pub config: &'a ProviderConfig,
}

pub trait MapProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;
    fn generate(&self, request: &MapRequest<'_>) -> Result<MapPack, MapError>;
}

pub fn max_dimension_for(max_megapixels: f64) -> u32 {
    let budget = if max_megapixels.is_finite() && max_megapixels > 0.0 {
        max_megapixels
    } else {
        config::DEFAULT_MAX_MEGAPIXELS
    };
    ((budget * 1e6).sqrt().round() as u32).max(1)
}

/// Source dimensions after fitting the longest edge into `max_dimension`.
///
/// Matches the worker's own downscale (truncating, aspect preserved) so packs
/// from either provider agree on size.
pub fn fit_within(width: u32, height: u32, max_dimension: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= max_dimension || longest == 0 {
        return (width, height);
    }
    let scale = f64::from(max_dimension) / f64::from(longest);
    let fitted_width = (f64::from(width) * scale) as u32;
    let fitted_height = (f64::from(height) * scale) as u32;
    (fitted_width.max(1), fitted_height.max(1))
}

pub(crate) fn kinds_label(kinds: &[MapKind]) -> String {
    MapKind::join_csv(kinds)
}
