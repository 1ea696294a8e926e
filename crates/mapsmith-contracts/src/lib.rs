//! Shared data model and on-disk contracts for structural map generation.

pub mod cache;
pub mod events;
pub mod maps;
pub mod models;
pub mod providers;
pub mod settings;

pub use cache::MapCacheStore;
pub use maps::{GenerationAttempt, GenerationMeta, MapAsset, MapKind, MapPack};
pub use providers::{ProviderConfig, ProviderConfigInput, ProviderKind};
pub use settings::{MapInfluence, MapSettings};
