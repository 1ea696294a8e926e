//! Cache-first, deduplicating front door for map generation.
//!
//! Per `(fingerprint, provider)` key the lifecycle is
//! `IDLE -> IN_FLIGHT -> {CACHED, FAILED}`. Only one generation per key runs
//! at a time; concurrent callers for the same key wait on it and receive the
//! same outcome. Failures are not remembered, so the next call retries.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use mapsmith_contracts::cache::is_valid_fingerprint;
use mapsmith_contracts::events::{EventPayload, EventWriter};
use mapsmith_contracts::models::ModelSelector;
use mapsmith_contracts::{
    MapCacheStore, MapPack, MapSettings, ProviderConfig, ProviderConfigInput, ProviderKind,
};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::MapError;
use crate::fingerprint::ImagePayload;
use crate::{MapProvider, MapRequest};

type InFlightKey = (String, ProviderKind);
type Outcome = Result<MapPack, MapError>;

/// One running generation. Followers block on `ready` until the leader
/// settles an outcome.
#[derive(Default)]
struct InFlightSlot {
    outcome: Mutex<Option<Outcome>>,
    ready: Condvar,
}

impl InFlightSlot {
    fn settle(&self, outcome: Outcome) {
        let mut slot = lock_ignoring_poison(&self.outcome);
        if slot.is_none() {
            *slot = Some(outcome);
        }
        self.ready.notify_all();
    }

    fn wait(&self) -> Outcome {
        let mut slot = lock_ignoring_poison(&self.outcome);
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            slot = match self.ready.wait(slot) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }
}

/// Removes the in-flight entry and wakes followers on every exit path,
/// including a panicking provider.
struct LeaderGuard<'a> {
    in_flight: &'a Mutex<HashMap<InFlightKey, Arc<InFlightSlot>>>,
    key: InFlightKey,
    slot: Arc<InFlightSlot>,
    outcome: Option<Outcome>,
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        lock_ignoring_poison(self.in_flight).remove(&self.key);
        let outcome = self.outcome.take().unwrap_or_else(|| {
            Err(MapError::CacheStoreFailure(
                "generation aborted before a pack was stored".to_string(),
            ))
        });
        self.slot.settle(outcome);
    }
}

enum Role {
    Leader(Arc<InFlightSlot>),
    Follower(Arc<InFlightSlot>),
}

pub struct GenerationCoordinator {
    store: MapCacheStore,
    providers: BTreeMap<ProviderKind, Arc<dyn MapProvider>>,
    selector: ModelSelector,
    events: Option<EventWriter>,
    in_flight: Mutex<HashMap<InFlightKey, Arc<InFlightSlot>>>,
}

impl GenerationCoordinator {
    pub fn new(store: MapCacheStore, selector: ModelSelector) -> Self {
        Self {
            store,
            providers: BTreeMap::new(),
            selector,
            events: None,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn MapProvider>) -> Self {
        self.providers.insert(provider.kind(), provider);
        self
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn store(&self) -> &MapCacheStore {
        &self.store
    }

    pub fn ensure_bytes(
        &self,
        bytes: Vec<u8>,
        input: &ProviderConfigInput,
    ) -> Result<MapPack, MapError> {
        let image = ImagePayload::from_bytes(bytes)?;
        self.ensure(&image, input)
    }

    /// Returns the cached pack for this image and provider, generating it
    /// first if needed.
    pub fn ensure(
        &self,
        image: &ImagePayload,
        input: &ProviderConfigInput,
    ) -> Result<MapPack, MapError> {
        let normalized = ProviderConfig::normalize(input, &self.selector);
        for warning in &normalized.warnings {
            tracing::warn!(%warning, "provider config adjusted");
        }
        let config = normalized.config;
        let fingerprint = image.fingerprint();
        let Some(provider) = self.providers.get(&config.provider).cloned() else {
            return Err(MapError::InvalidInput(format!(
                "map provider '{}' is not configured",
                config.provider
            )));
        };

        if let Some(pack) = self.cached(&fingerprint, config.provider) {
            self.note_cache_hit(&pack);
            return Ok(pack);
        }

        let key: InFlightKey = (fingerprint.clone(), config.provider);
        let role = {
            let mut in_flight = lock_ignoring_poison(&self.in_flight);
            if let Some(slot) = in_flight.get(&key) {
                Role::Follower(slot.clone())
            } else {
                let slot = Arc::new(InFlightSlot::default());
                in_flight.insert(key.clone(), slot.clone());
                Role::Leader(slot)
            }
        };

        match role {
            Role::Follower(slot) => {
                tracing::debug!(
                    fingerprint = %fingerprint,
                    provider = config.provider.as_str(),
                    "joining in-flight generation"
                );
                slot.wait()
            }
            Role::Leader(slot) => {
                let mut guard = LeaderGuard {
                    in_flight: &self.in_flight,
                    key,
                    slot,
                    outcome: None,
                };
                let outcome = self.lead(provider.as_ref(), &fingerprint, image, &config);
                guard.outcome = Some(outcome.clone());
                drop(guard);
                outcome
            }
        }
    }

    pub fn get_settings(&self, fingerprint: &str) -> Result<MapSettings, MapError> {
        ensure_fingerprint(fingerprint)?;
        Ok(self.store.get_settings(fingerprint))
    }

    /// Merges `partial` over the stored settings. Malformed documents are
    /// rejected before anything is written.
    pub fn update_settings(
        &self,
        fingerprint: &str,
        partial: &Value,
    ) -> Result<MapSettings, MapError> {
        ensure_fingerprint(fingerprint)?;
        self.store
            .get_settings(fingerprint)
            .merged(partial)
            .map_err(MapError::InvalidInput)?;
        self.store
            .update_settings(fingerprint, partial)
            .map_err(MapError::cache)
    }

    pub fn list_providers(&self, fingerprint: &str) -> Result<Vec<ProviderKind>, MapError> {
        ensure_fingerprint(fingerprint)?;
        Ok(self.store.list_providers(fingerprint))
    }

    fn cached(&self, fingerprint: &str, provider: ProviderKind) -> Option<MapPack> {
        self.store
            .read_pack(fingerprint, provider)
            .filter(MapPack::is_usable)
    }

    fn lead(
        &self,
        provider: &dyn MapProvider,
        fingerprint: &str,
        image: &ImagePayload,
        config: &ProviderConfig,
    ) -> Outcome {
        // The previous leader may have stored the pack after our first read.
        if let Some(pack) = self.cached(fingerprint, config.provider) {
            self.note_cache_hit(&pack);
            return Ok(pack);
        }
        self.generate(provider, fingerprint, image, config)
    }

    fn generate(
        &self,
        provider: &dyn MapProvider,
        fingerprint: &str,
        image: &ImagePayload,
        config: &ProviderConfig,
    ) -> Outcome {
        let run_id = Uuid::new_v4().to_string();
        tracing::info!(
            %fingerprint,
            provider = config.provider.as_str(),
            %run_id,
            "generating map pack"
        );
        self.emit(
            &run_id,
            "generation_started",
            json!({
                "fingerprint": fingerprint,
                "provider": config.provider,
                "model_id": config.model_id,
                "allow_fallback": config.allow_fallback,
                "max_retries": config.max_retries,
            }),
        );

        let outcome = self.generate_and_store(provider, fingerprint, image, config, &run_id);
        match &outcome {
            Ok(pack) => {
                tracing::info!(
                    %fingerprint,
                    provider = config.provider.as_str(),
                    maps = pack.maps.len(),
                    "map pack stored"
                );
                self.emit(
                    &run_id,
                    "generation_finished",
                    json!({
                        "fingerprint": fingerprint,
                        "provider": config.provider,
                        "maps": pack.kinds(),
                        "cost": pack.generation_meta.cost,
                        "request_id": pack.generation_meta.request_id,
                    }),
                );
            }
            Err(err) => {
                tracing::warn!(
                    %fingerprint,
                    provider = config.provider.as_str(),
                    code = err.code(),
                    error = %err,
                    "map generation failed"
                );
                self.emit(
                    &run_id,
                    "generation_failed",
                    json!({
                        "fingerprint": fingerprint,
                        "provider": config.provider,
                        "code": err.code(),
                        "error": err.to_string(),
                    }),
                );
            }
        }
        outcome
    }

    fn generate_and_store(
        &self,
        provider: &dyn MapProvider,
        fingerprint: &str,
        image: &ImagePayload,
        config: &ProviderConfig,
        run_id: &str,
    ) -> Outcome {
        let output_dir = self
            .store
            .prepare_provider_dir(fingerprint, config.provider)
            .map_err(MapError::cache)?;
        let pack = provider.generate(&MapRequest {
            fingerprint,
            image,
            output_dir: &output_dir,
            config,
        })?;
        for attempt in &pack.generation_meta.attempts {
            self.emit(
                run_id,
                "map_attempt",
                json!({
                    "fingerprint": fingerprint,
                    "kind": attempt.kind,
                    "provider": attempt.provider,
                    "ok": attempt.ok,
                    "error": attempt.error,
                    "used_fallback": attempt.used_fallback.unwrap_or(false),
                }),
            );
        }
        self.store.write_pack(&pack).map_err(MapError::cache)?;
        Ok(pack)
    }

    fn note_cache_hit(&self, pack: &MapPack) {
        tracing::debug!(
            fingerprint = %pack.source_hash,
            provider = pack.provider.as_str(),
            "map pack cache hit"
        );
        self.emit(
            &Uuid::new_v4().to_string(),
            "cache_hit",
            json!({
                "fingerprint": pack.source_hash,
                "provider": pack.provider,
                "maps": pack.kinds(),
            }),
        );
    }

    fn emit(&self, run_id: &str, event_type: &str, payload: Value) {
        let Some(events) = self.events.as_ref() else {
            return;
        };
        let payload: EventPayload = match payload {
            Value::Object(map) => map,
            _ => EventPayload::new(),
        };
        if let Err(err) = events.emit(run_id, event_type, payload) {
            tracing::warn!(event_type, error = %format!("{err:#}"), "failed to append event");
        }
    }
}

fn ensure_fingerprint(fingerprint: &str) -> Result<(), MapError> {
    if is_valid_fingerprint(fingerprint) {
        return Ok(());
    }
    Err(MapError::InvalidInput(format!(
        "'{fingerprint}' is not a valid fingerprint"
    )))
}

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
