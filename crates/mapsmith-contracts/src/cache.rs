use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{bail, Context};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::events::now_utc_iso;
use crate::maps::MapPack;
use crate::providers::ProviderKind;
use crate::settings::MapSettings;

const PACK_FILE: &str = "pack.json";
const SETTINGS_FILE: &str = "settings.json";
const PROVIDERS_DIR: &str = "providers";

// Serialises settings read-merge-write cycles across every store in the process.
static SETTINGS_WRITE: Mutex<()> = Mutex::new(());

/// Filesystem cache of map packs and settings.
///
/// Layout:
///
/// ```text
/// {root}/{fingerprint}/settings.json
/// {root}/{fingerprint}/providers/{provider}/pack.json
/// {root}/{fingerprint}/providers/{provider}/<map files>
/// ```
///
/// Reads never fail: a missing or unreadable descriptor is a miss. Writes go
/// through a uniquely named temp file and a rename. Pack writes are not locked;
/// callers keep a single writer per `(fingerprint, provider)`. Settings updates
/// hold a process-wide lock around their read-merge-write.
#[derive(Debug, Clone)]
pub struct MapCacheStore {
    root: PathBuf,
}

impl MapCacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn fingerprint_dir(&self, fingerprint: &str) -> PathBuf {
        self.root.join(fingerprint)
    }

    pub fn provider_dir(&self, fingerprint: &str, provider: ProviderKind) -> PathBuf {
        self.fingerprint_dir(fingerprint)
            .join(PROVIDERS_DIR)
            .join(provider.as_str())
    }

    pub fn pack_path(&self, fingerprint: &str, provider: ProviderKind) -> PathBuf {
        self.provider_dir(fingerprint, provider).join(PACK_FILE)
    }

    pub fn settings_path(&self, fingerprint: &str) -> PathBuf {
        self.fingerprint_dir(fingerprint).join(SETTINGS_FILE)
    }

    /// Creates the provider directory a generation writes its map files into.
    pub fn prepare_provider_dir(
        &self,
        fingerprint: &str,
        provider: ProviderKind,
    ) -> anyhow::Result<PathBuf> {
        ensure_fingerprint(fingerprint)?;
        let dir = self.provider_dir(fingerprint, provider);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        Ok(dir)
    }

    pub fn read_pack(&self, fingerprint: &str, provider: ProviderKind) -> Option<MapPack> {
        if !is_valid_fingerprint(fingerprint) {
            return None;
        }
        let pack: MapPack = read_json(&self.pack_path(fingerprint, provider))?;
        if pack.source_hash != fingerprint || pack.provider != provider {
            tracing::warn!(
                fingerprint,
                provider = provider.as_str(),
                "ignoring pack descriptor keyed to a different source"
            );
            return None;
        }
        Some(pack)
    }

    pub fn write_pack(&self, pack: &MapPack) -> anyhow::Result<PathBuf> {
        ensure_fingerprint(&pack.source_hash)?;
        let path = self.pack_path(&pack.source_hash, pack.provider);
        write_json_atomic(&path, pack)?;
        Ok(path)
    }

    /// Providers whose stored pack would be served as a hit, in stable order.
    pub fn list_providers(&self, fingerprint: &str) -> Vec<ProviderKind> {
        ProviderKind::ALL
            .into_iter()
            .filter(|provider| {
                self.read_pack(fingerprint, *provider)
                    .is_some_and(|pack| pack.is_usable())
            })
            .collect()
    }

    /// Stored settings, or defaults when none (or only garbage) exist yet.
    pub fn get_settings(&self, fingerprint: &str) -> MapSettings {
        if !is_valid_fingerprint(fingerprint) {
            return MapSettings::default();
        }
        read_json::<MapSettings>(&self.settings_path(fingerprint))
            .map(MapSettings::with_defaults)
            .unwrap_or_default()
    }

    pub fn update_settings(
        &self,
        fingerprint: &str,
        partial: &Value,
    ) -> anyhow::Result<MapSettings> {
        ensure_fingerprint(fingerprint)?;
        let _guard = SETTINGS_WRITE.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.get_settings(fingerprint);
        let mut next = current
            .merged(partial)
            .map_err(|reason| anyhow::anyhow!(reason))?;
        next.updated_at = Some(now_utc_iso());
        write_json_atomic(&self.settings_path(fingerprint), &next)?;
        Ok(next)
    }
}

/// Fingerprints become directory names, so only plain alphanumerics pass.
pub fn is_valid_fingerprint(fingerprint: &str) -> bool {
    !fingerprint.is_empty()
        && fingerprint.len() <= 64
        && fingerprint.chars().all(|ch| ch.is_ascii_alphanumeric())
}

fn ensure_fingerprint(fingerprint: &str) -> anyhow::Result<()> {
    if !is_valid_fingerprint(fingerprint) {
        bail!("invalid fingerprint '{fingerprint}'");
    }
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "unreadable cache descriptor");
            None
        }
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, payload: &T) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("{} has no parent directory", path.display()))?;
    std::fs::create_dir_all(parent)?;
    let mut temp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create a temp file in {}", parent.display()))?;
    temp.write_all(serde_json::to_string_pretty(payload)?.as_bytes())
        .with_context(|| format!("failed to write {}", temp.path().display()))?;
    temp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("failed to move descriptor into {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::maps::{GenerationMeta, MapAsset, MapKind, MapPack};
    use crate::providers::ProviderKind;

    use super::MapCacheStore;

    const FP: &str = "0123456789abcdef";

    fn pack(provider: ProviderKind) -> MapPack {
        MapPack {
            source_hash: FP.to_string(),
            source_width: 8,
            source_height: 6,
            created_at: "2026-10-17T00:00:00+00:00".to_string(),
            provider,
            generation_meta: GenerationMeta::new(
                provider,
                "local-worker",
                "2026-10-17T00:00:00+00:00".to_string(),
            ),
            maps: vec![MapAsset {
                kind: MapKind::Edges,
                filename: "edges.png".to_string(),
                width: 8,
                height: 6,
                generated_at: "2026-10-17T00:00:00+00:00".to_string(),
                model_used: "canny-auto".to_string(),
            }],
            input_filename: "input.png".to_string(),
        }
    }

    #[test]
    fn pack_round_trips_through_disk() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = MapCacheStore::new(temp.path());
        let written = store.write_pack(&pack(ProviderKind::Local))?;

        assert_eq!(
            written,
            temp.path()
                .join(FP)
                .join("providers")
                .join("local")
                .join("pack.json")
        );
        assert_eq!(
            store.read_pack(FP, ProviderKind::Local),
            Some(pack(ProviderKind::Local))
        );
        assert_eq!(store.read_pack(FP, ProviderKind::Remote), None);
        Ok(())
    }

    #[test]
    fn corrupt_descriptor_reads_as_miss() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = MapCacheStore::new(temp.path());
        let dir = store.prepare_provider_dir(FP, ProviderKind::Remote)?;
        std::fs::write(dir.join("pack.json"), "{\"sourceHash\": ")?;
        assert_eq!(store.read_pack(FP, ProviderKind::Remote), None);

        std::fs::write(dir.join("pack.json"), "[1,2,3]")?;
        assert_eq!(store.read_pack(FP, ProviderKind::Remote), None);
        assert!(store.list_providers(FP).is_empty());
        Ok(())
    }

    #[test]
    fn descriptor_for_other_key_is_ignored() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = MapCacheStore::new(temp.path());
        let dir = store.prepare_provider_dir(FP, ProviderKind::Remote)?;
        std::fs::write(
            dir.join("pack.json"),
            serde_json::to_string(&pack(ProviderKind::Local))?,
        )?;
        assert_eq!(store.read_pack(FP, ProviderKind::Remote), None);
        Ok(())
    }

    #[test]
    fn list_providers_reports_each_cached_pack() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = MapCacheStore::new(temp.path());
        assert!(store.list_providers(FP).is_empty());

        store.write_pack(&pack(ProviderKind::Remote))?;
        assert_eq!(store.list_providers(FP), vec![ProviderKind::Remote]);

        store.write_pack(&pack(ProviderKind::Local))?;
        assert_eq!(
            store.list_providers(FP),
            vec![ProviderKind::Local, ProviderKind::Remote]
        );
        Ok(())
    }

    #[test]
    fn settings_exist_without_any_pack() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = MapCacheStore::new(temp.path());

        let defaults = store.get_settings(FP);
        assert!(defaults.updated_at.is_none());

        let updated = store.update_settings(
            FP,
            &json!({"maps": {"depth": {"enabled": false}}}),
        )?;
        assert!(!updated.influence(MapKind::Depth).enabled);
        assert!(updated.updated_at.is_some());
        assert!(store.settings_path(FP).exists());
        assert!(store.list_providers(FP).is_empty());

        let reread = store.get_settings(FP);
        assert_eq!(reread, updated);

        let again = store.update_settings(
            FP,
            &json!({"maps": {"edges": {"strength": 0.1}}}),
        )?;
        assert!(!again.influence(MapKind::Depth).enabled);
        assert_eq!(again.influence(MapKind::Edges).strength, 0.1);
        Ok(())
    }

    #[test]
    fn empty_pack_is_not_listed() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = MapCacheStore::new(temp.path());
        let mut empty = pack(ProviderKind::Local);
        empty.maps.clear();
        store.write_pack(&empty)?;

        assert!(store.read_pack(FP, ProviderKind::Local).is_some());
        assert!(store.list_providers(FP).is_empty());
        Ok(())
    }

    #[test]
    fn concurrent_settings_updates_keep_every_field() -> anyhow::Result<()> {
        const ROUNDS: u32 = 25;
        let temp = tempfile::tempdir()?;
        let store = MapCacheStore::new(temp.path());

        let failures: Vec<String> = std::thread::scope(|scope| {
            let handles: Vec<_> = MapKind::ALL
                .into_iter()
                .map(|kind| {
                    let store = store.clone();
                    scope.spawn(move || -> anyhow::Result<()> {
                        for round in 0..ROUNDS {
                            let strength = f64::from(round) / 100.0;
                            store.update_settings(
                                FP,
                                &json!({"maps": {kind.as_str(): {"strength": strength}}}),
                            )?;
                        }
                        Ok(())
                    })
                })
                .collect();
            handles
                .into_iter()
                .filter_map(|handle| match handle.join() {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(format!("{err:#}")),
                    Err(_) => Some("writer panicked".to_string()),
                })
                .collect()
        });
        assert!(failures.is_empty(), "{failures:?}");

        let settings = store.get_settings(FP);
        let last = f64::from(ROUNDS - 1) / 100.0;
        for kind in MapKind::ALL {
            assert_eq!(settings.influence(kind).strength, last, "{kind:?} lost an update");
        }
        let leftovers = std::fs::read_dir(store.fingerprint_dir(FP))?
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name() != "settings.json")
            .count();
        assert_eq!(leftovers, 0);
        Ok(())
    }

    #[test]
    fn corrupt_settings_fall_back_to_defaults() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = MapCacheStore::new(temp.path());
        std::fs::create_dir_all(store.fingerprint_dir(FP))?;
        std::fs::write(store.settings_path(FP), "not json")?;
        assert_eq!(store.get_settings(FP), Default::default());
        Ok(())
    }

    #[test]
    fn path_like_fingerprints_are_refused() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = MapCacheStore::new(temp.path());
        assert!(store.update_settings("../escape", &json!({})).is_err());
        assert!(store
            .prepare_provider_dir("a/b", ProviderKind::Local)
            .is_err());
        assert_eq!(store.read_pack("..", ProviderKind::Local), None);
        Ok(())
    }
}
