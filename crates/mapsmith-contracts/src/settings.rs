use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::maps::MapKind;

/// How strongly one map constrains downstream generation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapInfluence {
    pub enabled: bool,
    pub strength: f64,
}

impl MapInfluence {
    const fn new(enabled: bool, strength: f64) -> Self {
        Self { enabled, strength }
    }
}

/// Per-fingerprint tuning, shared by every provider's pack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapSettings {
    pub maps: BTreeMap<MapKind, MapInfluence>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl Default for MapSettings {
    fn default() -> Self {
        let maps = MapKind::ALL
            .into_iter()
            .map(|kind| (kind, default_influence(kind)))
            .collect();
        Self {
            maps,
            updated_at: None,
        }
    }
}

fn default_influence(kind: MapKind) -> MapInfluence {
    match kind {
        MapKind::Depth => MapInfluence::new(true, 0.6),
        MapKind::Normals => MapInfluence::new(false, 0.4),
        MapKind::Edges => MapInfluence::new(true, 0.5),
        MapKind::Segmentation => MapInfluence::new(true, 0.5),
        MapKind::FaceMask => MapInfluence::new(true, 1.0),
        MapKind::HandsMask => MapInfluence::new(true, 0.8),
    }
}

impl MapSettings {
    pub fn influence(&self, kind: MapKind) -> MapInfluence {
        self.maps
            .get(&kind)
            .copied()
            .unwrap_or_else(|| default_influence(kind))
    }

    /// Fills kinds missing from an older document with their defaults.
    pub fn with_defaults(mut self) -> Self {
        for kind in MapKind::ALL {
            self.maps
                .entry(kind)
                .or_insert_with(|| default_influence(kind));
        }
        self
    }

    /// Applies a partial update document of the shape
    /// `{"maps": {"depth": {"enabled": false, "strength": 0.3}}}`.
    ///
    /// Unknown kinds and keys are ignored; strengths are clamped to `[0, 1]`.
    pub fn merged(&self, partial: &Value) -> Result<MapSettings, String> {
        let Some(update) = partial.as_object() else {
            return Err("settings update must be a JSON object".to_string());
        };
        let mut next = self.clone().with_defaults();
        let Some(maps) = update.get("maps") else {
            return Ok(next);
        };
        let Some(maps) = maps.as_object() else {
            return Err("settings update field 'maps' must be an object".to_string());
        };
        for (raw_kind, row) in maps {
            let Ok(kind) = raw_kind.parse::<MapKind>() else {
                continue;
            };
            let Some(row) = row.as_object() else {
                continue;
            };
            let current = next.influence(kind);
            next.maps.insert(kind, merge_influence(current, row));
        }
        Ok(next)
    }
}

fn merge_influence(current: MapInfluence, row: &Map<String, Value>) -> MapInfluence {
    let enabled = row
        .get("enabled")
        .and_then(Value::as_bool)
        .unwrap_or(current.enabled);
    let strength = row
        .get("strength")
        .and_then(Value::as_f64)
        .filter(|value| value.is_finite())
        .map(|value| value.clamp(0.0, 1.0))
        .unwrap_or(current.strength);
    MapInfluence { enabled, strength }
}
