use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::providers::ProviderKind;

/// The closed set of structural maps a pack can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MapKind {
    Depth,
    Normals,
    Edges,
    Segmentation,
    FaceMask,
    HandsMask,
}

impl MapKind {
    pub const ALL: [MapKind; 6] = [
        MapKind::Depth,
        MapKind::Normals,
        MapKind::Edges,
        MapKind::Segmentation,
        MapKind::FaceMask,
        MapKind::HandsMask,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MapKind::Depth => "depth",
            MapKind::Normals => "normals",
            MapKind::Edges => "edges",
            MapKind::Segmentation => "segmentation",
            MapKind::FaceMask => "faceMask",
            MapKind::HandsMask => "handsMask",
        }
    }

    /// Masks and edge maps are two-tone; depth and normals are continuous.
    pub fn is_binary(self) -> bool {
        matches!(
            self,
            MapKind::Edges | MapKind::Segmentation | MapKind::FaceMask | MapKind::HandsMask
        )
    }

    pub fn is_mask(self) -> bool {
        matches!(
            self,
            MapKind::Segmentation | MapKind::FaceMask | MapKind::HandsMask
        )
    }

    pub fn filename(self) -> String {
        format!("{}.png", self.as_str())
    }

    /// Parses a comma separated list, skipping blanks and duplicates.
    pub fn parse_csv(raw: &str) -> Result<Vec<MapKind>, String> {
        let mut kinds = Vec::new();
        for item in raw.split(',').map(str::trim).filter(|item| !item.is_empty()) {
            let kind = item.parse::<MapKind>()?;
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        Ok(kinds)
    }

    pub fn join_csv(kinds: &[MapKind]) -> String {
        kinds
            .iter()
            .map(|kind| kind.as_str())
            .collect::<Vec<&str>>()
            .join(",")
    }
}

impl fmt::Display for MapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MapKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        MapKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(raw.trim()))
            .ok_or_else(|| format!("Unknown map kind '{}'.", raw.trim()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapAsset {
    pub kind: MapKind,
    pub filename: String,
    pub width: u32,
    pub height: u32,
    pub generated_at: String,
    pub model_used: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationAttempt {
    pub kind: MapKind,
    pub provider: ProviderKind,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_fallback: Option<bool>,
}

impl GenerationAttempt {
    pub fn succeeded(kind: MapKind, provider: ProviderKind) -> Self {
        Self {
            kind,
            provider,
            ok: true,
            error: None,
            used_fallback: None,
        }
    }

    pub fn failed(kind: MapKind, provider: ProviderKind, error: impl Into<String>) -> Self {
        Self {
            kind,
            provider,
            ok: false,
            error: Some(error.into()),
            used_fallback: None,
        }
    }

    pub fn via_fallback(mut self) -> Self {
        self.used_fallback = Some(true);
        self
    }
}

/// Audit trail for one generation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationMeta {
    pub provider: ProviderKind,
    pub model_id: String,
    pub created_at: String,
    #[serde(default)]
    pub usage: Option<Value>,
    #[serde(default)]
    pub cost: Option<f64>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub attempts: Vec<GenerationAttempt>,
}

impl GenerationMeta {
    pub fn new(provider: ProviderKind, model_id: impl Into<String>, created_at: String) -> Self {
        Self {
            provider,
            model_id: model_id.into(),
            created_at,
            usage: None,
            cost: None,
            request_id: None,
            attempts: Vec::new(),
        }
    }

    pub fn record(&mut self, attempt: GenerationAttempt) {
        self.attempts.push(attempt);
    }

    /// Folds one upstream usage report into the running total.
    ///
    /// Numeric fields are summed; anything else keeps the latest value.
    pub fn absorb_usage(&mut self, usage: &Value) {
        let Some(incoming) = usage.as_object() else {
            return;
        };
        let mut total = self
            .usage
            .take()
            .and_then(|value| value.as_object().cloned())
            .unwrap_or_default();
        merge_usage(&mut total, incoming);
        self.usage = Some(Value::Object(total));
    }

    pub fn add_cost(&mut self, cost: f64) {
        if !cost.is_finite() {
            return;
        }
        self.cost = Some(self.cost.unwrap_or(0.0) + cost);
    }
}

fn merge_usage(total: &mut Map<String, Value>, incoming: &Map<String, Value>) {
    for (key, value) in incoming {
        let summed = match (total.get(key), value) {
            (Some(Value::Number(left)), Value::Number(right)) => {
                match (left.as_u64(), right.as_u64()) {
                    (Some(a), Some(b)) => Some(Value::from(a.saturating_add(b))),
                    _ => left
                        .as_f64()
                        .zip(right.as_f64())
                        .map(|(a, b)| Value::from(a + b)),
                }
            }
            (Some(Value::Object(left)), Value::Object(right)) => {
                let mut nested = left.clone();
                merge_usage(&mut nested, right);
                Some(Value::Object(nested))
            }
            _ => None,
        };
        total.insert(key.clone(), summed.unwrap_or_else(|| value.clone()));
    }
}

/// The full set of derived maps for one (fingerprint, provider) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapPack {
    pub source_hash: String,
    pub source_width: u32,
    pub source_height: u32,
    pub created_at: String,
    pub provider: ProviderKind,
    pub generation_meta: GenerationMeta,
    #[serde(default)]
    pub maps: Vec<MapAsset>,
    pub input_filename: String,
}

impl MapPack {
    pub fn asset(&self, kind: MapKind) -> Option<&MapAsset> {
        self.maps.iter().find(|asset| asset.kind == kind)
    }

    /// Inserts an asset, replacing any existing asset of the same kind.
    pub fn upsert_asset(&mut self, asset: MapAsset) {
        match self.maps.iter_mut().find(|row| row.kind == asset.kind) {
            Some(existing) => *existing = asset,
            None => self.maps.push(asset),
        }
    }

    pub fn kinds(&self) -> Vec<MapKind> {
        self.maps.iter().map(|asset| asset.kind).collect()
    }

    /// A pack only counts as a cache hit when it carries at least one map.
    pub fn is_usable(&self) -> bool {
        !self.maps.is_empty()
    }
}
