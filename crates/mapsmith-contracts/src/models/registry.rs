use indexmap::IndexMap;

pub const DEFAULT_REMOTE_MODEL: &str = "gemini-2.5-flash-image";

#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub name: String,
    pub transport: String,
    pub capabilities: Vec<String>,
    pub cost_per_image_usd: Option<f64>,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }
}

/// Catalog of hosted models the remote provider knows how to call.
///
/// Insertion order matters: the first model supporting a capability is the
/// default for it.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn by_capability(&self, capability: &str) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .cloned()
            .collect()
    }

    pub fn ensure(&self, name: &str, capability: &str) -> Option<ModelSpec> {
        let model = self.get(name)?;
        if model.supports(capability) {
            return Some(model.clone());
        }
        None
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str, transport: &str, capabilities: &[&str], cost: Option<f64>| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                transport: transport.to_string(),
                capabilities: capabilities
                    .iter()
                    .map(|item| (*item).to_string())
                    .collect(),
                cost_per_image_usd: cost,
            },
        );
    };

    insert(
        DEFAULT_REMOTE_MODEL,
        "gemini",
        &["map-transform", "image"],
        Some(0.039),
    );
    insert(
        "gemini-3-pro-image-preview",
        "gemini",
        &["map-transform", "image"],
        Some(0.134),
    );
    insert("gemini-2.5-flash", "gemini", &["text", "vision"], None);

    map
}
