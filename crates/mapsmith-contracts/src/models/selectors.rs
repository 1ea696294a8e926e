use super::registry::{ModelRegistry, ModelSpec};

/// Capability every model used for map generation must declare.
pub const MAP_TRANSFORM: &str = "map-transform";

#[derive(Debug, Clone, PartialEq)]
pub struct ModelSelection {
    pub model: ModelSpec,
    pub requested: Option<String>,
    /// Set when the returned model is not the one asked for.
    pub fallback_reason: Option<String>,
}

/// Resolves a caller's model id against the catalog.
#[derive(Debug, Clone)]
pub struct ModelSelector {
    pub registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: Option<ModelRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_else(|| ModelRegistry::new(None)),
        }
    }

    /// The requested model when it exists and supports `capability`,
    /// otherwise the catalog's first model that does.
    pub fn select(
        &self,
        requested: Option<&str>,
        capability: &str,
    ) -> Result<ModelSelection, String> {
        let requested = requested.map(str::trim).filter(|name| !name.is_empty());
        if let Some(model) = requested.and_then(|name| self.registry.ensure(name, capability)) {
            return Ok(ModelSelection {
                model,
                requested: requested.map(str::to_string),
                fallback_reason: None,
            });
        }

        let default = self
            .registry
            .by_capability(capability)
            .into_iter()
            .next()
            .ok_or_else(|| format!("No models available for capability '{capability}'."))?;
        let fallback_reason = match requested {
            Some(name) => format!(
                "Model '{name}' does not support '{capability}'; using '{}'.",
                default.name
            ),
            None => format!("No model specified; using '{}'.", default.name),
        };
        Ok(ModelSelection {
            model: default,
            requested: requested.map(str::to_string),
            fallback_reason: Some(fallback_reason),
        })
    }
}
