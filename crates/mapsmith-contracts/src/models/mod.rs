mod registry;
mod selectors;

pub use registry::{ModelRegistry, ModelSpec, DEFAULT_REMOTE_MODEL};
pub use selectors::{ModelSelection, ModelSelector, MAP_TRANSFORM};
