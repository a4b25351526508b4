//! Storage provider selection.

use std::collections::HashMap;

use serde::Deserialize;

/// Names a storage provider and carries its option map.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderInfo {
    /// Provider name, e.g. `memory` or `fjall`.
    pub provider: String,
    /// Provider-specific options (e.g. `path` for fjall).
    pub config: HashMap<String, String>,
}

impl Default for ProviderInfo {
    fn default() -> Self {
        Self {
            provider: "memory".to_string(),
            config: HashMap::new(),
        }
    }
}
