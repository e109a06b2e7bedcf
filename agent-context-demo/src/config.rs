use std::path::Path;

use agent_context::ContextManagerConfig;
use anyhow::{Context, Error as AnyError};
use serde::Deserialize;

/// The slice of agent configuration the demo understands. Unknown keys in the
/// file are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    #[serde(flatten)]
    pub context: ContextManagerConfig,
    pub attributes: AttributesConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AttributesConfig {
    pub enabled: bool,
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<AgentConfig, AnyError> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;

        serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}
