use crate::config::ConfigError;
use crate::inventory::InventoryError;

/// Errors produced by the deploy agent.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("inventory: {0}")]
    Inventory(#[from] InventoryError),

    #[error("a reconciliation cycle is already running")]
    CycleInProgress,

    #[error("{0}")]
    Other(String),
}
