use std::sync::Arc;
use std::time::Duration;

use crate::callout::Callout;
use crate::config::{AgentConfig, ConfigError, InventoryConfig};
use crate::controller::{Collaborators, ControllerSettings, CycleController};
use crate::error::AgentError;
use crate::http_inventory::HttpInventory;
use crate::inventory::{FileInventory, Inventory};
use crate::liveness::StatFileLiveness;
use crate::playbook_callout::PlaybookCallout;
use crate::post_process::{HttpPostProcess, PostProcess, SummaryPostProcess};
use crate::state::FileStateStore;

fn inventory_from_config(config: &InventoryConfig) -> Arc<dyn Inventory> {
    match config {
        InventoryConfig::Http {
            url,
            token,
            timeout_seconds,
        } => {
            let mut inventory =
                HttpInventory::new(url.clone()).with_timeout(Duration::from_secs(*timeout_seconds));
            if let Some(token) = token {
                inventory = inventory.with_token(token.clone());
            }
            Arc::new(inventory)
        }
        InventoryConfig::File { path } => Arc::new(FileInventory::new(path.clone())),
    }
}

/// Wire the production collaborators described by `config` into a
/// controller.
pub fn controller_from_config(config: &AgentConfig) -> Result<CycleController, AgentError> {
    let inventory = config
        .inventory
        .as_ref()
        .map(inventory_from_config)
        .ok_or_else(|| ConfigError::Invalid("inventory must be configured".to_string()))?;

    let post_process: Arc<dyn PostProcess> = match &config.post_process {
        Some(hook) => Arc::new(HttpPostProcess::new(
            hook.url.clone(),
            Duration::from_secs(hook.timeout_seconds),
        )),
        None => Arc::new(SummaryPostProcess),
    };
    let callout: Arc<dyn Callout> = Arc::new(PlaybookCallout::new(config.ansible.clone()));

    Ok(CycleController::new(
        Collaborators {
            inventory,
            store: Arc::new(FileStateStore::new(config.output_directory.clone())),
            callout,
            liveness: Arc::new(StatFileLiveness::new(config.healthcheck_stat_file.clone())),
            post_process,
        },
        ControllerSettings {
            dispatch: config.dispatch_settings(),
            cleanup_on_empty_snapshot: config.cleanup_on_empty_snapshot,
        },
    ))
}
