pub mod agent;
pub mod callout;
pub mod config;
pub mod controller;
pub mod diff;
pub mod dispatcher;
pub mod error;
pub mod host;
pub mod http_inventory;
pub mod inventory;
pub mod liveness;
pub mod memory_store;
pub mod mock_callout;
pub mod outcome;
pub mod payload;
pub mod playbook_callout;
pub mod post_process;
pub mod state;

pub use agent::controller_from_config;
pub use callout::{Callout, CalloutError, CalloutOutcome};
pub use config::{AgentConfig, ConfigError};
pub use controller::{Collaborators, ControllerSettings, ControllerState, CycleController};
pub use dispatcher::{DispatchError, DispatchMode, DispatchSettings, Dispatcher};
pub use error::AgentError;
pub use host::HostId;
pub use http_inventory::HttpInventory;
pub use inventory::{FileInventory, Inventory, InventoryError, Snapshot};
pub use liveness::{check_health, HealthStatus, Liveness, StatFileLiveness};
pub use memory_store::MemoryStateStore;
pub use mock_callout::MockCallout;
pub use outcome::{CycleOutcome, LogCollector};
pub use playbook_callout::PlaybookCallout;
pub use post_process::{HttpPostProcess, PostProcess, SummaryPostProcess};
pub use state::{FileStateStore, StateStore, StoreError};
