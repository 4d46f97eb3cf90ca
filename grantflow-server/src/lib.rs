pub mod api;
pub mod config;
pub mod error;

pub use config::{Config, ConfigError};

use std::sync::Arc;

use grantflow_core::broadcast::ProgressBroadcaster;
use grantflow_core::{ExecutionTracker, Orchestrator};
use grantflow_storage::Store;

pub type ApiContextRef = Arc<ApiContext>;

pub struct ApiContext {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub tracker: Arc<ExecutionTracker>,
    pub orchestrator: Arc<Orchestrator>,
    pub broadcaster: ProgressBroadcaster,
}
