use std::sync::Arc;

use crate::config::Settings;
use crate::jobs::JobExecutor;
use crate::storage::ConnectionManager;

/// Shared handler state. Holds the request-scope manager only; the
/// background scope never reaches request handlers.
#[derive(Clone)]
pub struct AppState {
    pub connections: ConnectionManager,
    pub executor: Arc<dyn JobExecutor>,
    pub settings: Arc<Settings>,
}
