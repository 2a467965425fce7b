//! API shared state

use crate::actors::manager::ManagerHandle;

/// Shared state passed to all API handlers
#[derive(Debug, Clone)]
pub struct ApiState {
    /// Handle to the manager actor; every query goes through it
    pub manager: ManagerHandle,
}

impl ApiState {
    pub fn new(manager: ManagerHandle) -> Self {
        Self { manager }
    }
}
