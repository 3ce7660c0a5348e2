use std::sync::Arc;

use crate::gateway::Gateway;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
}
