// =============================================================================
// External API — REST endpoints + WebSocket event stream
// =============================================================================

pub mod auth;
pub mod rest;
pub mod ws;

use std::sync::Arc;

use crate::app_state::AppState;
use crate::position_manager::PositionManager;
use crate::risk::RiskGate;

/// Shared context for every handler. Operator commands route through the
/// same position-manager and gate paths as autonomous actions.
#[derive(Clone)]
pub struct ApiContext {
    pub state: Arc<AppState>,
    pub manager: Arc<PositionManager>,
    pub gate: Arc<RiskGate>,
}
