pub mod auth;
pub mod error_handling;
pub mod logging;

use crate::state::AppState;
use axum::Router;

/// Apply default middleware layers (request tracing).
pub fn with_defaults(router: Router<AppState>) -> Router<AppState> {
    logging::add_tracing(router)
}
