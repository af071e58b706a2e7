use axum::{
    Router,
    routing::{get, post, put},
};

use crate::{handlers, infra::app_state::AppState};

/// Control surface for the sync process and the player shell. Kept under a
/// prefix no origin path uses.
pub const CONTROL_PREFIX: &str = "/_marquee";

pub fn create_control_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/widgets/{id}", get(handlers::widget_markup_handler))
        .route("/sync/required", put(handlers::register_required_handler))
        .route("/sync/blobs/{kind}/{id}", put(handlers::push_blob_handler))
        .route("/sync/rollover", post(handlers::rollover_handler))
}
