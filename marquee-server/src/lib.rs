//! # Marquee Server
//!
//! Local HTTP front for the kiosk renderer. Every request the renderer makes
//! is routed through [`marquee_core::RequestRouter`]; the sync process and
//! the player shell use the control endpoints under
//! [`routes::CONTROL_PREFIX`].

pub mod handlers;
pub mod infra;
pub mod routes;

pub use infra::app_state::AppState;

use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .nest(routes::CONTROL_PREFIX, routes::create_control_router())
        .fallback(handlers::intercept_handler)
        .layer(TraceLayer::new_for_http())
        // The renderer is served from a file:// or app:// origin.
        .layer(CorsLayer::permissive())
        .with_state(state)
}
