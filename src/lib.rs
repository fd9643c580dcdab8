pub mod config;
pub mod database;
pub mod dto;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod utils;

use crate::services::session_service::{SessionDeps, SessionRegistry};
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionRegistry>,
}

impl AppState {
    pub fn new(deps: SessionDeps) -> Self {
        Self {
            sessions: SessionRegistry::new(deps),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health::health))
        .route("/api/sessions", post(routes::session::start_session))
        .route("/api/sessions/:id", get(routes::session::get_session))
        .route("/api/sessions/:id/signals", post(routes::session::post_signal))
        .route(
            "/api/sessions/:id/terminate",
            post(routes::session::terminate_session),
        )
        .route(
            "/api/sessions/:id/complete",
            post(routes::session::complete_session),
        )
        .route(
            "/api/sessions/:id/questions/:question_id/code",
            post(routes::session::submit_code),
        )
        .route(
            "/api/sessions/:id/questions/:question_id/mcq",
            post(routes::session::submit_mcq),
        )
        .with_state(state)
        .layer(middleware::cors::permissive_cors())
        .layer(TraceLayer::new_for_http())
}
