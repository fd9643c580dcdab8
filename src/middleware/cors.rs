use axum::http::{header, Method};
use tower_http::cors::{Any, CorsLayer};

/// The candidate's browser posts signals from the assessment page's origin.
pub fn permissive_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_origin(Any)
}
