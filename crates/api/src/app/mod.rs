//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `config.rs`: environment settings
//! - `services.rs`: store wiring (in-memory or Postgres + Redis), lease manager, dispatcher
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;

pub mod config;
pub mod dto;
pub mod errors;
pub mod mailer;
pub mod routes;
pub mod services;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(services: Arc<services::AppServices>) -> Router {
    Router::new()
        .route("/api/healthcheck", get(routes::system::health))
        .merge(routes::router())
        .layer(Extension(services))
        .layer(ServiceBuilder::new())
}
