use std::sync::Arc;

use axum::{extract::Extension, response::IntoResponse, Json};

use crate::app::services::AppServices;

pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    let lease_store = if services.locks.is_available().await { "up" } else { "down" };

    Json(serde_json::json!({
        "success": true,
        "message": "Health check passed",
        "worker_id": services.leases.worker_id().as_str(),
        "lease_store": lease_store,
    }))
}
