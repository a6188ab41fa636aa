use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use mailrelay_core::{Clock, EmailJob, JobId, WorkerId};
use mailrelay_infra::lock::LockKey;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(enqueue_job))
        .route("/process", post(process_jobs))
        .route("/:id", get(get_job))
        .route("/:id/send", post(send_job))
}

pub async fn enqueue_job(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::EnqueueJobRequest>,
) -> axum::response::Response {
    if body.recipient.trim().is_empty() {
        return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", "recipient must not be empty");
    }
    let id = match body.id.as_deref() {
        Some(raw) => match raw.parse::<JobId>() {
            Ok(id) => id,
            Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string()),
        },
        None => JobId::new(),
    };

    let now = services.clock.now();
    let job = match body.scheduled_for {
        Some(at) => EmailJob::scheduled(id, body.recipient, body.payload, at, now),
        None => EmailJob::pending(id, body.recipient, body.payload, now),
    };
    let view = dto::JobView::from(job.clone());

    let inserted = match body.actor.as_deref() {
        Some(actor) => {
            let key = LockKey::resource_create("email-job", actor);
            let owner = WorkerId::random();
            let ttl = services.leases.settings().dedup_ttl;
            match services
                .locks
                .with_lock(&key, &owner, ttl, services.jobs.insert(job))
                .await
            {
                Some(result) => result,
                None if !services.locks.is_available().await => {
                    return errors::json_error(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "store_unavailable",
                        "lease store is unreachable",
                    );
                }
                None => {
                    return errors::json_error(
                        StatusCode::CONFLICT,
                        "duplicate_request",
                        format!("a job submission by {actor} is already in progress"),
                    );
                }
            }
        }
        None => services.jobs.insert(job).await,
    };

    match inserted {
        Ok(()) => {
            tracing::info!(job_id = %view.id, status = %view.status, "job enqueued");
            (StatusCode::CREATED, Json(view)).into_response()
        }
        Err(e) => errors::repository_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match id.parse::<JobId>() {
        Ok(id) => id,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string()),
    };
    match services.leases.job(&id).await {
        Ok(Some(job)) => Json(dto::JobView::from(job)).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("job not found: {id}")),
        Err(e) => errors::lease_error_to_response(e),
    }
}

pub async fn send_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match id.parse::<JobId>() {
        Ok(id) => id,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string()),
    };
    match services.leases.job(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("job not found: {id}"));
        }
        Err(e) => return errors::lease_error_to_response(e),
    }

    match services.dispatcher.process_job(&id).await {
        Ok(outcome) => Json(dto::SendJobResponse {
            job_id: id.into_string(),
            outcome,
        })
        .into_response(),
        Err(e) => errors::lease_error_to_response(e),
    }
}

pub async fn process_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ProcessJobsQuery>,
) -> axum::response::Response {
    let limit = query
        .limit
        .unwrap_or(services.dispatcher.config().batch_size);
    if limit == 0 {
        return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", "limit must be positive");
    }

    match services.dispatcher.drain(limit).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => errors::lease_error_to_response(e),
    }
}
