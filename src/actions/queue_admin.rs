// Queue introspection and DLQ operator tooling.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use crate::queue_config::{ALL_QUEUES, LIVE_PENDING_TARGET, QueueKind};
use crate::web::AppState;

use super::json_error;

/// GET /queue/status
pub async fn queue_status(State(state): State<AppState>) -> Response {
    let mut queues = Vec::with_capacity(ALL_QUEUES.len());

    for kind in ALL_QUEUES {
        let pending = state.queue.pending(kind).await;
        let dlq_size = state.queue.dlq_size(kind).await;
        match (pending, dlq_size) {
            (Ok(pending), Ok(dlq_size)) => queues.push(json!({
                "queue": kind.name(),
                "priority": kind.priority(),
                "pending": pending,
                "dlq_size": dlq_size,
                "healthy": kind != QueueKind::LivePoints || pending < LIVE_PENDING_TARGET,
            })),
            (pending, dlq_size) => {
                error!(
                    "Queue status read failed for '{}': {:?} / {:?}",
                    kind.name(),
                    pending.err(),
                    dlq_size.err()
                );
                return json_error(StatusCode::SERVICE_UNAVAILABLE, "Queue unreachable")
                    .into_response();
            }
        }
    }

    Json(json!({ "queues": queues })).into_response()
}

fn parse_queue(name: &str) -> Result<QueueKind, Response> {
    QueueKind::parse(name)
        .ok_or_else(|| json_error(StatusCode::NOT_FOUND, "Unknown queue").into_response())
}

#[derive(Debug, Deserialize)]
pub struct PeekParams {
    pub limit: Option<usize>,
}

/// GET /admin/queue/dlq/{queue}
pub async fn dlq_peek(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    Query(params): Query<PeekParams>,
) -> Response {
    let kind = match parse_queue(&queue) {
        Ok(kind) => kind,
        Err(response) => return response,
    };

    match state
        .queue
        .dlq_peek(kind, params.limit.unwrap_or(50).min(500))
        .await
    {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => {
            error!("DLQ peek failed: {}", e);
            json_error(StatusCode::SERVICE_UNAVAILABLE, "Queue unreachable").into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RequeueParams {
    pub max: Option<usize>,
}

/// POST /admin/queue/dlq/{queue}/requeue
///
/// The only path that ever moves DLQ items back onto a queue.
pub async fn dlq_requeue(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    Query(params): Query<RequeueParams>,
) -> Response {
    let kind = match parse_queue(&queue) {
        Ok(kind) => kind,
        Err(response) => return response,
    };

    match state
        .queue
        .dlq_requeue(kind, params.max.unwrap_or(100).min(1_000))
        .await
    {
        Ok(requeued) => Json(json!({ "requeued": requeued })).into_response(),
        Err(e) => {
            error!("DLQ requeue failed: {}", e);
            json_error(StatusCode::SERVICE_UNAVAILABLE, "Queue unreachable").into_response()
        }
    }
}

/// DELETE /admin/queue/dlq/{queue}
pub async fn dlq_purge(State(state): State<AppState>, Path(queue): Path<String>) -> Response {
    let kind = match parse_queue(&queue) {
        Ok(kind) => kind,
        Err(response) => return response,
    };

    match state.queue.dlq_purge(kind).await {
        Ok(purged) => Json(json!({ "purged": purged })).into_response(),
        Err(e) => {
            error!("DLQ purge failed: {}", e);
            json_error(StatusCode::SERVICE_UNAVAILABLE, "Queue unreachable").into_response()
        }
    }
}
