// Health surface: store, queue backing store, and queue backlog in one view.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use diesel::prelude::*;
use serde_json::json;
use tracing::warn;

use crate::queue_config::{ALL_QUEUES, LIVE_PENDING_TARGET, QueueKind};
use crate::web::{AppState, PgPool};

async fn store_healthy(pool: PgPool) -> bool {
    let result = tokio::task::spawn_blocking(move || {
        let mut conn = pool.get()?;
        diesel::sql_query("SELECT 1").execute(&mut conn)?;
        Ok::<(), anyhow::Error>(())
    })
    .await;

    matches!(result, Ok(Ok(())))
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Response {
    let store_ok = store_healthy(state.pool.clone()).await;
    let kv_ok = state.queue.ping().await.is_ok();

    let mut backlog = serde_json::Map::new();
    let mut live_backlog_ok = true;
    if kv_ok {
        for kind in ALL_QUEUES {
            if let Ok(pending) = state.queue.pending(kind).await {
                if kind == QueueKind::LivePoints && pending >= LIVE_PENDING_TARGET {
                    live_backlog_ok = false;
                }
                backlog.insert(kind.name().to_string(), json!(pending));
            }
        }
    }

    let status = if store_ok && kv_ok && live_backlog_ok {
        "ok"
    } else if store_ok {
        "degraded"
    } else {
        "down"
    };

    if status != "ok" {
        warn!(
            "Health check: status={} store={} kv={} live_backlog_ok={}",
            status, store_ok, kv_ok, live_backlog_ok
        );
    }

    let body = Json(json!({
        "status": status,
        "store": if store_ok { "ok" } else { "down" },
        "queue_store": if kv_ok { "ok" } else { "down" },
        "queue_backlog": backlog,
    }));

    if store_ok {
        (StatusCode::OK, body).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, body).into_response()
    }
}
