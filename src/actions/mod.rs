pub mod live;
pub mod queue_admin;
pub mod status;
pub mod tracking;

pub use live::*;
pub use queue_admin::*;
pub use status::*;
pub use tracking::*;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde_json::json;

/// Consistent JSON error envelope across the surface.
pub fn json_error(status: StatusCode, message: &str) -> impl IntoResponse {
    (
        status,
        Json(json!({
            "errors": message
        })),
    )
}
