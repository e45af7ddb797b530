use axum::{Json, http::StatusCode, response::IntoResponse};

use crate::error::StoreError;

use super::types::ErrorResponse;

mod alerts;
mod health;
mod index;
mod metrics;
mod silences;
mod status;

pub use alerts::{handle_get_alerts, handle_post_alerts};
pub use health::{handle_healthy, handle_ready};
pub use index::handle_index;
pub use metrics::handle_metrics;
pub use silences::{
	handle_delete_silence, handle_get_silence, handle_get_silences, handle_post_silence,
};
pub use status::handle_status;

/// Map store failures to API status codes.
pub(crate) fn store_error(err: StoreError) -> axum::response::Response {
	let (status, message) = match &err {
		StoreError::NotFound => (StatusCode::NOT_FOUND, err.to_string()),
		StoreError::Invalid(_) => (StatusCode::BAD_REQUEST, err.to_string()),
		_ => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
	};
	(status, Json(ErrorResponse { error: message })).into_response()
}
