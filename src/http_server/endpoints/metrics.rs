use axum::{http::StatusCode, response::IntoResponse};
use tracing::error;

pub async fn handle_metrics() -> impl IntoResponse {
	match crate::metrics::gather_metrics() {
		Ok(metrics) => (StatusCode::OK, metrics).into_response(),
		Err(err) => {
			error!("failed to gather metrics: {err:?}");
			(
				StatusCode::INTERNAL_SERVER_ERROR,
				"failed to gather metrics".to_string(),
			)
				.into_response()
		}
	}
}
