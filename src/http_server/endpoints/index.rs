use axum::response::IntoResponse;

pub async fn handle_index() -> impl IntoResponse {
	concat!(
		"notifyd v",
		env!("CARGO_PKG_VERSION"),
		"\n\n",
		"POST /api/v1/alerts     ingest alerts\n",
		"GET  /api/v1/alerts     list alerts with status\n",
		"GET  /api/v1/silences   list silences\n",
		"POST /api/v1/silences   create or supersede a silence\n",
		"GET  /api/v1/silence/{id}\n",
		"DELETE /api/v1/silence/{id}  expire a silence\n",
		"GET  /api/v1/status     daemon status\n",
		"GET  /metrics           prometheus metrics\n",
		"GET  /-/healthy         liveness\n",
		"GET  /-/ready           readiness\n",
	)
}
