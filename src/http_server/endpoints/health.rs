use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse};

use crate::http_server::state::ServerState;

pub async fn handle_healthy() -> impl IntoResponse {
	(StatusCode::OK, "OK")
}

/// Ready only once the cluster settle wait has completed, so load
/// balancers do not route to a peer that might re-notify stale groups.
pub async fn handle_ready(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
	if state.is_ready() {
		(StatusCode::OK, "OK")
	} else {
		(StatusCode::SERVICE_UNAVAILABLE, "settling")
	}
}
