//! HTTP server for alert ingest, the silence API, status, and metrics.

use std::sync::Arc;

use axum::{
	Router,
	routing::{get, post},
};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{Level, error, info, warn};

mod state;
#[cfg(test)]
mod test_utils;
mod types;

pub mod endpoints;

pub use endpoints::*;
pub use state::ServerState;
pub use types::*;

pub fn router(state: Arc<ServerState>) -> Router {
	Router::new()
		.route("/", get(handle_index))
		.route("/api/v1/alerts", get(handle_get_alerts).post(handle_post_alerts))
		.route(
			"/api/v1/silences",
			get(handle_get_silences).post(handle_post_silence),
		)
		.route(
			"/api/v1/silence/{id}",
			get(handle_get_silence).delete(handle_delete_silence),
		)
		.route("/api/v1/status", get(handle_status))
		.route("/metrics", get(handle_metrics))
		.route("/-/healthy", get(handle_healthy))
		.route("/-/ready", get(handle_ready))
		.layer(
			TraceLayer::new_for_http()
				.make_span_with(
					DefaultMakeSpan::new()
						.level(Level::INFO)
						.include_headers(false),
				)
				.on_request(|request: &axum::http::Request<_>, _span: &tracing::Span| {
					info!(
						method = %request.method(),
						uri = %request.uri(),
						"HTTP request"
					);
				})
				.on_response(
					DefaultOnResponse::new()
						.level(Level::INFO)
						.include_headers(false),
				),
		)
		.with_state(state)
}

pub async fn start_server(state: Arc<ServerState>, addrs: Vec<std::net::SocketAddr>) {
	let app = router(state);

	// Use default if no addresses provided
	let addrs_to_try = if addrs.is_empty() {
		vec![
			"[::1]:9311".parse().unwrap(),
			"127.0.0.1:9311".parse().unwrap(),
		]
	} else {
		addrs
	};

	let mut listener = None;
	let mut last_error = None;

	// Try each address in order until one succeeds
	for addr in &addrs_to_try {
		match tokio::net::TcpListener::bind(addr).await {
			Ok(l) => {
				info!("HTTP server listening on http://{}", addr);
				listener = Some(l);
				break;
			}
			Err(e) => {
				warn!("failed to bind HTTP server to {}: {}", addr, e);
				last_error = Some(e);
			}
		}
	}

	let listener = match listener {
		Some(l) => l,
		None => {
			if let Some(e) = last_error {
				warn!("failed to bind HTTP server to any address: {}", e);
			} else {
				warn!("no addresses provided for HTTP server");
			}
			warn!("continuing without HTTP server; alerts can only arrive from peers");
			return;
		}
	};

	if let Err(e) = axum::serve(listener, app).await {
		error!("HTTP server error: {}", e);
	}
}
