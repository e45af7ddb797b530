use std::sync::Arc;

use axum::{Json, extract::State, response::IntoResponse};

use crate::http_server::{
	state::ServerState,
	types::{ClusterStatus, ConfigStatus, StatusResponse},
};

pub async fn handle_status(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
	let uptime = jiff::Timestamp::now().duration_since(state.started_at);
	let uptime = std::time::Duration::try_from(uptime).unwrap_or_default();
	let uptime = std::time::Duration::from_secs(uptime.as_secs());

	let status = StatusResponse {
		name: "notifyd".to_string(),
		version: env!("CARGO_PKG_VERSION").to_string(),
		started_at: state.started_at.to_string(),
		uptime: humantime::format_duration(uptime).to_string(),
		pid: state.pid,
		cluster: ClusterStatus {
			name: state.peer.name().to_string(),
			peers: state.peer.members(),
		},
		config: ConfigStatus {
			yaml: state.config_yaml.as_ref().clone(),
			json: state.config.to_json().unwrap_or_default(),
		},
		groups: state.dispatcher.groups(),
	};
	Json(status)
}
