use std::sync::Arc;

use axum::{
	Json,
	extract::{Query, State},
	http::StatusCode,
	response::IntoResponse,
};
use chrono::Utc;
use tracing::debug;

use crate::http_server::{
	state::ServerState,
	types::{AlertStatusInfo, AlertsQuery, ErrorResponse, GettableAlert, PostableAlert},
};

pub async fn handle_post_alerts(
	State(state): State<Arc<ServerState>>,
	Json(postable): Json<Vec<PostableAlert>>,
) -> impl IntoResponse {
	let now = Utc::now();
	let resolve_timeout =
		chrono::Duration::from_std(state.config.global.resolve_timeout)
			.unwrap_or(chrono::Duration::minutes(5));

	let mut alerts = Vec::with_capacity(postable.len());
	for post in postable {
		if let Err(err) = post.labels.validate() {
			crate::metrics::inc_alerts_invalid();
			return (
				StatusCode::BAD_REQUEST,
				Json(ErrorResponse {
					error: err.to_string(),
				}),
			)
				.into_response();
		}
		alerts.push(post.into_alert(now, resolve_timeout));
	}

	debug!(count = alerts.len(), "ingesting alerts");
	for alert in &alerts {
		let status = if alert.resolved_at(now) {
			"resolved"
		} else {
			"firing"
		};
		crate::metrics::inc_alerts_received(status);
	}

	match state.store.put(alerts).await {
		Ok(()) => StatusCode::OK.into_response(),
		Err(err) => super::store_error(err),
	}
}

pub async fn handle_get_alerts(
	State(state): State<Arc<ServerState>>,
	Query(query): Query<AlertsQuery>,
) -> impl IntoResponse {
	let now = Utc::now();
	let alerts = if query.resolved {
		state.store.list_all().await
	} else {
		state.store.list_active(now).await
	};

	let mut out: Vec<GettableAlert> = alerts
		.into_iter()
		.map(|alert| {
			let fp = alert.fingerprint();
			let mark = state.marker.status(fp);
			GettableAlert {
				receivers: state.dispatcher.receivers_for(&alert.labels),
				fingerprint: fp.to_string(),
				status: AlertStatusInfo {
					state: mark.state,
					silenced_by: mark.silenced_by,
					inhibited_by: mark
						.inhibited_by
						.iter()
						.map(ToString::to_string)
						.collect(),
				},
				labels: alert.labels,
				annotations: alert.annotations,
				starts_at: alert.starts_at,
				ends_at: alert.ends_at,
				updated_at: alert.updated_at,
				generator_url: alert.generator_url,
			}
		})
		.collect();
	out.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));

	Json(out).into_response()
}

#[cfg(test)]
mod tests {
	use axum::{
		extract::{Query, State},
		http::StatusCode,
		response::IntoResponse,
	};

	use super::*;
	use crate::http_server::test_utils::create_test_state;

	#[tokio::test]
	async fn post_then_get_roundtrip() {
		let state = create_test_state().await;

		let body: Vec<PostableAlert> = serde_json::from_str(
			r#"[{"labels": {"alertname": "x", "severity": "critical"},
			     "annotations": {"summary": "it broke"},
			     "generatorURL": "http://prom/graph"}]"#,
		)
		.unwrap();

		let response = handle_post_alerts(State(state.clone()), Json(body))
			.await
			.into_response();
		assert_eq!(response.status(), StatusCode::OK);

		let response = handle_get_alerts(State(state), Query(AlertsQuery { resolved: false }))
			.await
			.into_response();
		assert_eq!(response.status(), StatusCode::OK);

		let body = axum::body::to_bytes(response.into_body(), usize::MAX)
			.await
			.unwrap();
		let alerts: serde_json::Value = serde_json::from_slice(&body).unwrap();
		let list = alerts.as_array().unwrap();
		assert_eq!(list.len(), 1);
		assert_eq!(list[0]["labels"]["alertname"], "x");
		assert_eq!(list[0]["status"]["state"], "unprocessed");
		assert_eq!(list[0]["receivers"][0], "default");
		// No explicit end: firing with a synthesized resolve timeout.
		assert!(list[0]["endsAt"].is_string());
	}

	#[tokio::test]
	async fn invalid_labels_are_rejected() {
		let state = create_test_state().await;

		let body: Vec<PostableAlert> =
			serde_json::from_str(r#"[{"labels": {}}]"#).unwrap();
		let response = handle_post_alerts(State(state), Json(body))
			.await
			.into_response();
		assert_eq!(response.status(), StatusCode::BAD_REQUEST);
	}
}
