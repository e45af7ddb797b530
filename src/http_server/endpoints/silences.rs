use std::sync::Arc;

use axum::{
	Json,
	extract::{Path, Query, State},
	http::StatusCode,
	response::IntoResponse,
};
use chrono::Utc;
use tracing::info;

use crate::{
	http_server::{
		state::ServerState,
		types::{
			GettableSilence, PostSilenceResponse, PostableSilence, SilencesQuery,
		},
	},
	silences::{Silence, SilenceFilter},
};

pub async fn handle_post_silence(
	State(state): State<Arc<ServerState>>,
	Json(postable): Json<PostableSilence>,
) -> impl IntoResponse {
	let silence = Silence {
		id: postable.id.unwrap_or_default(),
		matchers: postable.matchers,
		starts_at: postable.starts_at,
		ends_at: postable.ends_at,
		// The store stamps this on write.
		updated_at: postable.starts_at,
		created_by: postable.created_by,
		comment: postable.comment,
	};

	match state.silences.set(silence) {
		Ok(id) => {
			info!(id, "silence stored");
			Json(PostSilenceResponse { silence_id: id }).into_response()
		}
		Err(err) => super::store_error(err),
	}
}

pub async fn handle_get_silences(
	State(state): State<Arc<ServerState>>,
	Query(query): Query<SilencesQuery>,
) -> impl IntoResponse {
	let now = Utc::now();
	let filter = SilenceFilter {
		states: query.state.map(|s| vec![s]),
		..Default::default()
	};

	let silences: Vec<GettableSilence> = state
		.silences
		.query(&filter, now)
		.into_iter()
		.map(|sil| GettableSilence::from_silence(sil, now))
		.collect();

	Json(silences).into_response()
}

pub async fn handle_get_silence(
	State(state): State<Arc<ServerState>>,
	Path(id): Path<String>,
) -> impl IntoResponse {
	match state.silences.get(&id) {
		Ok(silence) => Json(GettableSilence::from_silence(silence, Utc::now())).into_response(),
		Err(err) => super::store_error(err),
	}
}

pub async fn handle_delete_silence(
	State(state): State<Arc<ServerState>>,
	Path(id): Path<String>,
) -> impl IntoResponse {
	match state.silences.expire(&id) {
		Ok(()) => {
			info!(id, "silence expired via API");
			StatusCode::OK.into_response()
		}
		Err(err) => super::store_error(err),
	}
}
