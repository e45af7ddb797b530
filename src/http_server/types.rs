//! Wire types for the HTTP API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
	alerts::Alert,
	labels::LabelSet,
	marker::AlertState,
	matchers::Matcher,
	silences::{Silence, SilenceState},
};

/// An alert as producers post it.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostableAlert {
	pub labels: LabelSet,

	#[serde(default)]
	pub annotations: LabelSet,

	#[serde(default)]
	pub starts_at: Option<DateTime<Utc>>,

	#[serde(default)]
	pub ends_at: Option<DateTime<Utc>>,

	#[serde(default, rename = "generatorURL")]
	pub generator_url: String,
}

impl PostableAlert {
	/// Fill defaults: a missing start is now; a missing or zero end is
	/// synthesized from the resolve timeout and flagged so a later
	/// explicit end can override it.
	pub fn into_alert(self, now: DateTime<Utc>, resolve_timeout: chrono::Duration) -> Alert {
		let starts_at = self.starts_at.unwrap_or(now);
		let (ends_at, timeout) = match self.ends_at {
			Some(ends) if ends.timestamp() != 0 => (ends, false),
			_ => (now + resolve_timeout, true),
		};

		Alert {
			labels: self.labels,
			annotations: self.annotations,
			starts_at: starts_at.min(ends_at),
			ends_at,
			updated_at: now,
			generator_url: self.generator_url,
			timeout,
		}
	}
}

/// An alert as the query API returns it, with computed status.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GettableAlert {
	pub labels: LabelSet,
	pub annotations: LabelSet,
	pub starts_at: DateTime<Utc>,
	pub ends_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	#[serde(rename = "generatorURL")]
	pub generator_url: String,
	pub fingerprint: String,
	pub status: AlertStatusInfo,
	pub receivers: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertStatusInfo {
	pub state: AlertState,
	pub silenced_by: Vec<String>,
	pub inhibited_by: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct AlertsQuery {
	/// Include resolved alerts still held for retention.
	#[serde(default)]
	pub resolved: bool,
}

/// A silence as operators post it: without id to create, with id to
/// supersede.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostableSilence {
	#[serde(default)]
	pub id: Option<String>,
	pub matchers: Vec<Matcher>,
	pub starts_at: DateTime<Utc>,
	pub ends_at: DateTime<Utc>,
	pub created_by: String,
	#[serde(default)]
	pub comment: String,
}

#[derive(Debug, Serialize)]
pub struct PostSilenceResponse {
	#[serde(rename = "silenceID")]
	pub silence_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GettableSilence {
	pub id: String,
	pub matchers: Vec<Matcher>,
	pub starts_at: DateTime<Utc>,
	pub ends_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	pub created_by: String,
	pub comment: String,
	pub status: SilenceStatusInfo,
}

#[derive(Debug, Serialize)]
pub struct SilenceStatusInfo {
	pub state: SilenceState,
}

impl GettableSilence {
	pub fn from_silence(silence: Silence, now: DateTime<Utc>) -> Self {
		let state = silence.state_at(now);
		Self {
			id: silence.id,
			matchers: silence.matchers,
			starts_at: silence.starts_at,
			ends_at: silence.ends_at,
			updated_at: silence.updated_at,
			created_by: silence.created_by,
			comment: silence.comment,
			status: SilenceStatusInfo { state },
		}
	}
}

#[derive(Debug, Deserialize)]
pub struct SilencesQuery {
	/// Filter to one state: pending, active, or expired.
	#[serde(default)]
	pub state: Option<SilenceState>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
	pub name: String,
	pub version: String,
	pub started_at: String,
	pub uptime: String,
	pub pid: u32,
	pub cluster: ClusterStatus,
	pub config: ConfigStatus,
	pub groups: Vec<crate::dispatch::GroupInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClusterStatus {
	pub name: String,
	pub peers: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigStatus {
	pub yaml: String,
	pub json: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
	pub error: String,
}
