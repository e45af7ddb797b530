//! Webhook integration: a JSON POST of the whole batch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::{
	alerts::{Alert, AlertStatus},
	error::{FailureReason, NotifyError},
	labels::LabelSet,
	notify::{Notifier, NotifyContext},
};

/// Payload schema version, bumped on incompatible change.
const PAYLOAD_VERSION: &str = "4";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Payload<'a> {
	version: &'static str,
	group_key: &'a str,
	status: AlertStatus,
	receiver: &'a str,
	group_labels: &'a LabelSet,
	common_labels: LabelSet,
	common_annotations: LabelSet,
	#[serde(skip_serializing_if = "Option::is_none")]
	external_url: Option<String>,
	alerts: Vec<PayloadAlert<'a>>,
	truncated_alerts: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PayloadAlert<'a> {
	status: AlertStatus,
	labels: &'a LabelSet,
	annotations: &'a LabelSet,
	starts_at: DateTime<Utc>,
	ends_at: DateTime<Utc>,
	generator_url: &'a str,
	fingerprint: String,
}

/// Labels (or annotations) shared by every alert in the batch.
fn common<'a>(sets: impl Iterator<Item = &'a LabelSet> + Clone) -> LabelSet {
	let mut iter = sets.clone();
	let Some(first) = iter.next() else {
		return LabelSet::new();
	};
	first
		.iter()
		.filter(|(name, value)| {
			sets.clone()
				.skip(1)
				.all(|set| set.get(name) == Some(*value))
		})
		.map(|(n, v)| (n.to_string(), v.to_string()))
		.collect()
}

pub struct WebhookNotifier {
	url: Url,
	client: reqwest::Client,
	max_alerts: usize,
	external_url: Option<Url>,
}

impl WebhookNotifier {
	pub fn new(
		url: Url,
		client: reqwest::Client,
		max_alerts: usize,
		external_url: Option<Url>,
	) -> Self {
		Self {
			url,
			client,
			max_alerts,
			external_url,
		}
	}
}

#[async_trait]
impl Notifier for WebhookNotifier {
	fn kind(&self) -> &'static str {
		"webhook"
	}

	async fn notify(&self, ctx: &NotifyContext, alerts: &[Alert]) -> Result<(), NotifyError> {
		let now = Utc::now();
		let (batch, truncated) = if self.max_alerts > 0 && alerts.len() > self.max_alerts {
			(&alerts[..self.max_alerts], alerts.len() - self.max_alerts)
		} else {
			(alerts, 0)
		};

		let status = if batch.iter().any(|a| !a.resolved_at(now)) {
			AlertStatus::Firing
		} else {
			AlertStatus::Resolved
		};

		let payload = Payload {
			version: PAYLOAD_VERSION,
			group_key: &ctx.group_key,
			status,
			receiver: &ctx.receiver,
			group_labels: &ctx.group_labels,
			common_labels: common(batch.iter().map(|a| &a.labels)),
			common_annotations: common(batch.iter().map(|a| &a.annotations)),
			external_url: self.external_url.as_ref().map(Url::to_string),
			alerts: batch
				.iter()
				.map(|a| PayloadAlert {
					status: a.status_at(now),
					labels: &a.labels,
					annotations: &a.annotations,
					starts_at: a.starts_at,
					ends_at: a.ends_at,
					generator_url: &a.generator_url,
					fingerprint: a.fingerprint().to_string(),
				})
				.collect(),
			truncated_alerts: truncated,
		};

		debug!(url = %self.url, alerts = batch.len(), "posting webhook");
		let response = self
			.client
			.post(self.url.clone())
			.json(&payload)
			.send()
			.await?;

		let status = response.status();
		if status.is_success() {
			return Ok(());
		}

		let reason = FailureReason::from_status(status);
		let message = format!("webhook returned {status}");
		// 429 and 5xx are worth retrying; other client errors are not.
		if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
			Err(NotifyError::transient(reason, message))
		} else {
			Err(NotifyError::permanent(reason, message))
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn common_labels_is_the_intersection() {
		let a = LabelSet::from([("alertname", "x"), ("cluster", "A"), ("pod", "p1")]);
		let b = LabelSet::from([("alertname", "x"), ("cluster", "A"), ("pod", "p2")]);

		let shared = common([&a, &b].into_iter());
		assert_eq!(shared.get("alertname"), Some("x"));
		assert_eq!(shared.get("cluster"), Some("A"));
		assert_eq!(shared.get("pod"), None);
	}

	#[test]
	fn common_of_empty_batch_is_empty() {
		let shared = common(std::iter::empty());
		assert!(shared.is_empty());
	}

	#[test]
	fn payload_serializes_camel_case() {
		let labels = LabelSet::from([("alertname", "x")]);
		let now = Utc::now();
		let alert = Alert {
			labels: labels.clone(),
			annotations: LabelSet::new(),
			starts_at: now,
			ends_at: now + chrono::Duration::hours(1),
			updated_at: now,
			generator_url: "http://prom/graph".into(),
			timeout: false,
		};

		let payload = Payload {
			version: PAYLOAD_VERSION,
			group_key: "gk",
			status: AlertStatus::Firing,
			receiver: "team",
			group_labels: &labels,
			common_labels: labels.clone(),
			common_annotations: LabelSet::new(),
			external_url: None,
			alerts: vec![PayloadAlert {
				status: AlertStatus::Firing,
				labels: &alert.labels,
				annotations: &alert.annotations,
				starts_at: alert.starts_at,
				ends_at: alert.ends_at,
				generator_url: &alert.generator_url,
				fingerprint: alert.fingerprint().to_string(),
			}],
			truncated_alerts: 0,
		};

		let json = serde_json::to_value(&payload).unwrap();
		assert_eq!(json["groupKey"], "gk");
		assert_eq!(json["status"], "firing");
		assert!(json["alerts"][0]["startsAt"].is_string());
		assert_eq!(json["truncatedAlerts"], 0);
	}
}
