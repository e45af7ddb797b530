//! The in-memory alert provider.
//!
//! Holds the current alert per fingerprint, merges re-puts of the same
//! alert, and fans incoming alerts out to subscribers (the dispatcher and
//! the inhibition engine). Resolved alerts are garbage collected after a
//! retention period; producers are expected to re-push firing alerts.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, trace, warn};

use crate::{
	error::StoreError,
	labels::{Fingerprint, LabelSet},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
	pub labels: LabelSet,
	pub annotations: LabelSet,
	pub starts_at: DateTime<Utc>,
	pub ends_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	pub generator_url: String,

	/// Whether `ends_at` was synthesized from the resolve timeout rather
	/// than supplied by the producer. A synthesized end never overrides an
	/// explicit one on merge.
	#[serde(default)]
	pub timeout: bool,
}

impl Alert {
	pub fn fingerprint(&self) -> Fingerprint {
		self.labels.fingerprint()
	}

	pub fn resolved_at(&self, now: DateTime<Utc>) -> bool {
		self.ends_at <= now
	}

	pub fn status_at(&self, now: DateTime<Utc>) -> AlertStatus {
		if self.resolved_at(now) {
			AlertStatus::Resolved
		} else {
			AlertStatus::Firing
		}
	}

	/// Merge two instances of the same alert.
	///
	/// The activity interval is the union of both: earliest start, latest
	/// end, except that an explicit end time beats a timeout-synthesized
	/// one. Annotations and the generator URL follow the newer update.
	pub fn merge(&self, other: &Alert) -> Alert {
		debug_assert_eq!(self.fingerprint(), other.fingerprint());

		// Let `newer` be the more recently updated instance.
		let (older, newer) = if self.updated_at <= other.updated_at {
			(self, other)
		} else {
			(other, self)
		};

		let mut merged = newer.clone();
		merged.starts_at = older.starts_at.min(newer.starts_at);

		merged.ends_at = match (older.timeout, newer.timeout) {
			(false, true) => older.ends_at,
			(true, false) => newer.ends_at,
			_ => older.ends_at.max(newer.ends_at),
		};
		merged.timeout = older.timeout && newer.timeout;

		merged
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
	Firing,
	Resolved,
}

struct Subscriber {
	tx: mpsc::Sender<Alert>,
}

/// Fingerprint-keyed store of current alerts with merge-on-put.
#[derive(Clone)]
pub struct AlertStore {
	alerts: Arc<RwLock<HashMap<Fingerprint, Alert>>>,
	subscribers: Arc<RwLock<Vec<Subscriber>>>,
	subscription_buffer: usize,
}

/// A lazy stream of alerts: current actives first, then every future put.
///
/// If the receiver falls behind the buffer, the store drops the
/// subscription and the stream ends; callers treat that as
/// [`StoreError::SubscriberLagged`] and resubscribe.
pub struct AlertSubscription {
	rx: mpsc::Receiver<Alert>,
}

impl AlertSubscription {
	pub async fn recv(&mut self) -> Option<Alert> {
		self.rx.recv().await
	}
}

impl AlertStore {
	pub fn new(subscription_buffer: usize) -> Self {
		Self {
			alerts: Arc::new(RwLock::new(HashMap::new())),
			subscribers: Arc::new(RwLock::new(Vec::new())),
			subscription_buffer,
		}
	}

	/// Insert or merge alerts and broadcast the merged results.
	pub async fn put(&self, incoming: Vec<Alert>) -> Result<(), StoreError> {
		let mut merged_out = Vec::with_capacity(incoming.len());

		{
			let mut alerts = self.alerts.write().await;
			for alert in incoming {
				alert.labels.validate()?;
				let fp = alert.fingerprint();

				let merged = match alerts.get(&fp) {
					Some(existing) => existing.merge(&alert),
					None => alert,
				};
				debug_assert!(merged.starts_at <= merged.ends_at);

				trace!(fingerprint = %fp, labels = %merged.labels, "stored alert");
				alerts.insert(fp, merged.clone());
				merged_out.push(merged);
			}
		}

		self.broadcast(merged_out).await;
		Ok(())
	}

	async fn broadcast(&self, alerts: Vec<Alert>) {
		let mut subs = self.subscribers.write().await;
		let mut dropped = 0;

		for alert in &alerts {
			subs.retain(|sub| match sub.tx.try_send(alert.clone()) {
				Ok(()) => true,
				Err(mpsc::error::TrySendError::Full(_)) => {
					dropped += 1;
					false
				}
				Err(mpsc::error::TrySendError::Closed(_)) => false,
			});
		}

		if dropped > 0 {
			warn!(count = dropped, "dropped slow alert subscribers");
			crate::metrics::inc_subscribers_dropped(dropped);
		}
	}

	pub async fn get(&self, fp: Fingerprint) -> Result<Alert, StoreError> {
		self.alerts
			.read()
			.await
			.get(&fp)
			.cloned()
			.ok_or(StoreError::NotFound)
	}

	/// Snapshot of alerts that have not resolved at `now`.
	pub async fn list_active(&self, now: DateTime<Utc>) -> Vec<Alert> {
		self.alerts
			.read()
			.await
			.values()
			.filter(|a| !a.resolved_at(now))
			.cloned()
			.collect()
	}

	/// Snapshot of every stored alert, resolved ones included.
	pub async fn list_all(&self) -> Vec<Alert> {
		self.alerts.read().await.values().cloned().collect()
	}

	pub async fn count(&self) -> usize {
		self.alerts.read().await.len()
	}

	/// Subscribe to the alert stream. The buffer is sized to hold the
	/// current actives plus headroom for live puts, so the initial replay
	/// cannot itself lag the subscriber out.
	pub async fn subscribe(&self) -> AlertSubscription {
		let now = Utc::now();
		let actives = self.list_active(now).await;
		let (tx, rx) = mpsc::channel(self.subscription_buffer.max(actives.len() + 1));

		for alert in actives {
			// Cannot fail: the channel was sized for the replay.
			let _ = tx.try_send(alert);
		}

		self.subscribers.write().await.push(Subscriber { tx });
		AlertSubscription { rx }
	}

	/// Remove resolved alerts past the retention window. Returns the number
	/// removed.
	pub async fn gc(&self, now: DateTime<Utc>, retention: Duration) -> usize {
		let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::zero());
		let mut alerts = self.alerts.write().await;
		let before = alerts.len();
		alerts.retain(|_, alert| !alert.resolved_at(now) || alert.ends_at + retention > now);
		let removed = before - alerts.len();
		if removed > 0 {
			debug!(removed, remaining = alerts.len(), "collected resolved alerts");
		}
		removed
	}
}
