//! Denormalized alert and group status, maintained by the pipeline stages
//! and consulted by the API. Everything here is recomputable from the
//! silence store and inhibition engine; the marker only exists so status
//! reads and repeat flushes skip re-evaluation.

use std::{
	collections::HashMap,
	sync::{Arc, RwLock},
};

use serde::Serialize;

use crate::labels::Fingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
	Unprocessed,
	Active,
	Suppressed,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertMark {
	pub state: AlertState,
	pub silenced_by: Vec<String>,
	pub inhibited_by: Vec<Fingerprint>,
}

impl Default for AlertMark {
	fn default() -> Self {
		Self {
			state: AlertState::Unprocessed,
			silenced_by: Vec::new(),
			inhibited_by: Vec::new(),
		}
	}
}

#[derive(Clone, Default)]
pub struct Marker {
	alerts: Arc<RwLock<HashMap<Fingerprint, AlertMark>>>,
	groups: Arc<RwLock<HashMap<(String, String), bool>>>,
}

impl Marker {
	pub fn new() -> Self {
		Self::default()
	}

	/// Record the muting decision for an alert. Empty silence and inhibition
	/// lists mean the alert is active.
	pub fn set_muted(
		&self,
		fp: Fingerprint,
		silenced_by: Vec<String>,
		inhibited_by: Vec<Fingerprint>,
	) {
		let state = if silenced_by.is_empty() && inhibited_by.is_empty() {
			AlertState::Active
		} else {
			AlertState::Suppressed
		};

		let mut alerts = self.alerts.write().unwrap_or_else(|e| e.into_inner());
		alerts.insert(
			fp,
			AlertMark {
				state,
				silenced_by,
				inhibited_by,
			},
		);
	}

	/// Merge newly observed silence ids into an existing mark, keeping any
	/// inhibition already recorded this flush.
	pub fn set_silenced(&self, fp: Fingerprint, silenced_by: Vec<String>) {
		let mut alerts = self.alerts.write().unwrap_or_else(|e| e.into_inner());
		let mark = alerts.entry(fp).or_default();
		mark.silenced_by = silenced_by;
		mark.state = if mark.silenced_by.is_empty() && mark.inhibited_by.is_empty() {
			AlertState::Active
		} else {
			AlertState::Suppressed
		};
	}

	pub fn set_inhibited(&self, fp: Fingerprint, inhibited_by: Vec<Fingerprint>) {
		let mut alerts = self.alerts.write().unwrap_or_else(|e| e.into_inner());
		let mark = alerts.entry(fp).or_default();
		mark.inhibited_by = inhibited_by;
		mark.state = if mark.silenced_by.is_empty() && mark.inhibited_by.is_empty() {
			AlertState::Active
		} else {
			AlertState::Suppressed
		};
	}

	pub fn status(&self, fp: Fingerprint) -> AlertMark {
		self.alerts
			.read()
			.unwrap_or_else(|e| e.into_inner())
			.get(&fp)
			.cloned()
			.unwrap_or_default()
	}

	pub fn muted(&self, fp: Fingerprint) -> bool {
		self.status(fp).state == AlertState::Suppressed
	}

	pub fn delete(&self, fp: Fingerprint) {
		self.alerts
			.write()
			.unwrap_or_else(|e| e.into_inner())
			.remove(&fp);
	}

	pub fn count(&self, state: AlertState) -> usize {
		self.alerts
			.read()
			.unwrap_or_else(|e| e.into_inner())
			.values()
			.filter(|m| m.state == state)
			.count()
	}

	pub fn set_group_suppressed(&self, group_key: &str, receiver: &str, suppressed: bool) {
		self.groups
			.write()
			.unwrap_or_else(|e| e.into_inner())
			.insert((group_key.to_string(), receiver.to_string()), suppressed);
	}

	pub fn group_suppressed(&self, group_key: &str, receiver: &str) -> bool {
		self.groups
			.read()
			.unwrap_or_else(|e| e.into_inner())
			.get(&(group_key.to_string(), receiver.to_string()))
			.copied()
			.unwrap_or(false)
	}

	pub fn delete_group(&self, group_key: &str) {
		self.groups
			.write()
			.unwrap_or_else(|e| e.into_inner())
			.retain(|(key, _), _| key != group_key);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::labels::LabelSet;

	#[test]
	fn unknown_alert_is_unprocessed() {
		let marker = Marker::new();
		let fp = LabelSet::from([("alertname", "x")]).fingerprint();
		assert_eq!(marker.status(fp).state, AlertState::Unprocessed);
		assert!(!marker.muted(fp));
	}

	#[test]
	fn muting_and_clearing() {
		let marker = Marker::new();
		let fp = LabelSet::from([("alertname", "x")]).fingerprint();

		marker.set_silenced(fp, vec!["abc".into()]);
		assert_eq!(marker.status(fp).state, AlertState::Suppressed);
		assert!(marker.muted(fp));

		marker.set_silenced(fp, vec![]);
		assert_eq!(marker.status(fp).state, AlertState::Active);
	}

	#[test]
	fn inhibition_keeps_silence_marks() {
		let marker = Marker::new();
		let fp = LabelSet::from([("alertname", "x")]).fingerprint();
		let source = LabelSet::from([("alertname", "y")]).fingerprint();

		marker.set_silenced(fp, vec!["abc".into()]);
		marker.set_inhibited(fp, vec![source]);

		let mark = marker.status(fp);
		assert_eq!(mark.state, AlertState::Suppressed);
		assert_eq!(mark.silenced_by, vec!["abc".to_string()]);
		assert_eq!(mark.inhibited_by, vec![source]);
	}

	#[test]
	fn group_flags() {
		let marker = Marker::new();
		marker.set_group_suppressed("{}:{alertname=\"x\"}", "team-email", true);
		assert!(marker.group_suppressed("{}:{alertname=\"x\"}", "team-email"));
		assert!(!marker.group_suppressed("{}:{alertname=\"x\"}", "other"));

		marker.delete_group("{}:{alertname=\"x\"}");
		assert!(!marker.group_suppressed("{}:{alertname=\"x\"}", "team-email"));
	}
}
