//! The notification log: per-(group, receiver) record of what was last
//! sent, replicated across the cluster so a peer taking over a group does
//! not re-notify within the repeat interval.
//!
//! Entries are immutable once written; merge keeps, per key, the entry
//! with the greater timestamp.

use std::{
	collections::{BTreeSet, HashMap},
	sync::{Arc, RwLock},
	time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::{error::StoreError, labels::Fingerprint};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NflogEntry {
	pub group_key: String,
	pub receiver: String,
	/// Fingerprints of firing alerts at the time of the last send.
	pub firing: BTreeSet<Fingerprint>,
	/// Fingerprints of resolved alerts at the time of the last send.
	pub resolved: BTreeSet<Fingerprint>,
	pub timestamp: DateTime<Utc>,
	pub expires_at: DateTime<Utc>,
}

impl NflogEntry {
	pub fn expired_at(&self, now: DateTime<Utc>) -> bool {
		self.expires_at <= now
	}
}

#[derive(Clone)]
pub struct Nflog {
	entries: Arc<RwLock<HashMap<(String, String), NflogEntry>>>,
	broadcast: Arc<RwLock<Option<mpsc::UnboundedSender<Vec<u8>>>>>,
	retention: Duration,
}

impl Nflog {
	pub fn new(retention: Duration) -> Self {
		Self {
			entries: Arc::new(RwLock::new(HashMap::new())),
			broadcast: Arc::new(RwLock::new(None)),
			retention,
		}
	}

	pub fn set_broadcast(&self, tx: mpsc::UnboundedSender<Vec<u8>>) {
		*self.broadcast.write().unwrap_or_else(|e| e.into_inner()) = Some(tx);
	}

	fn gossip(&self, entry: &NflogEntry) {
		let guard = self.broadcast.read().unwrap_or_else(|e| e.into_inner());
		if let Some(tx) = guard.as_ref() {
			match bincode::serialize(&vec![entry.clone()]) {
				Ok(bytes) => {
					let _ = tx.send(bytes);
				}
				Err(err) => warn!("encoding nflog delta: {err}"),
			}
		}
	}

	/// Record a successful send for (group, receiver).
	pub fn log(
		&self,
		group_key: &str,
		receiver: &str,
		firing: BTreeSet<Fingerprint>,
		resolved: BTreeSet<Fingerprint>,
		now: DateTime<Utc>,
	) {
		let retention =
			chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::zero());
		let entry = NflogEntry {
			group_key: group_key.to_string(),
			receiver: receiver.to_string(),
			firing,
			resolved,
			timestamp: now,
			expires_at: now + retention,
		};

		trace!(group_key, receiver, "recorded notification");
		{
			let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
			entries.insert((entry.group_key.clone(), entry.receiver.clone()), entry.clone());
			crate::metrics::set_nflog_entries(entries.len());
		}
		self.gossip(&entry);
	}

	/// The current entry for (group, receiver), if any.
	pub fn query(&self, group_key: &str, receiver: &str) -> Option<NflogEntry> {
		self.entries
			.read()
			.unwrap_or_else(|e| e.into_inner())
			.get(&(group_key.to_string(), receiver.to_string()))
			.cloned()
	}

	pub fn count(&self) -> usize {
		self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
	}

	fn merge_one(&self, remote: NflogEntry) -> bool {
		if remote.group_key.is_empty() || remote.receiver.is_empty() {
			warn!("dropping malformed remote nflog entry");
			crate::metrics::inc_gossip_drops("nflog");
			return false;
		}

		let key = (remote.group_key.clone(), remote.receiver.clone());
		let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
		let take = match entries.get(&key) {
			None => true,
			Some(local) => remote.timestamp > local.timestamp,
		};
		if take {
			entries.insert(key, remote);
		}
		take
	}

	pub fn merge_bytes(&self, bytes: &[u8]) -> Result<usize, StoreError> {
		let remote: Vec<NflogEntry> =
			bincode::deserialize(bytes).map_err(|err| StoreError::Decode(err.to_string()))?;
		let merged = remote.into_iter().filter(|e| self.merge_one(e.clone())).count();
		if merged > 0 {
			crate::metrics::set_nflog_entries(self.count());
		}
		Ok(merged)
	}

	pub fn snapshot_bytes(&self) -> Vec<u8> {
		let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
		let all: Vec<&NflogEntry> = entries.values().collect();
		bincode::serialize(&all).unwrap_or_default()
	}

	pub fn gc(&self, now: DateTime<Utc>) -> usize {
		let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
		let before = entries.len();
		entries.retain(|_, entry| !entry.expired_at(now));
		let removed = before - entries.len();
		if removed > 0 {
			debug!(removed, "collected expired nflog entries");
			crate::metrics::set_nflog_entries(entries.len());
		}
		removed
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::labels::LabelSet;

	fn fps(names: &[&str]) -> BTreeSet<Fingerprint> {
		names
			.iter()
			.map(|n| LabelSet::from([("alertname", *n)]).fingerprint())
			.collect()
	}

	#[test]
	fn log_then_query_roundtrip() {
		let nflog = Nflog::new(Duration::from_secs(3600));
		let now = Utc::now();

		nflog.log("gk", "email", fps(&["a", "b"]), fps(&[]), now);

		let entry = nflog.query("gk", "email").unwrap();
		assert_eq!(entry.firing, fps(&["a", "b"]));
		assert_eq!(entry.timestamp, now);
		assert!(nflog.query("gk", "webhook").is_none());
		assert!(nflog.query("other", "email").is_none());
	}

	#[test]
	fn newer_entry_wins_merge() {
		let one = Nflog::new(Duration::from_secs(3600));
		let two = Nflog::new(Duration::from_secs(3600));
		let t1 = DateTime::from_timestamp(100, 0).unwrap();
		let t2 = DateTime::from_timestamp(200, 0).unwrap();

		one.log("gk", "email", fps(&["a"]), fps(&[]), t1);
		two.log("gk", "email", fps(&["a", "b"]), fps(&[]), t2);

		// Merge in both directions; both converge on the newer entry.
		one.merge_bytes(&two.snapshot_bytes()).unwrap();
		two.merge_bytes(&one.snapshot_bytes()).unwrap();

		assert_eq!(one.query("gk", "email"), two.query("gk", "email"));
		assert_eq!(one.query("gk", "email").unwrap().timestamp, t2);

		// Idempotent re-merge.
		assert_eq!(one.merge_bytes(&two.snapshot_bytes()).unwrap(), 0);
	}

	#[test]
	fn gc_drops_expired_entries() {
		let nflog = Nflog::new(Duration::from_secs(60));
		let now = Utc::now();

		nflog.log("old", "email", fps(&["a"]), fps(&[]), now - chrono::Duration::seconds(120));
		nflog.log("new", "email", fps(&["b"]), fps(&[]), now);

		assert_eq!(nflog.gc(now), 1);
		assert!(nflog.query("old", "email").is_none());
		assert!(nflog.query("new", "email").is_some());
	}
}
