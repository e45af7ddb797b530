//! Operator-created silences: time-bounded, matcher-defined mutes.
//!
//! The store is replicated across the cluster as a CRDT: state is the set
//! of silences, and merge keeps, per id, the instance with the greater
//! `updated_at`. Writes both mutate local state and broadcast the changed
//! silences; periodic full snapshots flow through the same channel during
//! push-pull reconciliation.

use std::{
	collections::{HashMap, HashSet},
	sync::{Arc, RwLock},
	time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::{
	error::{StoreError, ValidationError},
	labels::LabelSet,
	matchers::{Matcher, matches_all},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Silence {
	pub id: String,
	pub matchers: Vec<Matcher>,
	pub starts_at: DateTime<Utc>,
	pub ends_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	pub created_by: String,
	pub comment: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SilenceState {
	Pending,
	Active,
	Expired,
}

impl Silence {
	pub fn state_at(&self, now: DateTime<Utc>) -> SilenceState {
		if self.ends_at <= now {
			SilenceState::Expired
		} else if self.starts_at > now {
			SilenceState::Pending
		} else {
			SilenceState::Active
		}
	}

	pub fn validate(&self) -> Result<(), ValidationError> {
		if self.matchers.is_empty() {
			return Err(ValidationError::NoMatchers);
		}
		if self.starts_at >= self.ends_at {
			return Err(ValidationError::TimeOrder);
		}
		Ok(())
	}

	/// Whether this silence mutes the given label set at `now`.
	pub fn mutes(&self, labels: &LabelSet, now: DateTime<Utc>) -> bool {
		self.state_at(now) == SilenceState::Active && matches_all(&self.matchers, labels)
	}
}

/// Query predicate for [`SilenceStore::query`].
#[derive(Debug, Default, Clone)]
pub struct SilenceFilter {
	pub ids: Option<Vec<String>>,
	pub states: Option<Vec<SilenceState>>,
	pub matches: Option<LabelSet>,
}

struct Inner {
	silences: HashMap<String, Silence>,
	/// Equality-matcher index: (name, value) of the first non-empty-valued
	/// equality matcher → silence ids. Silences without such a matcher land
	/// in `unindexed` and are always scanned.
	index: HashMap<(String, String), HashSet<String>>,
	unindexed: HashSet<String>,
	last_issued: DateTime<Utc>,
}

impl Inner {
	fn index_key(silence: &Silence) -> Option<(String, String)> {
		silence
			.matchers
			.iter()
			.find(|m| m.is_equality() && !m.value().is_empty())
			.map(|m| (m.name().to_string(), m.value().to_string()))
	}

	fn insert(&mut self, silence: Silence) {
		self.remove_from_index(&silence.id);
		match Self::index_key(&silence) {
			Some(key) => {
				self.index.entry(key).or_default().insert(silence.id.clone());
			}
			None => {
				self.unindexed.insert(silence.id.clone());
			}
		}
		self.silences.insert(silence.id.clone(), silence);
	}

	fn remove_from_index(&mut self, id: &str) {
		if let Some(old) = self.silences.get(id) {
			if let Some(key) = Self::index_key(old) {
				if let Some(set) = self.index.get_mut(&key) {
					set.remove(id);
					if set.is_empty() {
						self.index.remove(&key);
					}
				}
			} else {
				self.unindexed.remove(id);
			}
		}
	}

	/// Timestamps issued by this store strictly increase even if the wall
	/// clock steps backwards, preserving supersede order on a single node.
	fn monotonic_now(&mut self) -> DateTime<Utc> {
		let mut now = Utc::now();
		if now <= self.last_issued {
			now = self.last_issued + chrono::Duration::nanoseconds(1);
		}
		self.last_issued = now;
		now
	}
}

#[derive(Clone)]
pub struct SilenceStore {
	inner: Arc<RwLock<Inner>>,
	broadcast: Arc<RwLock<Option<mpsc::UnboundedSender<Vec<u8>>>>>,
	retention: Duration,
}

impl SilenceStore {
	pub fn new(retention: Duration) -> Self {
		Self {
			inner: Arc::new(RwLock::new(Inner {
				silences: HashMap::new(),
				index: HashMap::new(),
				unindexed: HashSet::new(),
				last_issued: DateTime::<Utc>::MIN_UTC,
			})),
			broadcast: Arc::new(RwLock::new(None)),
			retention,
		}
	}

	/// Register the cluster broadcast channel. Deltas for every local write
	/// are encoded and pushed through it.
	pub fn set_broadcast(&self, tx: mpsc::UnboundedSender<Vec<u8>>) {
		*self.broadcast.write().unwrap_or_else(|e| e.into_inner()) = Some(tx);
	}

	fn gossip(&self, changed: &[Silence]) {
		let guard = self.broadcast.read().unwrap_or_else(|e| e.into_inner());
		if let Some(tx) = guard.as_ref() {
			match bincode::serialize(&changed.to_vec()) {
				Ok(bytes) => {
					let _ = tx.send(bytes);
				}
				Err(err) => warn!("encoding silence delta: {err}"),
			}
		}
	}

	/// Create or supersede a silence, returning the stored id.
	///
	/// An empty id creates a new silence. A non-empty id must refer to an
	/// active or pending silence; the stored silence is expired and a
	/// superseding one (fresh id, fields from the request) is created in
	/// the same step. Expired or unknown ids are `NotFound`; there is no
	/// in-place mutation path.
	pub fn set(&self, mut silence: Silence) -> Result<String, StoreError> {
		silence.validate()?;

		let mut changed = Vec::with_capacity(2);
		let id = {
			let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
			let now = inner.monotonic_now();

			if silence.id.is_empty() {
				silence.id = Uuid::new_v4().to_string();
				silence.updated_at = now;
				debug!(id = %silence.id, "created silence");
			} else {
				let Some(existing) = inner.silences.get(&silence.id).cloned() else {
					return Err(StoreError::NotFound);
				};
				match existing.state_at(now) {
					SilenceState::Expired => return Err(StoreError::NotFound),
					state => {
						silence.id = Uuid::new_v4().to_string();
						silence.updated_at = now;
						if silence.starts_at <= now {
							silence.starts_at = now;
						}
						if silence.ends_at <= silence.starts_at {
							return Err(ValidationError::TimeOrder.into());
						}

						// Expire the original in the same step.
						let mut expired = existing;
						if state == SilenceState::Pending {
							expired.starts_at = now;
						}
						expired.ends_at = now;
						expired.updated_at = now;
						inner.insert(expired.clone());
						changed.push(expired);
						debug!(id = %silence.id, "superseded silence");
					}
				}
			}

			inner.insert(silence.clone());
			changed.push(silence.clone());
			silence.id
		};

		self.gossip(&changed);
		crate::metrics::set_silences(self.count());
		Ok(id)
	}

	/// Expire a silence now. Idempotent on already-expired silences.
	pub fn expire(&self, id: &str) -> Result<(), StoreError> {
		let changed = {
			let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
			let now = inner.monotonic_now();

			let Some(mut silence) = inner.silences.get(id).cloned() else {
				return Err(StoreError::NotFound);
			};

			match silence.state_at(now) {
				SilenceState::Expired => return Ok(()),
				SilenceState::Pending => {
					silence.starts_at = now;
					silence.ends_at = now;
				}
				SilenceState::Active => {
					silence.ends_at = now;
				}
			}
			silence.updated_at = now;
			inner.insert(silence.clone());
			silence
		};

		debug!(id, "expired silence");
		self.gossip(std::slice::from_ref(&changed));
		Ok(())
	}

	pub fn get(&self, id: &str) -> Result<Silence, StoreError> {
		self.inner
			.read()
			.unwrap_or_else(|e| e.into_inner())
			.silences
			.get(id)
			.cloned()
			.ok_or(StoreError::NotFound)
	}

	/// Query silences, sorted within each state: active by `ends_at`
	/// ascending, pending by `starts_at` ascending, expired by `ends_at`
	/// descending; active before pending before expired.
	pub fn query(&self, filter: &SilenceFilter, now: DateTime<Utc>) -> Vec<Silence> {
		let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());

		let mut results: Vec<(SilenceState, Silence)> = inner
			.silences
			.values()
			.filter(|sil| match &filter.ids {
				Some(ids) => ids.iter().any(|id| *id == sil.id),
				None => true,
			})
			.map(|sil| (sil.state_at(now), sil.clone()))
			.filter(|(state, _)| match &filter.states {
				Some(states) => states.contains(state),
				None => true,
			})
			.filter(|(_, sil)| match &filter.matches {
				Some(labels) => matches_all(&sil.matchers, labels),
				None => true,
			})
			.collect();

		results.sort_by(|(sa, a), (sb, b)| {
			fn rank(state: SilenceState) -> u8 {
				match state {
					SilenceState::Active => 0,
					SilenceState::Pending => 1,
					SilenceState::Expired => 2,
				}
			}
			rank(*sa).cmp(&rank(*sb)).then_with(|| match sa {
				SilenceState::Active => a.ends_at.cmp(&b.ends_at),
				SilenceState::Pending => a.starts_at.cmp(&b.starts_at),
				SilenceState::Expired => b.ends_at.cmp(&a.ends_at),
			})
		});

		results.into_iter().map(|(_, sil)| sil).collect()
	}

	/// Whether any active silence mutes the label set, and which.
	pub fn mutes(&self, labels: &LabelSet, now: DateTime<Utc>) -> (bool, Vec<String>) {
		let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());

		let mut candidates: HashSet<&String> = inner.unindexed.iter().collect();
		for (name, value) in labels.iter() {
			if let Some(ids) = inner.index.get(&(name.to_string(), value.to_string())) {
				candidates.extend(ids.iter());
			}
		}

		let mut muting: Vec<String> = candidates
			.into_iter()
			.filter_map(|id| inner.silences.get(id))
			.filter(|sil| sil.mutes(labels, now))
			.map(|sil| sil.id.clone())
			.collect();
		muting.sort();

		(!muting.is_empty(), muting)
	}

	pub fn count(&self) -> usize {
		self.inner
			.read()
			.unwrap_or_else(|e| e.into_inner())
			.silences
			.len()
	}

	/// CRDT merge of a single remote silence. Returns whether local state
	/// changed. Malformed entries are dropped here, after the schema check
	/// that deserialization already performed.
	fn merge_one(&self, remote: Silence) -> bool {
		// Zero-length intervals are legitimate tombstones of expired pending
		// silences, so only inverted intervals are malformed here.
		if remote.id.is_empty() || remote.matchers.is_empty() || remote.starts_at > remote.ends_at {
			warn!(id = %remote.id, "dropping malformed remote silence");
			crate::metrics::inc_gossip_drops("silences");
			return false;
		}

		let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
		let take = match inner.silences.get(&remote.id) {
			None => true,
			Some(local) => {
				remote.updated_at > local.updated_at
					|| (remote.updated_at == local.updated_at
						&& bincode::serialize(&remote).unwrap_or_default()
							> bincode::serialize(local).unwrap_or_default())
			}
		};

		if take {
			// Keep issued timestamps ahead of everything observed, so a
			// local supersede always orders after a merged-in update.
			if remote.updated_at > inner.last_issued {
				inner.last_issued = remote.updated_at;
			}
			trace!(id = %remote.id, "merged remote silence");
			inner.insert(remote);
		}
		take
	}

	/// Decode and merge a remote delta or snapshot. Idempotent and
	/// commutative; re-delivery is harmless.
	pub fn merge_bytes(&self, bytes: &[u8]) -> Result<usize, StoreError> {
		let remote: Vec<Silence> =
			bincode::deserialize(bytes).map_err(|err| StoreError::Decode(err.to_string()))?;
		let merged = remote.into_iter().filter(|s| self.merge_one(s.clone())).count();
		if merged > 0 {
			crate::metrics::set_silences(self.count());
		}
		Ok(merged)
	}

	/// Full-state snapshot for push-pull reconciliation.
	pub fn snapshot_bytes(&self) -> Vec<u8> {
		let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
		let all: Vec<&Silence> = inner.silences.values().collect();
		bincode::serialize(&all).unwrap_or_default()
	}

	/// Drop expired silences past the grace window.
	pub fn gc(&self, now: DateTime<Utc>) -> usize {
		let retention =
			chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::zero());
		let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

		let doomed: Vec<String> = inner
			.silences
			.values()
			.filter(|sil| sil.ends_at + retention <= now)
			.map(|sil| sil.id.clone())
			.collect();

		for id in &doomed {
			inner.remove_from_index(id);
			inner.silences.remove(id);
		}

		if !doomed.is_empty() {
			debug!(removed = doomed.len(), "collected expired silences");
			crate::metrics::set_silences(inner.silences.len());
		}
		doomed.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ts(secs: i64) -> DateTime<Utc> {
		DateTime::from_timestamp(secs, 0).unwrap()
	}

	fn silence(id: &str, start_offset: i64, end_offset: i64) -> Silence {
		let now = Utc::now();
		Silence {
			id: id.to_string(),
			matchers: vec![Matcher::equal("alertname", "x")],
			starts_at: now + chrono::Duration::seconds(start_offset),
			ends_at: now + chrono::Duration::seconds(end_offset),
			updated_at: now,
			created_by: "tester".into(),
			comment: "testing".into(),
		}
	}

	#[test]
	fn set_allocates_id_and_mutes() {
		let store = SilenceStore::new(Duration::from_secs(3600));
		let id = store.set(silence("", -10, 3600)).unwrap();
		assert!(!id.is_empty());

		let labels = LabelSet::from([("alertname", "x"), ("cluster", "A")]);
		let (muted, ids) = store.mutes(&labels, Utc::now());
		assert!(muted);
		assert_eq!(ids, vec![id]);

		let other = LabelSet::from([("alertname", "y")]);
		let (muted, _) = store.mutes(&other, Utc::now());
		assert!(!muted);
	}

	#[test]
	fn pending_silence_does_not_mute() {
		let store = SilenceStore::new(Duration::from_secs(3600));
		store.set(silence("", 600, 3600)).unwrap();

		let labels = LabelSet::from([("alertname", "x")]);
		let (muted, _) = store.mutes(&labels, Utc::now());
		assert!(!muted);
	}

	#[test]
	fn validation_rejects_bad_silences() {
		let store = SilenceStore::new(Duration::from_secs(3600));

		let mut no_matchers = silence("", -10, 3600);
		no_matchers.matchers.clear();
		assert!(store.set(no_matchers).is_err());

		let inverted = silence("", 3600, -10);
		assert!(store.set(inverted).is_err());
	}

	#[test]
	fn supersede_expires_original_and_creates_new() {
		let store = SilenceStore::new(Duration::from_secs(3600));
		let original = store.set(silence("", -10, 3600)).unwrap();

		let mut update = silence(&original, -10, 7200);
		update.comment = "extended".into();
		let superseding = store.set(update).unwrap();
		assert_ne!(superseding, original);

		let now = Utc::now();
		let old = store.get(&original).unwrap();
		assert_eq!(old.state_at(now), SilenceState::Expired);

		let new = store.get(&superseding).unwrap();
		assert_eq!(new.state_at(now), SilenceState::Active);
		assert_eq!(new.comment, "extended");

		// Superseding an expired silence is NotFound.
		assert!(matches!(
			store.set(silence(&original, -10, 7200)),
			Err(StoreError::NotFound)
		));
	}

	#[test]
	fn expire_is_idempotent() {
		let store = SilenceStore::new(Duration::from_secs(3600));
		let id = store.set(silence("", -10, 3600)).unwrap();

		store.expire(&id).unwrap();
		let now = Utc::now() + chrono::Duration::seconds(1);
		assert_eq!(store.get(&id).unwrap().state_at(now), SilenceState::Expired);

		store.expire(&id).unwrap();
		assert!(matches!(store.expire("nope"), Err(StoreError::NotFound)));
	}

	#[test]
	fn query_filters_and_sorts() {
		let store = SilenceStore::new(Duration::from_secs(3600));
		let a = store.set(silence("", -10, 1000)).unwrap();
		let b = store.set(silence("", -10, 500)).unwrap();
		let c = store.set(silence("", 500, 1000)).unwrap();

		let now = Utc::now();
		let all = store.query(&SilenceFilter::default(), now);
		assert_eq!(all.len(), 3);
		// Active sorted by ends_at ascending, then pending.
		assert_eq!(all[0].id, b);
		assert_eq!(all[1].id, a);
		assert_eq!(all[2].id, c);

		let active = store.query(
			&SilenceFilter {
				states: Some(vec![SilenceState::Active]),
				..Default::default()
			},
			now,
		);
		assert_eq!(active.len(), 2);

		let by_id = store.query(
			&SilenceFilter {
				ids: Some(vec![c.clone()]),
				..Default::default()
			},
			now,
		);
		assert_eq!(by_id.len(), 1);
		assert_eq!(by_id[0].id, c);
	}

	#[test]
	fn merge_is_commutative_and_idempotent() {
		let mut sil_a = silence("", -10, 3600);
		sil_a.id = "aaa".into();
		sil_a.updated_at = ts(100);

		let mut sil_b = sil_a.clone();
		sil_b.ends_at = sil_b.starts_at + chrono::Duration::seconds(7200);
		sil_b.updated_at = ts(200);

		let mut sil_c = silence("", -10, 3600);
		sil_c.id = "ccc".into();
		sil_c.updated_at = ts(150);

		let one = SilenceStore::new(Duration::from_secs(3600));
		let two = SilenceStore::new(Duration::from_secs(3600));

		let batch_ab = bincode::serialize(&vec![sil_a.clone(), sil_b.clone()]).unwrap();
		let batch_c = bincode::serialize(&vec![sil_c.clone()]).unwrap();

		one.merge_bytes(&batch_ab).unwrap();
		one.merge_bytes(&batch_c).unwrap();

		two.merge_bytes(&batch_c).unwrap();
		two.merge_bytes(&batch_ab).unwrap();
		// Idempotence: replaying changes nothing.
		assert_eq!(two.merge_bytes(&batch_ab).unwrap(), 0);

		assert_eq!(one.get("aaa").unwrap(), two.get("aaa").unwrap());
		assert_eq!(one.get("ccc").unwrap(), two.get("ccc").unwrap());
		// Greater updated_at won.
		assert_eq!(one.get("aaa").unwrap().updated_at, ts(200));
	}

	#[test]
	fn gc_honors_grace_window() {
		let store = SilenceStore::new(Duration::from_secs(60));
		let id = store.set(silence("", -10, 3600)).unwrap();
		store.expire(&id).unwrap();

		assert_eq!(store.gc(Utc::now()), 0, "still within the grace window");
		assert_eq!(store.gc(Utc::now() + chrono::Duration::seconds(120)), 1);
		assert!(store.get(&id).is_err());
	}

	#[test]
	fn mutes_uses_unindexed_silences_too() {
		let store = SilenceStore::new(Duration::from_secs(3600));
		let mut sil = silence("", -10, 3600);
		sil.matchers = vec![
			Matcher::new("alertname", crate::matchers::MatchOperator::Regex, "x.*").unwrap(),
		];
		store.set(sil).unwrap();

		let labels = LabelSet::from([("alertname", "x1")]);
		let (muted, _) = store.mutes(&labels, Utc::now());
		assert!(muted);
	}
}
