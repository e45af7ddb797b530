//! Inhibition: muting one class of alerts while another is firing.
//!
//! Each rule keeps a cache of currently-firing source alerts, fed by a
//! subscription on the alert provider, so the per-target question "is any
//! firing source inhibiting this?" only scans candidates that already
//! matched the rule's source matchers.

use std::{
	collections::HashMap,
	sync::{Arc, RwLock},
};

use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};

use crate::{
	alerts::{Alert, AlertStore},
	labels::{Fingerprint, LabelSet},
	matchers::{Matcher, matches_all},
};

#[derive(Debug, Clone)]
pub struct InhibitRule {
	pub source_matchers: Vec<Matcher>,
	pub target_matchers: Vec<Matcher>,
	pub equal: Vec<String>,
}

struct RuleState {
	rule: InhibitRule,
	/// Firing alerts that matched the source matchers.
	sources: RwLock<HashMap<Fingerprint, Alert>>,
}

impl RuleState {
	/// Source fingerprints inhibiting `labels` at `now`: cached sources
	/// still firing whose equal-labels agree with the target. An alert
	/// never inhibits itself.
	fn inhibiting_sources(&self, labels: &LabelSet, now: DateTime<Utc>) -> Vec<Fingerprint> {
		let target_fp = labels.fingerprint();
		let sources = self.sources.read().unwrap_or_else(|e| e.into_inner());
		sources
			.values()
			.filter(|source| !source.resolved_at(now))
			.filter(|source| source.fingerprint() != target_fp)
			.filter(|source| {
				self.rule
					.equal
					.iter()
					.all(|name| source.labels.get(name) == labels.get(name))
			})
			.map(|source| source.fingerprint())
			.collect()
	}

	fn observe(&self, alert: &Alert, now: DateTime<Utc>) {
		if !matches_all(&self.rule.source_matchers, &alert.labels) {
			return;
		}
		let mut sources = self.sources.write().unwrap_or_else(|e| e.into_inner());
		if alert.resolved_at(now) {
			sources.remove(&alert.fingerprint());
		} else {
			sources.insert(alert.fingerprint(), alert.clone());
		}
	}

	fn gc(&self, now: DateTime<Utc>) {
		let mut sources = self.sources.write().unwrap_or_else(|e| e.into_inner());
		sources.retain(|_, alert| !alert.resolved_at(now));
	}
}

#[derive(Clone)]
pub struct Inhibitor {
	rules: Arc<RwLock<Arc<Vec<Arc<RuleState>>>>>,
}

impl Inhibitor {
	pub fn new(rules: Vec<InhibitRule>) -> Self {
		Self {
			rules: Arc::new(RwLock::new(Arc::new(Self::build(rules)))),
		}
	}

	fn build(rules: Vec<InhibitRule>) -> Vec<Arc<RuleState>> {
		rules
			.into_iter()
			.map(|rule| {
				Arc::new(RuleState {
					rule,
					sources: RwLock::new(HashMap::new()),
				})
			})
			.collect()
	}

	/// Swap in a new rule set atomically. In-flight evaluations keep using
	/// the set they grabbed; source caches refill from the subscription.
	pub fn set_rules(&self, rules: Vec<InhibitRule>) {
		let built = Arc::new(Self::build(rules));
		*self.rules.write().unwrap_or_else(|e| e.into_inner()) = built;
		debug!("swapped inhibition rules");
	}

	fn snapshot(&self) -> Arc<Vec<Arc<RuleState>>> {
		self.rules.read().unwrap_or_else(|e| e.into_inner()).clone()
	}

	/// Whether `labels` is inhibited at `now`, and by which source alerts.
	pub fn mutes(&self, labels: &LabelSet, now: DateTime<Utc>) -> (bool, Vec<Fingerprint>) {
		let rules = self.snapshot();
		let mut inhibiting = Vec::new();
		for state in rules.iter() {
			if !matches_all(&state.rule.target_matchers, labels) {
				continue;
			}
			inhibiting.extend(state.inhibiting_sources(labels, now));
		}
		inhibiting.sort();
		inhibiting.dedup();
		(!inhibiting.is_empty(), inhibiting)
	}

	/// Consume the alert stream, keeping the per-rule source caches
	/// current. Resubscribes if the store drops us for lagging.
	pub async fn run(&self, store: AlertStore) {
		loop {
			let mut sub = store.subscribe().await;
			debug!("inhibitor subscribed to alerts");

			while let Some(alert) = sub.recv().await {
				let now = Utc::now();
				trace!(fingerprint = %alert.fingerprint(), "inhibitor observed alert");
				let rules = self.snapshot();
				for state in rules.iter() {
					state.observe(&alert, now);
				}
			}

			warn!("inhibitor subscription lagged, resubscribing");
		}
	}

	/// Drop resolved sources from every rule cache.
	pub fn gc(&self, now: DateTime<Utc>) {
		let rules = self.snapshot();
		for state in rules.iter() {
			state.gc(now);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn firing(labels: LabelSet) -> Alert {
		let now = Utc::now();
		Alert {
			labels,
			annotations: LabelSet::new(),
			starts_at: now - chrono::Duration::seconds(60),
			ends_at: now + chrono::Duration::seconds(3600),
			updated_at: now,
			generator_url: String::new(),
			timeout: false,
		}
	}

	fn rule() -> InhibitRule {
		InhibitRule {
			source_matchers: vec![Matcher::equal("severity", "critical")],
			target_matchers: vec![Matcher::equal("severity", "warning")],
			equal: vec!["cluster".into()],
		}
	}

	fn inhibitor_with_source(labels: LabelSet) -> Inhibitor {
		let inhibitor = Inhibitor::new(vec![rule()]);
		let rules = inhibitor.snapshot();
		rules[0].observe(&firing(labels), Utc::now());
		inhibitor
	}

	#[test]
	fn source_mutes_matching_target() {
		let source = LabelSet::from([("severity", "critical"), ("cluster", "A")]);
		let inhibitor = inhibitor_with_source(source.clone());

		let target = LabelSet::from([("severity", "warning"), ("cluster", "A")]);
		let (muted, sources) = inhibitor.mutes(&target, Utc::now());
		assert!(muted);
		assert_eq!(sources, vec![source.fingerprint()]);
	}

	#[test]
	fn equal_labels_must_agree() {
		let source = LabelSet::from([("severity", "critical"), ("cluster", "A")]);
		let inhibitor = inhibitor_with_source(source);

		let target = LabelSet::from([("severity", "warning"), ("cluster", "B")]);
		let (muted, _) = inhibitor.mutes(&target, Utc::now());
		assert!(!muted);
	}

	#[test]
	fn resolved_source_stops_inhibiting() {
		let source_labels = LabelSet::from([("severity", "critical"), ("cluster", "A")]);
		let inhibitor = inhibitor_with_source(source_labels.clone());
		let target = LabelSet::from([("severity", "warning"), ("cluster", "A")]);

		let mut resolved = firing(source_labels);
		resolved.ends_at = Utc::now() - chrono::Duration::seconds(1);
		let rules = inhibitor.snapshot();
		rules[0].observe(&resolved, Utc::now());

		let (muted, _) = inhibitor.mutes(&target, Utc::now());
		assert!(!muted);
	}

	#[test]
	fn alert_does_not_inhibit_itself() {
		// A rule where source and target matchers overlap.
		let rule = InhibitRule {
			source_matchers: vec![Matcher::equal("severity", "critical")],
			target_matchers: vec![Matcher::equal("severity", "critical")],
			equal: vec![],
		};
		let inhibitor = Inhibitor::new(vec![rule]);
		let labels = LabelSet::from([("severity", "critical")]);
		let rules = inhibitor.snapshot();
		rules[0].observe(&firing(labels.clone()), Utc::now());

		let (muted, _) = inhibitor.mutes(&labels, Utc::now());
		assert!(!muted);
	}

	#[test]
	fn rule_swap_clears_caches() {
		let source = LabelSet::from([("severity", "critical"), ("cluster", "A")]);
		let inhibitor = inhibitor_with_source(source);
		let target = LabelSet::from([("severity", "warning"), ("cluster", "A")]);

		inhibitor.set_rules(vec![rule()]);
		let (muted, _) = inhibitor.mutes(&target, Utc::now());
		assert!(!muted, "fresh rule set starts with an empty source cache");
	}
}
