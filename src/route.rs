//! The routing tree: assigns alerts to receivers with per-route grouping
//! and timing, built once from config and treated as immutable.

use std::time::Duration;

use crate::{
	config::{GROUP_BY_ALL, RouteConfig},
	labels::LabelSet,
	matchers::{Matcher, matches_all},
};

pub const DEFAULT_GROUP_WAIT: Duration = Duration::from_secs(30);
pub const DEFAULT_GROUP_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_REPEAT_INTERVAL: Duration = Duration::from_secs(4 * 3600);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupBy {
	/// The `...` sentinel: every label is a grouping dimension.
	All,
	Labels(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct Route {
	/// Stable identifier: the path of matcher sets from the root, so group
	/// keys survive restarts given the same config.
	pub key: String,
	pub receiver: String,
	pub group_by: GroupBy,
	pub group_wait: Duration,
	pub group_interval: Duration,
	pub repeat_interval: Duration,
	pub matchers: Vec<Matcher>,
	pub continue_matching: bool,
	pub routes: Vec<Route>,
}

impl Route {
	pub fn from_config(config: &RouteConfig) -> Route {
		Self::build(config, None, "{}")
	}

	fn build(config: &RouteConfig, parent: Option<&Route>, key: &str) -> Route {
		let receiver = config
			.receiver
			.clone()
			.or_else(|| parent.map(|p| p.receiver.clone()))
			.unwrap_or_default();

		let group_by = match &config.group_by {
			Some(names) if names.iter().any(|n| n == GROUP_BY_ALL) => GroupBy::All,
			Some(names) => GroupBy::Labels(names.clone()),
			None => parent
				.map(|p| p.group_by.clone())
				.unwrap_or(GroupBy::Labels(Vec::new())),
		};

		let inherited = |own: Option<Duration>, parent_value: fn(&Route) -> Duration, fallback| {
			own.or_else(|| parent.map(parent_value)).unwrap_or(fallback)
		};

		let mut route = Route {
			key: key.to_string(),
			receiver,
			group_by,
			group_wait: inherited(config.group_wait, |p| p.group_wait, DEFAULT_GROUP_WAIT),
			group_interval: inherited(
				config.group_interval,
				|p| p.group_interval,
				DEFAULT_GROUP_INTERVAL,
			),
			repeat_interval: inherited(
				config.repeat_interval,
				|p| p.repeat_interval,
				DEFAULT_REPEAT_INTERVAL,
			),
			matchers: config.matchers.clone(),
			continue_matching: config.continue_matching,
			routes: Vec::new(),
		};

		let children: Vec<Route> = config
			.routes
			.iter()
			.map(|child| {
				let child_key = format!("{}/{}", key, matcher_path(&child.matchers));
				Self::build(child, Some(&route), &child_key)
			})
			.collect();
		route.routes = children;

		route
	}

	/// All routes this label set lands on: the deepest matching routes,
	/// plus following siblings of any matching child marked `continue`.
	pub fn match_labels<'a>(&'a self, labels: &LabelSet) -> Vec<&'a Route> {
		if !matches_all(&self.matchers, labels) {
			return Vec::new();
		}

		let mut all = Vec::new();
		for child in &self.routes {
			let matches = child.match_labels(labels);
			let matched = !matches.is_empty();
			all.extend(matches);
			if matched && !child.continue_matching {
				break;
			}
		}

		if all.is_empty() {
			all.push(self);
		}
		all
	}

	/// The grouping labels of an alert under this route.
	pub fn group_labels(&self, alert_labels: &LabelSet) -> LabelSet {
		match &self.group_by {
			GroupBy::All => alert_labels.clone(),
			GroupBy::Labels(names) => alert_labels.project(names),
		}
	}

	/// Deterministic group identity: route key plus projected label values.
	pub fn group_key(&self, group_labels: &LabelSet) -> String {
		format!("{}:{}", self.key, group_labels)
	}

	/// Depth-first iterator over the whole tree, self first.
	pub fn walk(&self) -> Vec<&Route> {
		let mut out = vec![self];
		for child in &self.routes {
			out.extend(child.walk());
		}
		out
	}
}

fn matcher_path(matchers: &[Matcher]) -> String {
	let parts: Vec<String> = matchers.iter().map(|m| m.to_string()).collect();
	format!("{{{}}}", parts.join(","))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Config;

	fn tree() -> Route {
		let config = Config::from_yaml(
			r#"
route:
  receiver: default
  group_by: [alertname]
  group_wait: 10s
  routes:
    - receiver: pager
      matchers:
        - { name: severity, op: "=", value: critical }
      continue: true
      routes:
        - receiver: db-pager
          matchers:
            - { name: team, op: "=", value: db }
    - receiver: warnings
      group_by: ["..."]
      matchers:
        - { name: severity, op: "=", value: warning }

receivers:
  - name: default
  - name: pager
  - name: db-pager
  - name: warnings
"#,
		)
		.unwrap();
		Route::from_config(&config.route)
	}

	#[test]
	fn unmatched_alert_falls_to_root() {
		let root = tree();
		let labels = LabelSet::from([("alertname", "x")]);
		let routes = root.match_labels(&labels);
		assert_eq!(routes.len(), 1);
		assert_eq!(routes[0].receiver, "default");
	}

	#[test]
	fn deepest_match_wins() {
		let root = tree();
		let labels = LabelSet::from([
			("alertname", "x"),
			("severity", "critical"),
			("team", "db"),
		]);
		let routes = root.match_labels(&labels);
		// critical matches with continue, so the root keeps scanning, but
		// warnings does not match; deepest under pager is db-pager.
		assert_eq!(routes.len(), 1);
		assert_eq!(routes[0].receiver, "db-pager");
	}

	#[test]
	fn continue_collects_siblings() {
		let root = tree();
		let labels = LabelSet::from([("alertname", "x"), ("severity", "critical")]);
		// Make the second sibling match too.
		let labels_warn = LabelSet::from([("alertname", "x"), ("severity", "warning")]);

		let routes = root.match_labels(&labels);
		assert_eq!(routes.len(), 1);
		assert_eq!(routes[0].receiver, "pager");

		let routes = root.match_labels(&labels_warn);
		assert_eq!(routes.len(), 1);
		assert_eq!(routes[0].receiver, "warnings");
	}

	#[test]
	fn timings_inherit_from_parent() {
		let root = tree();
		let pager = &root.routes[0];
		assert_eq!(pager.group_wait, Duration::from_secs(10));
		assert_eq!(pager.group_interval, DEFAULT_GROUP_INTERVAL);
		assert_eq!(pager.receiver, "pager");
	}

	#[test]
	fn group_key_is_stable_and_projected() {
		let root = tree();
		let labels = LabelSet::from([("alertname", "x"), ("pod", "p-123")]);

		let group_labels = root.group_labels(&labels);
		assert_eq!(group_labels.len(), 1);
		assert_eq!(group_labels.get("alertname"), Some("x"));

		let key = root.group_key(&group_labels);
		assert_eq!(key, r#"{}:{alertname="x"}"#);

		// Group-by-all keeps every label.
		let warnings = &root.routes[1];
		let warn_labels = LabelSet::from([("alertname", "x"), ("severity", "warning")]);
		assert_eq!(warnings.group_labels(&warn_labels), warn_labels);
	}

	#[test]
	fn walk_visits_all_routes() {
		let root = tree();
		let receivers: Vec<&str> = root.walk().iter().map(|r| r.receiver.as_str()).collect();
		assert_eq!(receivers, vec!["default", "pager", "db-pager", "warnings"]);
	}
}
