//! YAML configuration: global defaults, the routing tree, receivers, and
//! inhibition rules.
//!
//! Durations are written in humantime form (`30s`, `5m`, `4h`). Matchers
//! are structured objects (`{name, op, value}`); there is no string
//! expression syntax here.

use std::{path::Path, time::Duration};

use miette::{Context as _, IntoDiagnostic, Result, miette};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
	error::ValidationError,
	inhibit::InhibitRule,
	labels::is_valid_label_name,
	matchers::Matcher,
};

/// The `group_by` sentinel meaning "group by all labels".
pub const GROUP_BY_ALL: &str = "...";

pub mod humantime_serde {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

	pub fn serialize<S: Serializer>(d: &Duration, ser: S) -> Result<S::Ok, S::Error> {
		ser.collect_str(&humantime::format_duration(*d))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
		let raw = String::deserialize(de)?;
		humantime::parse_duration(&raw).map_err(D::Error::custom)
	}

	pub mod option {
		use super::*;

		pub fn serialize<S: Serializer>(d: &Option<Duration>, ser: S) -> Result<S::Ok, S::Error> {
			match d {
				Some(d) => ser.collect_str(&humantime::format_duration(*d)),
				None => ser.serialize_none(),
			}
		}

		pub fn deserialize<'de, D: Deserializer<'de>>(
			de: D,
		) -> Result<Option<Duration>, D::Error> {
			let raw = Option::<String>::deserialize(de)?;
			raw.map(|s| humantime::parse_duration(&s).map_err(D::Error::custom))
				.transpose()
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
	#[serde(default)]
	pub global: GlobalConfig,

	pub route: RouteConfig,

	pub receivers: Vec<ReceiverConfig>,

	#[serde(default)]
	pub inhibit_rules: Vec<InhibitRuleConfig>,

	/// Paths of tera template files layered over the built-in defaults.
	#[serde(default)]
	pub templates: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
	/// How long an alert without an explicit end keeps firing unless
	/// re-pushed.
	#[serde(with = "humantime_serde", default = "default_resolve_timeout")]
	pub resolve_timeout: Duration,

	/// Upper bound on a single integration call.
	#[serde(with = "humantime_serde", default = "default_notification_timeout")]
	pub notification_timeout: Duration,

	/// Per-position delay in the cluster peer wait stage.
	#[serde(with = "humantime_serde", default = "default_peer_timeout")]
	pub peer_timeout: Duration,

	/// External URL advertised in notification payloads.
	#[serde(default)]
	pub external_url: Option<Url>,

	#[serde(default)]
	pub mailgun: Option<MailgunConfig>,
}

impl Default for GlobalConfig {
	fn default() -> Self {
		Self {
			resolve_timeout: default_resolve_timeout(),
			notification_timeout: default_notification_timeout(),
			peer_timeout: default_peer_timeout(),
			external_url: None,
			mailgun: None,
		}
	}
}

fn default_resolve_timeout() -> Duration {
	Duration::from_secs(5 * 60)
}

fn default_notification_timeout() -> Duration {
	Duration::from_secs(30)
}

fn default_peer_timeout() -> Duration {
	Duration::from_secs(15)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MailgunConfig {
	pub from: String,
	pub api_key: String,
	pub domain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
	/// Receiver name; required on the root route, inherited below.
	#[serde(default)]
	pub receiver: Option<String>,

	/// Label names to group by, or the single sentinel `...` for
	/// group-by-all. Empty means inherit from the parent.
	#[serde(default)]
	pub group_by: Option<Vec<String>>,

	#[serde(default, with = "humantime_serde::option")]
	pub group_wait: Option<Duration>,

	#[serde(default, with = "humantime_serde::option")]
	pub group_interval: Option<Duration>,

	#[serde(default, with = "humantime_serde::option")]
	pub repeat_interval: Option<Duration>,

	#[serde(default)]
	pub matchers: Vec<Matcher>,

	#[serde(default, rename = "continue")]
	pub continue_matching: bool,

	#[serde(default)]
	pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReceiverConfig {
	pub name: String,

	#[serde(default)]
	pub webhook_configs: Vec<WebhookConfig>,

	#[serde(default)]
	pub email_configs: Vec<EmailConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebhookConfig {
	pub url: Url,

	#[serde(default = "default_true")]
	pub send_resolved: bool,

	/// Truncate batches beyond this many alerts; 0 means no limit.
	#[serde(default)]
	pub max_alerts: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmailConfig {
	pub to: Vec<String>,

	#[serde(default)]
	pub send_resolved: bool,

	#[serde(default)]
	pub subject: Option<String>,
}

fn default_true() -> bool {
	true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InhibitRuleConfig {
	pub source_matchers: Vec<Matcher>,
	pub target_matchers: Vec<Matcher>,

	#[serde(default)]
	pub equal: Vec<String>,
}

impl InhibitRuleConfig {
	pub fn build(&self) -> Result<InhibitRule, ValidationError> {
		for name in &self.equal {
			if !is_valid_label_name(name) {
				return Err(ValidationError::InvalidEqualLabel(name.clone()));
			}
		}
		Ok(InhibitRule {
			source_matchers: self.source_matchers.clone(),
			target_matchers: self.target_matchers.clone(),
			equal: self.equal.clone(),
		})
	}
}

impl Config {
	pub fn load(path: &Path) -> Result<Self> {
		let content = std::fs::read_to_string(path)
			.into_diagnostic()
			.wrap_err_with(|| format!("reading config file {}", path.display()))?;
		Self::from_yaml(&content)
	}

	pub fn from_yaml(content: &str) -> Result<Self> {
		let de = serde_yaml::Deserializer::from_str(content);
		let config: Config = serde_path_to_error::deserialize(de)
			.into_diagnostic()
			.wrap_err("parsing config")?;
		config.validate()?;
		Ok(config)
	}

	pub fn validate(&self) -> Result<()> {
		if self.receivers.is_empty() {
			return Err(miette!("at least one receiver must be configured"));
		}

		let mut names = std::collections::HashSet::new();
		for receiver in &self.receivers {
			if !names.insert(receiver.name.as_str()) {
				return Err(ValidationError::DuplicateReceiver(receiver.name.clone()))
					.into_diagnostic();
			}
			if !receiver.email_configs.is_empty() && self.global.mailgun.is_none() {
				return Err(miette!(
					"receiver {:?} has email configs but global.mailgun is not set",
					receiver.name
				));
			}
		}

		let root = &self.route;
		if root.receiver.is_none() {
			return Err(miette!("the root route must name a receiver"));
		}
		if !root.matchers.is_empty() {
			return Err(miette!("the root route must not have matchers"));
		}

		self.validate_route(root)?;
		Ok(())
	}

	fn validate_route(&self, route: &RouteConfig) -> Result<()> {
		if let Some(name) = &route.receiver {
			if !self.receivers.iter().any(|r| &r.name == name) {
				return Err(ValidationError::UnknownReceiver(name.clone())).into_diagnostic();
			}
		}

		if let Some(group_by) = &route.group_by {
			let has_all = group_by.iter().any(|n| n == GROUP_BY_ALL);
			if has_all && group_by.len() > 1 {
				return Err(miette!("group_by cannot mix `...` with label names"));
			}
			if !has_all {
				for name in group_by {
					if !is_valid_label_name(name) {
						return Err(ValidationError::InvalidLabelName(name.clone()))
							.into_diagnostic();
					}
				}
			}
		}

		for child in &route.routes {
			self.validate_route(child)?;
		}
		Ok(())
	}

	pub fn to_json(&self) -> Result<serde_json::Value> {
		serde_json::to_value(self).into_diagnostic()
	}

	pub fn to_yaml(&self) -> Result<String> {
		serde_yaml::to_string(self).into_diagnostic()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const SAMPLE: &str = r#"
global:
  resolve_timeout: 5m
  peer_timeout: 15s

route:
  receiver: team-email
  group_by: [alertname, cluster]
  group_wait: 30s
  group_interval: 5m
  repeat_interval: 4h
  routes:
    - receiver: pager
      matchers:
        - { name: severity, op: "=", value: critical }
      continue: true
    - receiver: team-email
      matchers:
        - { name: team, op: "=~", value: "db|infra" }

receivers:
  - name: team-email
    webhook_configs:
      - url: http://example.org/hook
  - name: pager
    webhook_configs:
      - url: http://example.org/page
        send_resolved: false

inhibit_rules:
  - source_matchers:
      - { name: severity, op: "=", value: critical }
    target_matchers:
      - { name: severity, op: "=", value: warning }
    equal: [cluster]
"#;

	#[test]
	fn parses_sample_config() {
		let config = Config::from_yaml(SAMPLE).unwrap();
		assert_eq!(config.global.resolve_timeout, Duration::from_secs(300));
		assert_eq!(config.route.routes.len(), 2);
		assert!(config.route.routes[0].continue_matching);
		assert_eq!(config.receivers.len(), 2);
		assert_eq!(config.inhibit_rules.len(), 1);
		assert_eq!(
			config.route.group_wait,
			Some(Duration::from_secs(30)),
		);
	}

	#[test]
	fn rejects_unknown_receiver() {
		let bad = SAMPLE.replace("receiver: pager", "receiver: nobody");
		let err = Config::from_yaml(&bad).unwrap_err();
		assert!(err.to_string().contains("unknown receiver"), "{err}");
	}

	#[test]
	fn rejects_matchers_on_root() {
		let bad = r#"
route:
  receiver: x
  matchers:
    - { name: severity, op: "=", value: critical }
receivers:
  - name: x
"#;
		assert!(Config::from_yaml(bad).is_err());
	}

	#[test]
	fn rejects_mixed_group_by_all() {
		let bad = r#"
route:
  receiver: x
  group_by: ["...", alertname]
receivers:
  - name: x
"#;
		assert!(Config::from_yaml(bad).is_err());
	}

	#[test]
	fn group_by_all_sentinel_parses() {
		let yaml = r#"
route:
  receiver: x
  group_by: ["..."]
receivers:
  - name: x
"#;
		let config = Config::from_yaml(yaml).unwrap();
		assert_eq!(
			config.route.group_by,
			Some(vec![GROUP_BY_ALL.to_string()]),
		);
	}

	#[test]
	fn email_requires_mailgun() {
		let bad = r#"
route:
  receiver: mail
receivers:
  - name: mail
    email_configs:
      - to: [ops@example.org]
"#;
		let err = Config::from_yaml(bad).unwrap_err();
		assert!(err.to_string().contains("mailgun"), "{err}");
	}

	#[test]
	fn config_roundtrips_to_yaml_and_json() {
		let config = Config::from_yaml(SAMPLE).unwrap();
		let yaml = config.to_yaml().unwrap();
		let back = Config::from_yaml(&yaml).unwrap();
		assert_eq!(back.receivers.len(), config.receivers.len());

		let json = config.to_json().unwrap();
		assert!(json.get("route").is_some());
	}
}
