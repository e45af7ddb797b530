//! Notification message rendering.
//!
//! A tera context is built per (group, receiver) batch; integrations pick
//! the templates they need from it. User template files layer over the
//! built-in defaults.

use chrono::{DateTime, Utc};
use miette::{Context as _, IntoDiagnostic, Result};
use serde::Serialize;
use sysinfo::System;
use tera::{Context as TeraCtx, Tera};
use tracing::instrument;

use crate::alerts::{Alert, AlertStatus};

pub const SUBJECT_TEMPLATE: &str = "subject";
pub const BODY_TEMPLATE: &str = "body";

const DEFAULT_SUBJECT: &str =
	"[{{ status | upper }}{% if firing %}:{{ firing | length }}{% endif %}] \
	 {{ group_key }} ({{ hostname }})";

const DEFAULT_BODY: &str = r#"{% if firing %}## Firing

{% for alert in firing %}- {{ alert.labels_line }}{% if alert.summary %}: {{ alert.summary }}{% endif %}
{% endfor %}{% endif %}{% if resolved %}
## Resolved

{% for alert in resolved %}- {{ alert.labels_line }}
{% endfor %}{% endif %}
{% if external_url %}Sent by [notifyd]({{ external_url }}).{% endif %}
"#;

#[derive(Debug, Serialize)]
pub struct TemplateAlert {
	pub status: AlertStatus,
	pub labels_line: String,
	pub summary: Option<String>,
	pub starts_at: DateTime<Utc>,
	pub ends_at: DateTime<Utc>,
	pub generator_url: String,
}

impl TemplateAlert {
	fn from_alert(alert: &Alert, now: DateTime<Utc>) -> Self {
		Self {
			status: alert.status_at(now),
			labels_line: alert.labels.to_string(),
			summary: alert.annotations.get("summary").map(str::to_string),
			starts_at: alert.starts_at,
			ends_at: alert.ends_at,
			generator_url: alert.generator_url.clone(),
		}
	}
}

/// Built-in templates plus any user template files.
pub fn load_templates(paths: &[String]) -> Result<Tera> {
	let mut tera = Tera::default();
	tera.add_raw_template(SUBJECT_TEMPLATE, DEFAULT_SUBJECT)
		.into_diagnostic()
		.wrap_err("compiling default subject template")?;
	tera.add_raw_template(BODY_TEMPLATE, DEFAULT_BODY)
		.into_diagnostic()
		.wrap_err("compiling default body template")?;

	for path in paths {
		let content = std::fs::read_to_string(path)
			.into_diagnostic()
			.wrap_err_with(|| format!("reading template {path}"))?;
		let name = std::path::Path::new(path)
			.file_stem()
			.map(|s| s.to_string_lossy().to_string())
			.unwrap_or_else(|| path.clone());
		tera.add_raw_template(&name, &content)
			.into_diagnostic()
			.wrap_err_with(|| format!("compiling template {path}"))?;
	}

	Ok(tera)
}

#[instrument(skip_all)]
pub fn build_context(
	group_key: &str,
	receiver: &str,
	alerts: &[Alert],
	external_url: Option<&url::Url>,
	now: DateTime<Utc>,
) -> TeraCtx {
	let (firing, resolved): (Vec<&Alert>, Vec<&Alert>) =
		alerts.iter().partition(|a| !a.resolved_at(now));

	let status = if firing.is_empty() {
		AlertStatus::Resolved
	} else {
		AlertStatus::Firing
	};

	let mut context = TeraCtx::new();
	context.insert("group_key", group_key);
	context.insert("receiver", receiver);
	context.insert("status", &status);
	context.insert(
		"firing",
		&firing
			.iter()
			.map(|a| TemplateAlert::from_alert(a, now))
			.collect::<Vec<_>>(),
	);
	context.insert(
		"resolved",
		&resolved
			.iter()
			.map(|a| TemplateAlert::from_alert(a, now))
			.collect::<Vec<_>>(),
	);
	context.insert("external_url", &external_url.map(url::Url::to_string));
	context.insert(
		"hostname",
		System::host_name().as_deref().unwrap_or("unknown"),
	);
	context.insert("now", &now.to_rfc3339());

	context
}

pub fn render_message(tera: &Tera, context: &TeraCtx, subject_override: Option<&str>) -> Result<(String, String)> {
	let subject = match subject_override {
		Some(template) => {
			let mut scratch = Tera::default();
			scratch
				.add_raw_template(SUBJECT_TEMPLATE, template)
				.into_diagnostic()
				.wrap_err("compiling subject override")?;
			scratch
				.render(SUBJECT_TEMPLATE, context)
				.into_diagnostic()
				.wrap_err("rendering subject override")?
		}
		None => tera
			.render(SUBJECT_TEMPLATE, context)
			.into_diagnostic()
			.wrap_err("rendering subject")?,
	};

	let body = tera
		.render(BODY_TEMPLATE, context)
		.into_diagnostic()
		.wrap_err("rendering body")?;

	Ok((subject, body))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::labels::LabelSet;

	fn alert(name: &str, resolved: bool) -> Alert {
		let now = Utc::now();
		Alert {
			labels: LabelSet::from([("alertname", name)]),
			annotations: LabelSet::from([("summary", "something is up")]),
			starts_at: now - chrono::Duration::seconds(60),
			ends_at: if resolved {
				now - chrono::Duration::seconds(1)
			} else {
				now + chrono::Duration::seconds(3600)
			},
			updated_at: now,
			generator_url: String::new(),
			timeout: false,
		}
	}

	#[test]
	fn default_templates_render() {
		let tera = load_templates(&[]).unwrap();
		let alerts = vec![alert("x", false), alert("y", true)];
		let context = build_context("{}:{alertname=\"x\"}", "team", &alerts, None, Utc::now());

		let (subject, body) = render_message(&tera, &context, None).unwrap();
		assert!(subject.contains("FIRING:1"), "subject: {subject}");
		assert!(body.contains("## Firing"), "body: {body}");
		assert!(body.contains("## Resolved"), "body: {body}");
		assert!(body.contains("something is up"), "body: {body}");
	}

	#[test]
	fn all_resolved_renders_resolved_status() {
		let tera = load_templates(&[]).unwrap();
		let alerts = vec![alert("x", true)];
		let context = build_context("gk", "team", &alerts, None, Utc::now());

		let (subject, body) = render_message(&tera, &context, None).unwrap();
		assert!(subject.starts_with("[RESOLVED]"), "subject: {subject}");
		assert!(!body.contains("## Firing"), "body: {body}");
	}

	#[test]
	fn subject_override_is_used() {
		let tera = load_templates(&[]).unwrap();
		let context = build_context("gk", "team", &[alert("x", false)], None, Utc::now());

		let (subject, _) = render_message(&tera, &context, Some("custom {{ receiver }}")).unwrap();
		assert_eq!(subject, "custom team");
	}
}
