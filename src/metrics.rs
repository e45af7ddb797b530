//! Prometheus metrics for the notifyd daemon.
//!
//! Tracks the following metrics:
//! - `notifyd_alerts_received_total`: alerts accepted at the API, by status
//! - `notifyd_alerts_invalid_total`: alerts rejected at the API
//! - `notifyd_notifications_total`: notification attempts, by integration
//! - `notifyd_notifications_failed_total`: failed attempts, by integration and reason
//! - `notifyd_silences`: silences currently stored (gauge)
//! - `notifyd_nflog_entries`: notification log entries currently stored (gauge)
//! - `notifyd_aggregation_groups`: live aggregation groups (gauge)
//! - `notifyd_alert_subscribers_dropped_total`: slow subscribers dropped
//! - `notifyd_gossip_drops_total`: malformed gossip entries dropped, by channel
//! - `notifyd_cluster_peers`: known cluster peers, self included (gauge)

use std::sync::{Once, OnceLock};

use miette::{IntoDiagnostic, Result};
use prometheus::{
	Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

static INIT: Once = Once::new();
static REGISTRY: OnceLock<Registry> = OnceLock::new();
static ALERTS_RECEIVED: OnceLock<IntCounterVec> = OnceLock::new();
static ALERTS_INVALID: OnceLock<IntCounter> = OnceLock::new();
static NOTIFICATIONS: OnceLock<IntCounterVec> = OnceLock::new();
static NOTIFICATIONS_FAILED: OnceLock<IntCounterVec> = OnceLock::new();
static SILENCES: OnceLock<IntGauge> = OnceLock::new();
static NFLOG_ENTRIES: OnceLock<IntGauge> = OnceLock::new();
static AGGREGATION_GROUPS: OnceLock<IntGauge> = OnceLock::new();
static SUBSCRIBERS_DROPPED: OnceLock<IntCounter> = OnceLock::new();
static GOSSIP_DROPS: OnceLock<IntCounterVec> = OnceLock::new();
static CLUSTER_PEERS: OnceLock<IntGauge> = OnceLock::new();

pub fn init_metrics() {
	INIT.call_once(init_metrics_inner);
}

fn init_metrics_inner() {
	let registry = Registry::new();

	let alerts_received = IntCounterVec::new(
		Opts::new(
			"notifyd_alerts_received_total",
			"Alerts accepted at the API",
		),
		&["status"],
	)
	.expect("failed to create alerts_received metric");

	let alerts_invalid = IntCounter::new(
		"notifyd_alerts_invalid_total",
		"Alerts rejected at the API",
	)
	.expect("failed to create alerts_invalid metric");

	let notifications = IntCounterVec::new(
		Opts::new("notifyd_notifications_total", "Notification attempts"),
		&["integration"],
	)
	.expect("failed to create notifications metric");

	let notifications_failed = IntCounterVec::new(
		Opts::new(
			"notifyd_notifications_failed_total",
			"Failed notification attempts",
		),
		&["integration", "reason"],
	)
	.expect("failed to create notifications_failed metric");

	let silences = IntGauge::new("notifyd_silences", "Silences currently stored")
		.expect("failed to create silences metric");

	let nflog_entries = IntGauge::new(
		"notifyd_nflog_entries",
		"Notification log entries currently stored",
	)
	.expect("failed to create nflog_entries metric");

	let aggregation_groups = IntGauge::new(
		"notifyd_aggregation_groups",
		"Live aggregation groups in the dispatcher",
	)
	.expect("failed to create aggregation_groups metric");

	let subscribers_dropped = IntCounter::new(
		"notifyd_alert_subscribers_dropped_total",
		"Slow alert subscribers dropped",
	)
	.expect("failed to create subscribers_dropped metric");

	let gossip_drops = IntCounterVec::new(
		Opts::new(
			"notifyd_gossip_drops_total",
			"Malformed gossip entries dropped",
		),
		&["channel"],
	)
	.expect("failed to create gossip_drops metric");

	let cluster_peers = IntGauge::new("notifyd_cluster_peers", "Known cluster peers")
		.expect("failed to create cluster_peers metric");

	for metric in [
		Box::new(alerts_received.clone()) as Box<dyn prometheus::core::Collector>,
		Box::new(alerts_invalid.clone()),
		Box::new(notifications.clone()),
		Box::new(notifications_failed.clone()),
		Box::new(silences.clone()),
		Box::new(nflog_entries.clone()),
		Box::new(aggregation_groups.clone()),
		Box::new(subscribers_dropped.clone()),
		Box::new(gossip_drops.clone()),
		Box::new(cluster_peers.clone()),
	] {
		registry
			.register(metric)
			.expect("failed to register metric");
	}

	REGISTRY.set(registry).expect("metrics already initialized");
	ALERTS_RECEIVED
		.set(alerts_received)
		.expect("metrics already initialized");
	ALERTS_INVALID
		.set(alerts_invalid)
		.expect("metrics already initialized");
	NOTIFICATIONS
		.set(notifications)
		.expect("metrics already initialized");
	NOTIFICATIONS_FAILED
		.set(notifications_failed)
		.expect("metrics already initialized");
	SILENCES.set(silences).expect("metrics already initialized");
	NFLOG_ENTRIES
		.set(nflog_entries)
		.expect("metrics already initialized");
	AGGREGATION_GROUPS
		.set(aggregation_groups)
		.expect("metrics already initialized");
	SUBSCRIBERS_DROPPED
		.set(subscribers_dropped)
		.expect("metrics already initialized");
	GOSSIP_DROPS
		.set(gossip_drops)
		.expect("metrics already initialized");
	CLUSTER_PEERS
		.set(cluster_peers)
		.expect("metrics already initialized");
}

pub fn inc_alerts_received(status: &str) {
	if let Some(metric) = ALERTS_RECEIVED.get() {
		metric.with_label_values(&[status]).inc();
	}
}

pub fn inc_alerts_invalid() {
	if let Some(metric) = ALERTS_INVALID.get() {
		metric.inc();
	}
}

pub fn inc_notifications(integration: &str) {
	if let Some(metric) = NOTIFICATIONS.get() {
		metric.with_label_values(&[integration]).inc();
	}
}

pub fn inc_notifications_failed(integration: &str, reason: &str) {
	if let Some(metric) = NOTIFICATIONS_FAILED.get() {
		metric.with_label_values(&[integration, reason]).inc();
	}
}

pub fn set_silences(count: usize) {
	if let Some(metric) = SILENCES.get() {
		metric.set(count as i64);
	}
}

pub fn set_nflog_entries(count: usize) {
	if let Some(metric) = NFLOG_ENTRIES.get() {
		metric.set(count as i64);
	}
}

pub fn set_aggregation_groups(count: usize) {
	if let Some(metric) = AGGREGATION_GROUPS.get() {
		metric.set(count as i64);
	}
}

pub fn inc_subscribers_dropped(count: usize) {
	if let Some(metric) = SUBSCRIBERS_DROPPED.get() {
		metric.inc_by(count as u64);
	}
}

pub fn inc_gossip_drops(channel: &str) {
	if let Some(metric) = GOSSIP_DROPS.get() {
		metric.with_label_values(&[channel]).inc();
	}
}

pub fn set_cluster_peers(count: usize) {
	if let Some(metric) = CLUSTER_PEERS.get() {
		metric.set(count as i64);
	}
}

pub fn gather_metrics() -> Result<String> {
	let registry = REGISTRY
		.get()
		.ok_or_else(|| miette::miette!("metrics not initialized"))?;
	let metric_families = registry.gather();
	let encoder = TextEncoder::new();
	let mut buffer = Vec::new();
	encoder
		.encode(&metric_families, &mut buffer)
		.into_diagnostic()?;
	String::from_utf8(buffer).into_diagnostic()
}
