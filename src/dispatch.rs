//! The dispatcher: consumes the alert stream, bins alerts into aggregation
//! groups along the routing tree, and drives each group's flush timers.
//!
//! All timers multiplex through one `DelayQueue` on the dispatcher task;
//! no worker is parked per group. Flushes for a single group never
//! overlap: a tick that lands while a flush is in flight re-arms the
//! timer instead of queueing a second run.

use std::{
	collections::HashMap,
	sync::{Arc, RwLock},
	time::Duration,
};

use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::{
	sync::CancellationToken,
	time::{DelayQueue, delay_queue},
};
use tracing::{debug, error, info, trace, warn};

use crate::{
	alerts::{Alert, AlertStore},
	labels::{Fingerprint, LabelSet},
	marker::Marker,
	notify::{NotifyContext, Pipeline},
	route::Route,
};

/// What a group remembers about itself between flushes.
struct Group {
	group_labels: LabelSet,
	receiver: String,
	group_interval: Duration,
	repeat_interval: Duration,
	alerts: HashMap<Fingerprint, Alert>,
	in_flight: bool,
	/// Tick arrived mid-flight; flush again as soon as the outcome lands.
	rearm_asap: bool,
	timer: Option<delay_queue::Key>,
}

/// Introspection row surfaced on the status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupInfo {
	pub group_key: String,
	pub group_labels: LabelSet,
	pub receiver: String,
	pub alerts: usize,
}

struct FlushOutcome {
	group_key: String,
	success: bool,
	/// (fingerprint, was resolved at flush time) for every batched alert.
	batch: Vec<(Fingerprint, bool)>,
}

#[derive(Clone)]
pub struct Dispatcher {
	route: Arc<Route>,
	pipeline: Arc<Pipeline>,
	store: AlertStore,
	marker: Marker,
	cancel: CancellationToken,
	groups_view: Arc<RwLock<HashMap<String, GroupInfo>>>,
}

impl Dispatcher {
	pub fn new(
		route: Arc<Route>,
		pipeline: Arc<Pipeline>,
		store: AlertStore,
		marker: Marker,
		cancel: CancellationToken,
	) -> Self {
		Self {
			route,
			pipeline,
			store,
			marker,
			cancel,
			groups_view: Arc::new(RwLock::new(HashMap::new())),
		}
	}

	/// Snapshot of the live aggregation groups.
	pub fn groups(&self) -> Vec<GroupInfo> {
		let mut rows: Vec<GroupInfo> = self
			.groups_view
			.read()
			.unwrap_or_else(|e| e.into_inner())
			.values()
			.cloned()
			.collect();
		rows.sort_by(|a, b| a.group_key.cmp(&b.group_key));
		rows
	}

	/// Receivers an alert's labels route to; used by the API status view.
	pub fn receivers_for(&self, labels: &LabelSet) -> Vec<String> {
		let mut names: Vec<String> = self
			.route
			.match_labels(labels)
			.iter()
			.map(|r| r.receiver.clone())
			.collect();
		names.sort();
		names.dedup();
		names
	}

	fn publish_view(&self, groups: &HashMap<String, Group>) {
		let view: HashMap<String, GroupInfo> = groups
			.iter()
			.map(|(key, group)| {
				(
					key.clone(),
					GroupInfo {
						group_key: key.clone(),
						group_labels: group.group_labels.clone(),
						receiver: group.receiver.clone(),
						alerts: group.alerts.len(),
					},
				)
			})
			.collect();
		*self.groups_view.write().unwrap_or_else(|e| e.into_inner()) = view;
		crate::metrics::set_aggregation_groups(groups.len());
	}

	/// The dispatcher event loop. Runs until cancelled.
	pub async fn run(&self) {
		let mut groups: HashMap<String, Group> = HashMap::new();
		let mut timers: DelayQueue<String> = DelayQueue::new();
		let (done_tx, mut done_rx) = mpsc::channel::<FlushOutcome>(64);

		let mut sub = self.store.subscribe().await;
		info!("dispatcher started");

		loop {
			tokio::select! {
				() = self.cancel.cancelled() => {
					info!("dispatcher shutting down");
					break;
				}

				maybe = sub.recv() => match maybe {
					Some(alert) => {
						self.on_alert(alert, &mut groups, &mut timers);
						self.publish_view(&groups);
					}
					None => {
						warn!("dispatcher alert subscription lagged, resubscribing");
						sub = self.store.subscribe().await;
					}
				},

				expired = futures::future::poll_fn(|cx| timers.poll_expired(cx)), if !timers.is_empty() => {
					if let Some(expired) = expired {
						let group_key = expired.into_inner();
						self.on_tick(&group_key, &mut groups, &mut timers, &done_tx);
					}
				}

				Some(outcome) = done_rx.recv() => {
					self.on_outcome(outcome, &mut groups, &mut timers);
					self.publish_view(&groups);
				}
			}
		}
	}

	fn on_alert(
		&self,
		alert: Alert,
		groups: &mut HashMap<String, Group>,
		timers: &mut DelayQueue<String>,
	) {
		let routes = self.route.match_labels(&alert.labels);
		if routes.is_empty() {
			// Cannot happen with a matcherless root, but never drop silently.
			error!(labels = %alert.labels, "alert matched no route");
			return;
		}

		for route in routes {
			let group_labels = route.group_labels(&alert.labels);
			let group_key = route.group_key(&group_labels);

			let group = groups.entry(group_key.clone()).or_insert_with(|| {
				debug!(group_key, receiver = route.receiver, "created aggregation group");
				let timer = timers.insert(group_key.clone(), route.group_wait);
				Group {
					group_labels,
					receiver: route.receiver.clone(),
					group_interval: route.group_interval,
					repeat_interval: route.repeat_interval,
					alerts: HashMap::new(),
					in_flight: false,
					rearm_asap: false,
					timer: Some(timer),
				}
			});

			trace!(group_key, fingerprint = %alert.fingerprint(), "alert added to group");
			group.alerts.insert(alert.fingerprint(), alert.clone());
		}
	}

	fn on_tick(
		&self,
		group_key: &str,
		groups: &mut HashMap<String, Group>,
		timers: &mut DelayQueue<String>,
		done_tx: &mpsc::Sender<FlushOutcome>,
	) {
		let Some(group) = groups.get_mut(group_key) else {
			return;
		};
		group.timer = None;

		if group.in_flight {
			// No overlapping flushes for one group key.
			trace!(group_key, "tick during in-flight flush, deferring");
			group.rearm_asap = true;
			return;
		}

		if group.alerts.is_empty() {
			group.timer = Some(timers.insert(group_key.to_string(), group.group_interval));
			return;
		}

		group.in_flight = true;
		let now = Utc::now();
		let batch: Vec<Alert> = group.alerts.values().cloned().collect();
		let fingerprints: Vec<(Fingerprint, bool)> = batch
			.iter()
			.map(|a| (a.fingerprint(), a.resolved_at(now)))
			.collect();

		let ctx = NotifyContext {
			group_key: group_key.to_string(),
			group_labels: group.group_labels.clone(),
			receiver: group.receiver.clone(),
			repeat_interval: group.repeat_interval,
			now,
			cancel: self.cancel.child_token(),
		};

		debug!(
			group_key,
			receiver = ctx.receiver,
			alerts = batch.len(),
			"flushing group"
		);

		let pipeline = self.pipeline.clone();
		let done_tx = done_tx.clone();
		let key = group_key.to_string();
		tokio::spawn(async move {
			// The outcome must reach the dispatcher even if a stage panics,
			// or the group would stay in-flight forever.
			let run = std::panic::AssertUnwindSafe(async {
				match pipeline.process(ctx, batch).await {
					Ok(results) => {
						let mut all_ok = true;
						for rx in results {
							match rx.await {
								Ok(Ok(())) => {}
								Ok(Err(err)) => {
									warn!(group_key = key, "integration failed: {err}");
									all_ok = false;
								}
								Err(_) => {
									// Worker dropped the job without answering.
									all_ok = false;
								}
							}
						}
						all_ok
					}
					Err(err) => {
						warn!(group_key = key, "pipeline run failed: {err}");
						false
					}
				}
			})
			.catch_unwind()
			.await;

			let success = run.unwrap_or_else(|panic| {
				error!(
					group_key = key,
					"pipeline panicked: {}",
					crate::notify::panic_message(&panic)
				);
				false
			});

			let _ = done_tx
				.send(FlushOutcome {
					group_key: key,
					success,
					batch: fingerprints,
				})
				.await;
		});
	}

	fn on_outcome(
		&self,
		outcome: FlushOutcome,
		groups: &mut HashMap<String, Group>,
		timers: &mut DelayQueue<String>,
	) {
		let Some(group) = groups.get_mut(&outcome.group_key) else {
			return;
		};
		group.in_flight = false;

		if outcome.success {
			// Resolved alerts whose resolution was notified leave the
			// group, unless they started firing again since the snapshot.
			for (fp, was_resolved) in &outcome.batch {
				if !was_resolved {
					continue;
				}
				let still_resolved = group
					.alerts
					.get(fp)
					.is_some_and(|a| a.resolved_at(Utc::now()));
				if still_resolved {
					group.alerts.remove(fp);
					self.marker.delete(*fp);
				}
			}
		}

		if group.alerts.is_empty() {
			debug!(group_key = outcome.group_key, "aggregation group emptied, removing");
			if let Some(timer) = group.timer.take() {
				timers.remove(&timer);
			}
			groups.remove(&outcome.group_key);
			self.marker.delete_group(&outcome.group_key);
			return;
		}

		// Failed flushes leave the alerts in place; the next interval tick
		// retries, bounding retry pressure to one attempt per interval.
		let delay = if group.rearm_asap {
			Duration::ZERO
		} else {
			group.group_interval
		};
		group.rearm_asap = false;
		group.timer = Some(timers.insert(outcome.group_key.clone(), delay));
	}
}
