//! The notification pipeline: the staged transformation that decides
//! whether and when a batch of alerts is transmitted to a receiver.
//!
//! Entry stages (resolved filter, inhibition, silencing) run in the flush
//! task; the fanout then hands one job per receiver integration to a
//! persistent worker, which serializes peer wait, dedup, retry, and the
//! notification log write for its integration.

use std::{
	collections::{BTreeSet, HashMap},
	sync::Arc,
	time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
	alerts::Alert,
	error::{FailureReason, NotifyError},
	inhibit::Inhibitor,
	labels::{Fingerprint, LabelSet},
	marker::Marker,
	nflog::{Nflog, NflogEntry},
	silences::SilenceStore,
};

pub mod email;
pub mod webhook;

const RETRY_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const RETRY_MAX_BACKOFF: Duration = Duration::from_secs(30);
const MIN_PIPELINE_DEADLINE: Duration = Duration::from_secs(10);

/// Everything a stage needs to know about the batch it is processing.
#[derive(Debug, Clone)]
pub struct NotifyContext {
	pub group_key: String,
	pub group_labels: LabelSet,
	pub receiver: String,
	pub repeat_interval: Duration,
	pub now: DateTime<Utc>,
	pub cancel: CancellationToken,
}

impl NotifyContext {
	/// The overall deadline for one pipeline run: the smaller of the
	/// repeat interval and the notification timeout, floored at 10s.
	pub fn deadline(&self, notification_timeout: Duration) -> Duration {
		self.repeat_interval.min(notification_timeout).max(MIN_PIPELINE_DEADLINE)
	}
}

/// The narrow interface each concrete integration implements.
#[async_trait]
pub trait Notifier: Send + Sync {
	/// The integration kind, used as the metrics label.
	fn kind(&self) -> &'static str;

	async fn notify(&self, ctx: &NotifyContext, alerts: &[Alert]) -> Result<(), NotifyError>;
}

/// One configured integration instance inside a receiver.
#[derive(Clone)]
pub struct Integration {
	pub name: String,
	pub send_resolved: bool,
	pub notifier: Arc<dyn Notifier>,
}

/// A named receiver: a fanout of integrations.
#[derive(Clone)]
pub struct Receiver {
	pub name: String,
	pub integrations: Vec<Integration>,
}

/// A pipeline stage transforms (context, batch), possibly dropping alerts.
#[async_trait]
pub trait Stage: Send + Sync {
	async fn exec(
		&self,
		ctx: &NotifyContext,
		alerts: Vec<Alert>,
	) -> Result<Vec<Alert>, NotifyError>;
}

/// Drops alerts resolved so long ago they are past notification interest.
pub struct ResolvedFilterStage {
	pub retention: Duration,
}

#[async_trait]
impl Stage for ResolvedFilterStage {
	async fn exec(
		&self,
		ctx: &NotifyContext,
		alerts: Vec<Alert>,
	) -> Result<Vec<Alert>, NotifyError> {
		let retention =
			chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::zero());
		Ok(alerts
			.into_iter()
			.filter(|a| !a.resolved_at(ctx.now) || a.ends_at + retention > ctx.now)
			.collect())
	}
}

/// Drops alerts muted by the inhibition engine; updates the marker.
pub struct InhibitStage {
	pub inhibitor: Inhibitor,
	pub marker: Marker,
}

#[async_trait]
impl Stage for InhibitStage {
	async fn exec(
		&self,
		ctx: &NotifyContext,
		alerts: Vec<Alert>,
	) -> Result<Vec<Alert>, NotifyError> {
		Ok(alerts
			.into_iter()
			.filter(|alert| {
				let fp = alert.fingerprint();
				let (muted, sources) = self.inhibitor.mutes(&alert.labels, ctx.now);
				self.marker.set_inhibited(fp, sources);
				if muted {
					trace!(fingerprint = %fp, "alert inhibited");
				}
				!muted
			})
			.collect())
	}
}

/// Drops alerts muted by active silences; updates the marker.
pub struct SilenceStage {
	pub silences: SilenceStore,
	pub marker: Marker,
}

#[async_trait]
impl Stage for SilenceStage {
	async fn exec(
		&self,
		ctx: &NotifyContext,
		alerts: Vec<Alert>,
	) -> Result<Vec<Alert>, NotifyError> {
		Ok(alerts
			.into_iter()
			.filter(|alert| {
				let fp = alert.fingerprint();
				let (muted, ids) = self.silences.mutes(&alert.labels, ctx.now);
				self.marker.set_silenced(fp, ids);
				if muted {
					trace!(fingerprint = %fp, "alert silenced");
				}
				!muted
			})
			.collect())
	}
}

/// Split a batch into firing and resolved fingerprint sets.
fn partition_fingerprints(
	alerts: &[Alert],
	now: DateTime<Utc>,
) -> (BTreeSet<Fingerprint>, BTreeSet<Fingerprint>) {
	let mut firing = BTreeSet::new();
	let mut resolved = BTreeSet::new();
	for alert in alerts {
		if alert.resolved_at(now) {
			resolved.insert(alert.fingerprint());
		} else {
			firing.insert(alert.fingerprint());
		}
	}
	(firing, resolved)
}

/// The dedup decision: whether this batch warrants a send given the last
/// recorded notification for (group, receiver).
pub fn needs_update(
	entry: Option<&NflogEntry>,
	firing: &BTreeSet<Fingerprint>,
	resolved: &BTreeSet<Fingerprint>,
	send_resolved: bool,
	repeat_interval: Duration,
	now: DateTime<Utc>,
) -> bool {
	let Some(entry) = entry else {
		return true;
	};
	if entry.expired_at(now) {
		return true;
	}
	if entry.firing != *firing {
		return true;
	}
	if send_resolved && resolved.difference(&entry.resolved).next().is_some() {
		return true;
	}
	let repeat =
		chrono::Duration::from_std(repeat_interval).unwrap_or(chrono::Duration::MAX);
	now - entry.timestamp >= repeat
}

/// Call the integration, retrying transient failures with exponential
/// backoff until the run deadline.
async fn retry_notify(
	integration: &Integration,
	ctx: &NotifyContext,
	alerts: &[Alert],
	deadline: Duration,
) -> Result<(), NotifyError> {
	let started = tokio::time::Instant::now();
	let mut backoff = RETRY_INITIAL_BACKOFF;
	let mut attempt = 0u32;

	loop {
		if ctx.cancel.is_cancelled() {
			return Err(NotifyError::canceled());
		}

		attempt += 1;
		crate::metrics::inc_notifications(integration.notifier.kind());

		let remaining = deadline.saturating_sub(started.elapsed());
		if remaining.is_zero() {
			return Err(NotifyError::deadline());
		}

		let outcome = tokio::select! {
			res = integration.notifier.notify(ctx, alerts) => res,
			() = ctx.cancel.cancelled() => return Err(NotifyError::canceled()),
			() = tokio::time::sleep(remaining) => Err(NotifyError::deadline()),
		};

		match outcome {
			Ok(()) => {
				if attempt > 1 {
					info!(
						integration = integration.name,
						attempt, "notification succeeded after retries"
					);
				}
				return Ok(());
			}
			Err(err) if err.retry => {
				crate::metrics::inc_notifications_failed(
					integration.notifier.kind(),
					err.reason.as_str(),
				);
				warn!(
					integration = integration.name,
					attempt, "retrying notification: {err}"
				);

				let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 4);
				let pause = backoff + Duration::from_millis(jitter);
				let remaining = deadline.saturating_sub(started.elapsed());
				if pause >= remaining {
					return Err(NotifyError::deadline());
				}

				tokio::select! {
					() = tokio::time::sleep(pause) => {}
					() = ctx.cancel.cancelled() => return Err(NotifyError::canceled()),
				}
				backoff = (backoff * 2).min(RETRY_MAX_BACKOFF);
			}
			Err(err) => {
				crate::metrics::inc_notifications_failed(
					integration.notifier.kind(),
					err.reason.as_str(),
				);
				return Err(err);
			}
		}
	}
}

/// Best-effort extraction of a panic payload for the log line.
pub(crate) fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
	if let Some(s) = panic.downcast_ref::<&str>() {
		(*s).to_string()
	} else if let Some(s) = panic.downcast_ref::<String>() {
		s.clone()
	} else {
		"unknown panic".to_string()
	}
}

/// A unit of work for an integration worker: one (group, receiver) batch
/// that has already passed the entry stages and the peer wait.
pub struct FlushJob {
	pub ctx: NotifyContext,
	pub alerts: Vec<Alert>,
	pub done: oneshot::Sender<Result<(), NotifyError>>,
}

/// Handle to a persistent worker serializing sends for one integration.
#[derive(Clone)]
pub struct IntegrationWorker {
	pub integration_name: String,
	tx: mpsc::Sender<FlushJob>,
}

impl IntegrationWorker {
	/// Spawn the worker task. The inbox is bounded; a full queue surfaces
	/// as an error to the flush, which retries on the next tick.
	pub fn spawn(
		integration: Integration,
		nflog: Nflog,
		marker: Marker,
		notification_timeout: Duration,
		queue_size: usize,
	) -> Self {
		let (tx, mut rx) = mpsc::channel::<FlushJob>(queue_size);
		let name = integration.name.clone();

		tokio::spawn(async move {
			while let Some(job) = rx.recv().await {
				// A panicking notifier must not take the worker down; it is
				// logged and reported as an internal failure instead.
				let result = std::panic::AssertUnwindSafe(Self::process(
					&integration,
					&nflog,
					&marker,
					notification_timeout,
					&job,
				))
				.catch_unwind()
				.await
				.unwrap_or_else(|panic| {
					error!(
						integration = integration.name,
						group_key = job.ctx.group_key,
						"notifier panicked: {}",
						panic_message(&panic)
					);
					crate::metrics::inc_notifications_failed(
						integration.notifier.kind(),
						FailureReason::Other.as_str(),
					);
					Err(NotifyError::permanent(
						FailureReason::Other,
						"notifier panicked",
					))
				});

				if let Err(err) = &result {
					debug!(
						integration = integration.name,
						group_key = job.ctx.group_key,
						"notification attempt failed: {err}"
					);
				}
				let _ = job.done.send(result);
			}
		});

		Self {
			integration_name: name,
			tx,
		}
	}

	/// Dedup, retry, and record. The peer wait has already elapsed in the
	/// flush task before the job was enqueued here.
	async fn process(
		integration: &Integration,
		nflog: &Nflog,
		marker: &Marker,
		notification_timeout: Duration,
		job: &FlushJob,
	) -> Result<(), NotifyError> {
		let ctx = &job.ctx;
		let now = Utc::now();
		let (firing, resolved) = partition_fingerprints(&job.alerts, now);

		// The notification log is keyed per integration so two
		// integrations of one receiver keep independent dedup records.
		let log_receiver = format!("{}/{}", ctx.receiver, integration.name);
		let entry = nflog.query(&ctx.group_key, &log_receiver);
		if !needs_update(
			entry.as_ref(),
			&firing,
			&resolved,
			integration.send_resolved,
			ctx.repeat_interval,
			now,
		) {
			trace!(
				group_key = ctx.group_key,
				receiver = ctx.receiver,
				"deduplicated notification"
			);
			return Ok(());
		}

		// Integrations that do not send resolved notifications still log
		// them, so a later firing change is computed against full state.
		let batch: Vec<Alert> = if integration.send_resolved {
			job.alerts.clone()
		} else {
			job.alerts
				.iter()
				.filter(|a| !a.resolved_at(now))
				.cloned()
				.collect()
		};

		if !batch.is_empty() {
			let deadline = ctx.deadline(notification_timeout);
			retry_notify(integration, ctx, &batch, deadline).await?;
			info!(
				group_key = ctx.group_key,
				receiver = ctx.receiver,
				integration = integration.name,
				firing = firing.len(),
				resolved = resolved.len(),
				"notification sent"
			);
		}

		if ctx.cancel.is_cancelled() {
			// A cancelled pipeline writes no notification log entry.
			return Err(NotifyError::canceled());
		}

		nflog.log(&ctx.group_key, &log_receiver, firing, resolved, Utc::now());
		marker.set_group_suppressed(&ctx.group_key, &ctx.receiver, false);
		Ok(())
	}

	/// Bounded enqueue; a full inbox is backpressure, not a hang.
	pub fn try_enqueue(&self, job: FlushJob) -> Result<(), NotifyError> {
		self.tx.try_send(job).map_err(|err| match err {
			mpsc::error::TrySendError::Full(_) => NotifyError::transient(
				FailureReason::Other,
				format!("worker queue full for {}", self.integration_name),
			),
			mpsc::error::TrySendError::Closed(_) => NotifyError::permanent(
				FailureReason::Other,
				format!("worker gone for {}", self.integration_name),
			),
		})
	}
}

/// The assembled pipeline for all receivers.
pub struct Pipeline {
	entry: Vec<Box<dyn Stage>>,
	workers: HashMap<String, Vec<IntegrationWorker>>,
	peer_wait: Arc<dyn Fn() -> Duration + Send + Sync>,
	marker: Marker,
}

impl Pipeline {
	pub fn new(
		entry: Vec<Box<dyn Stage>>,
		receivers: Vec<Receiver>,
		nflog: Nflog,
		marker: Marker,
		notification_timeout: Duration,
		queue_size: usize,
		peer_wait: Arc<dyn Fn() -> Duration + Send + Sync>,
	) -> Self {
		let mut workers = HashMap::new();
		for receiver in receivers {
			let spawned: Vec<IntegrationWorker> = receiver
				.integrations
				.into_iter()
				.map(|integration| {
					IntegrationWorker::spawn(
						integration,
						nflog.clone(),
						marker.clone(),
						notification_timeout,
						queue_size,
					)
				})
				.collect();
			workers.insert(receiver.name, spawned);
		}

		Self {
			entry,
			workers,
			peer_wait,
			marker,
		}
	}

	pub fn has_receiver(&self, name: &str) -> bool {
		self.workers.contains_key(name)
	}

	/// Run one flush through the pipeline. Returns per-integration result
	/// receivers; the caller awaits them to learn the flush outcome.
	pub async fn process(
		&self,
		mut ctx: NotifyContext,
		alerts: Vec<Alert>,
	) -> Result<Vec<oneshot::Receiver<Result<(), NotifyError>>>, NotifyError> {
		let mut batch = alerts;
		for stage in &self.entry {
			batch = stage.exec(&ctx, batch).await?;
			if batch.is_empty() {
				break;
			}
		}

		if batch.is_empty() {
			debug!(
				group_key = ctx.group_key,
				receiver = ctx.receiver,
				"whole batch muted, nothing to send"
			);
			self.marker.set_group_suppressed(&ctx.group_key, &ctx.receiver, true);
			return Ok(Vec::new());
		}

		let Some(workers) = self.workers.get(&ctx.receiver) else {
			return Err(NotifyError::permanent(
				FailureReason::Other,
				format!("unknown receiver {:?}", ctx.receiver),
			));
		};

		// Peer wait: scheduled before enqueueing so no worker sleeps on
		// behalf of a single group.
		let wait = (self.peer_wait)();
		if !wait.is_zero() {
			trace!(?wait, group_key = ctx.group_key, "peer wait before send");
			tokio::select! {
				() = tokio::time::sleep(wait) => {}
				() = ctx.cancel.cancelled() => return Err(NotifyError::canceled()),
			}
		}
		ctx.now = Utc::now();

		let mut results = Vec::with_capacity(workers.len());
		for worker in workers {
			let (done_tx, done_rx) = oneshot::channel();
			worker.try_enqueue(FlushJob {
				ctx: ctx.clone(),
				alerts: batch.clone(),
				done: done_tx,
			})?;
			results.push(done_rx);
		}
		Ok(results)
	}
}
