//! Daemon assembly: builds the stores, cluster peer, pipeline, and
//! dispatcher from config, then supervises them until shutdown.

use std::{path::PathBuf, sync::Arc, time::Duration};

use miette::{IntoDiagnostic, Result, WrapErr};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
	alerts::AlertStore,
	cluster::{ClusterConfig, Peer, ReplicatedState},
	config::Config,
	dispatch::Dispatcher,
	error::StoreError,
	http_server::{self, ServerState},
	inhibit::Inhibitor,
	marker::Marker,
	metrics,
	nflog::Nflog,
	notify::{
		Integration, InhibitStage, Pipeline, Receiver, ResolvedFilterStage, SilenceStage, Stage,
		email::EmailNotifier, webhook::WebhookNotifier,
	},
	route::Route,
	silences::SilenceStore,
	templates,
};

const SUBSCRIPTION_BUFFER: usize = 200;
const WORKER_QUEUE_SIZE: usize = 64;
const GC_INTERVAL: Duration = Duration::from_secs(30);

/// Runtime configuration of the daemon, assembled from CLI arguments.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
	/// Path to the YAML configuration file.
	pub config_path: PathBuf,

	/// HTTP listen addresses, tried in order.
	pub server_addrs: Vec<std::net::SocketAddr>,

	/// Cluster settings; `bind_addr: None` runs a cluster of one.
	pub cluster: ClusterConfig,

	/// How long resolved alerts are kept before garbage collection.
	pub alert_retention: Duration,

	/// How long silences and notification log entries are kept.
	pub data_retention: Duration,
}

impl DaemonConfig {
	pub fn new(config_path: PathBuf) -> Self {
		Self {
			config_path,
			server_addrs: Vec::new(),
			cluster: ClusterConfig::default(),
			alert_retention: Duration::from_secs(5 * 60),
			data_retention: Duration::from_secs(120 * 3600),
		}
	}
}

struct SilenceChannel(SilenceStore);

impl ReplicatedState for SilenceChannel {
	fn snapshot(&self) -> Vec<u8> {
		self.0.snapshot_bytes()
	}

	fn merge(&self, data: &[u8]) -> Result<usize, StoreError> {
		self.0.merge_bytes(data)
	}
}

struct NflogChannel(Nflog);

impl ReplicatedState for NflogChannel {
	fn snapshot(&self) -> Vec<u8> {
		self.0.snapshot_bytes()
	}

	fn merge(&self, data: &[u8]) -> Result<usize, StoreError> {
		self.0.merge_bytes(data)
	}
}

fn build_receivers(config: &Config, http_client: &reqwest::Client) -> Result<Vec<Receiver>> {
	let tera = Arc::new(templates::load_templates(&config.templates)?);
	let external_url = config.global.external_url.clone();

	let mut receivers = Vec::with_capacity(config.receivers.len());
	for receiver_config in &config.receivers {
		let mut integrations = Vec::new();

		for (idx, webhook) in receiver_config.webhook_configs.iter().enumerate() {
			integrations.push(Integration {
				name: format!("webhook/{idx}"),
				send_resolved: webhook.send_resolved,
				notifier: Arc::new(WebhookNotifier::new(
					webhook.url.clone(),
					http_client.clone(),
					webhook.max_alerts,
					external_url.clone(),
				)),
			});
		}

		for (idx, email) in receiver_config.email_configs.iter().enumerate() {
			// Validated in Config::validate: emails require mailgun.
			let Some(mailgun) = config.global.mailgun.clone() else {
				continue;
			};
			integrations.push(Integration {
				name: format!("email/{idx}"),
				send_resolved: email.send_resolved,
				notifier: Arc::new(EmailNotifier::new(
					email.clone(),
					mailgun,
					tera.clone(),
					external_url.clone(),
				)),
			});
		}

		receivers.push(Receiver {
			name: receiver_config.name.clone(),
			integrations,
		});
	}
	Ok(receivers)
}

pub async fn run(daemon_config: DaemonConfig) -> Result<()> {
	let (_shutdown_tx, shutdown_rx) = oneshot::channel();
	run_with_shutdown(daemon_config, shutdown_rx).await
}

pub async fn run_with_shutdown(
	daemon_config: DaemonConfig,
	external_shutdown: oneshot::Receiver<()>,
) -> Result<()> {
	info!("starting notifyd daemon");

	metrics::init_metrics();

	let config_yaml = std::fs::read_to_string(&daemon_config.config_path)
		.into_diagnostic()
		.wrap_err_with(|| {
			format!(
				"reading config file {}",
				daemon_config.config_path.display()
			)
		})?;
	let config = Arc::new(Config::from_yaml(&config_yaml)?);
	debug!(
		receivers = config.receivers.len(),
		inhibit_rules = config.inhibit_rules.len(),
		"configuration loaded"
	);

	// Stores.
	let store = AlertStore::new(SUBSCRIPTION_BUFFER);
	let silences = SilenceStore::new(daemon_config.data_retention);
	let nflog = Nflog::new(daemon_config.data_retention);
	let marker = Marker::new();

	let rules = config
		.inhibit_rules
		.iter()
		.map(|rule| rule.build())
		.collect::<Result<Vec<_>, _>>()
		.into_diagnostic()?;
	let inhibitor = Inhibitor::new(rules);

	// Cluster: both replicated stores broadcast their writes and expose
	// snapshot/merge for push-pull.
	let (silence_tx, silence_rx) = mpsc::unbounded_channel();
	let (nflog_tx, nflog_rx) = mpsc::unbounded_channel();
	silences.set_broadcast(silence_tx);
	nflog.set_broadcast(nflog_tx);

	let peer = Peer::start(
		daemon_config.cluster.clone(),
		vec![
			(
				"silences".to_string(),
				Arc::new(SilenceChannel(silences.clone())) as Arc<dyn ReplicatedState>,
			),
			(
				"nflog".to_string(),
				Arc::new(NflogChannel(nflog.clone())) as Arc<dyn ReplicatedState>,
			),
		],
		vec![
			("silences".to_string(), silence_rx),
			("nflog".to_string(), nflog_rx),
		],
	)
	.await
	.into_diagnostic()
	.wrap_err("bootstrapping cluster")?;

	// Notification pipeline.
	let http_client = reqwest::Client::builder()
		.timeout(config.global.notification_timeout)
		.build()
		.into_diagnostic()?;
	let receivers = build_receivers(&config, &http_client)?;

	let entry: Vec<Box<dyn Stage>> = vec![
		Box::new(ResolvedFilterStage {
			retention: daemon_config.alert_retention,
		}),
		Box::new(InhibitStage {
			inhibitor: inhibitor.clone(),
			marker: marker.clone(),
		}),
		Box::new(SilenceStage {
			silences: silences.clone(),
			marker: marker.clone(),
		}),
	];

	let peer_wait = {
		let peer = peer.clone();
		let peer_timeout = config.global.peer_timeout;
		Arc::new(move || peer.peer_wait(peer_timeout)) as Arc<dyn Fn() -> Duration + Send + Sync>
	};

	let pipeline = Arc::new(Pipeline::new(
		entry,
		receivers,
		nflog.clone(),
		marker.clone(),
		config.global.notification_timeout,
		WORKER_QUEUE_SIZE,
		peer_wait,
	));

	let route = Arc::new(Route::from_config(&config.route));
	let cancel = CancellationToken::new();
	let dispatcher = Dispatcher::new(
		route,
		pipeline,
		store.clone(),
		marker.clone(),
		cancel.clone(),
	);

	// HTTP server is up before settling so health checks respond, but
	// /-/ready stays 503 until the dispatcher may safely run.
	let state = Arc::new(ServerState::new(
		config.clone(),
		Arc::new(config_yaml),
		store.clone(),
		silences.clone(),
		marker.clone(),
		dispatcher.clone(),
		peer.clone(),
	));
	let server_state = state.clone();
	let server_addrs = daemon_config.server_addrs.clone();
	tokio::spawn(async move {
		http_server::start_server(server_state, server_addrs).await;
	});

	// The inhibitor keeps its source caches fed from the alert stream.
	{
		let inhibitor = inhibitor.clone();
		let store = store.clone();
		tokio::spawn(async move {
			inhibitor.run(store).await;
		});
	}

	// Block notifications until the cluster has settled, so a freshly
	// started peer does not re-notify already-notified groups.
	peer.settle().await;
	state.set_ready();

	let dispatcher_task = {
		let dispatcher = dispatcher.clone();
		tokio::spawn(async move {
			dispatcher.run().await;
		})
	};

	// Periodic garbage collection across all stores.
	{
		let store = store.clone();
		let silences = silences.clone();
		let nflog = nflog.clone();
		let inhibitor = inhibitor.clone();
		let alert_retention = daemon_config.alert_retention;
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(GC_INTERVAL);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			loop {
				ticker.tick().await;
				let now = chrono::Utc::now();
				store.gc(now, alert_retention).await;
				silences.gc(now);
				nflog.gc(now);
				inhibitor.gc(now);
			}
		});
	}

	info!("daemon started successfully");

	// Wait for a shutdown signal.
	let mut external_shutdown = external_shutdown;
	#[cfg(unix)]
	let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
		.into_diagnostic()
		.wrap_err("setting up SIGTERM handler")?;

	#[cfg(unix)]
	tokio::select! {
		result = tokio::signal::ctrl_c() => {
			match result {
				Ok(()) => info!("received SIGINT, shutting down"),
				Err(err) => error!("unable to listen for shutdown signal: {err}"),
			}
		}
		_ = sigterm.recv() => {
			info!("received SIGTERM, shutting down");
		}
		_ = &mut external_shutdown => {
			info!("received external shutdown signal");
		}
	}

	#[cfg(not(unix))]
	tokio::select! {
		result = tokio::signal::ctrl_c() => {
			match result {
				Ok(()) => info!("received SIGINT, shutting down"),
				Err(err) => error!("unable to listen for shutdown signal: {err}"),
			}
		}
		_ = &mut external_shutdown => {
			info!("received external shutdown signal");
		}
	}

	// Stop dispatching, tell peers we are leaving, drain.
	cancel.cancel();
	peer.part().await;
	let _ = dispatcher_task.await;

	info!("daemon stopped");
	Ok(())
}
