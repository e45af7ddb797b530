use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::Parser;
use miette::Result;
use notifyd::{ClusterConfig, DaemonConfig};
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Alert aggregation and notification routing daemon
///
/// Ingests alerts over HTTP, groups them along the configured routing
/// tree, applies silences and inhibition rules, and dispatches batched
/// notifications to the configured receivers. Multiple instances form a
/// gossip cluster sharing silences and notification bookkeeping.
#[derive(Debug, Clone, Parser)]
pub struct Args {
	/// Path to the YAML configuration file
	#[arg(long, short = 'c', env = "NOTIFYD_CONFIG")]
	pub config: PathBuf,

	/// HTTP listen address
	///
	/// Can be provided multiple times; addresses are tried in order.
	#[arg(long = "listen")]
	pub listen: Vec<SocketAddr>,

	/// Cluster listen address
	///
	/// Omit to run as a cluster of one.
	#[arg(long, env = "NOTIFYD_CLUSTER_BIND")]
	pub cluster_bind: Option<SocketAddr>,

	/// Address advertised to peers, when it differs from the bind address
	#[arg(long)]
	pub cluster_advertise: Option<SocketAddr>,

	/// Seed peer as host:port
	///
	/// Can be provided multiple times.
	#[arg(long = "cluster-peer")]
	pub cluster_peers: Vec<String>,

	/// How long to wait at startup for state from peers
	#[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
	pub cluster_settle_timeout: Duration,

	/// Interval between full-state reconciliations with peers
	#[arg(long, default_value = "1m", value_parser = humantime::parse_duration)]
	pub cluster_push_pull_interval: Duration,

	/// How long resolved alerts are kept before garbage collection
	#[arg(long, default_value = "5m", value_parser = humantime::parse_duration)]
	pub alert_retention: Duration,

	/// How long silences and notification log entries are kept
	#[arg(long, default_value = "120h", value_parser = humantime::parse_duration)]
	pub data_retention: Duration,

	/// Increase log verbosity (up to -vvvv)
	#[arg(long, short, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// Emit logs as JSON
	#[arg(long)]
	pub log_json: bool,
}

fn setup_logging(args: &Args) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
		EnvFilter::new(match args.verbose {
			0 => "notifyd=info",
			1 => "info,notifyd=debug",
			2 => "debug",
			3 => "debug,notifyd=trace",
			_ => "trace",
		})
	});

	let builder = tracing_subscriber::fmt().with_env_filter(filter);
	if args.log_json {
		builder.json().init();
	} else {
		builder.init();
	}
}

#[tokio::main]
async fn main() -> Result<()> {
	let args = Args::parse();
	setup_logging(&args);
	debug!(?args, "got arguments");

	let mut daemon_config = DaemonConfig::new(args.config.clone());
	daemon_config.server_addrs = args.listen.clone();
	daemon_config.alert_retention = args.alert_retention;
	daemon_config.data_retention = args.data_retention;
	daemon_config.cluster = ClusterConfig {
		bind_addr: args.cluster_bind,
		advertise_addr: args.cluster_advertise,
		seeds: args.cluster_peers.clone(),
		push_pull_interval: args.cluster_push_pull_interval,
		settle_timeout: args.cluster_settle_timeout,
	};

	notifyd::run(daemon_config).await
}
