use std::sync::{
	Arc,
	atomic::{AtomicBool, Ordering},
};

use jiff::Timestamp;

use crate::{
	alerts::AlertStore, cluster::Peer, config::Config, dispatch::Dispatcher, marker::Marker,
	silences::SilenceStore,
};

#[derive(Clone)]
pub struct ServerState {
	pub started_at: Timestamp,
	pub pid: u32,
	pub config: Arc<Config>,
	pub config_yaml: Arc<String>,
	pub store: AlertStore,
	pub silences: SilenceStore,
	pub marker: Marker,
	pub dispatcher: Dispatcher,
	pub peer: Peer,
	ready: Arc<AtomicBool>,
}

impl ServerState {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		config: Arc<Config>,
		config_yaml: Arc<String>,
		store: AlertStore,
		silences: SilenceStore,
		marker: Marker,
		dispatcher: Dispatcher,
		peer: Peer,
	) -> Self {
		Self {
			started_at: Timestamp::now(),
			pid: std::process::id(),
			config,
			config_yaml,
			store,
			silences,
			marker,
			dispatcher,
			peer,
			ready: Arc::new(AtomicBool::new(false)),
		}
	}

	/// Flipped once the cluster settle wait completes.
	pub fn set_ready(&self) {
		self.ready.store(true, Ordering::SeqCst);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::SeqCst)
	}
}
