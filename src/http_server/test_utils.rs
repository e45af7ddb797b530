//! Shared scaffolding for endpoint tests.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
	alerts::{Alert, AlertStore},
	cluster::Peer,
	config::Config,
	dispatch::Dispatcher,
	error::NotifyError,
	http_server::state::ServerState,
	marker::Marker,
	nflog::Nflog,
	notify::{Integration, Notifier, NotifyContext, Pipeline, Receiver},
	route::Route,
	silences::SilenceStore,
};

const TEST_CONFIG: &str = r#"
route:
  receiver: default
  group_by: [alertname]
receivers:
  - name: default
"#;

struct DevNull;

#[async_trait]
impl Notifier for DevNull {
	fn kind(&self) -> &'static str {
		"test"
	}

	async fn notify(&self, _ctx: &NotifyContext, _alerts: &[Alert]) -> Result<(), NotifyError> {
		Ok(())
	}
}

pub async fn create_test_state() -> Arc<ServerState> {
	crate::metrics::init_metrics();

	let config = Arc::new(Config::from_yaml(TEST_CONFIG).unwrap());
	let store = AlertStore::new(64);
	let silences = SilenceStore::new(Duration::from_secs(3600));
	let nflog = Nflog::new(Duration::from_secs(3600));
	let marker = Marker::new();
	let route = Arc::new(Route::from_config(&config.route));

	let receivers = vec![Receiver {
		name: "default".into(),
		integrations: vec![Integration {
			name: "test/0".into(),
			send_resolved: true,
			notifier: Arc::new(DevNull),
		}],
	}];

	let pipeline = Arc::new(Pipeline::new(
		Vec::new(),
		receivers,
		nflog,
		marker.clone(),
		Duration::from_secs(30),
		16,
		Arc::new(|| Duration::ZERO),
	));

	let dispatcher = Dispatcher::new(
		route,
		pipeline,
		store.clone(),
		marker.clone(),
		tokio_util::sync::CancellationToken::new(),
	);

	Arc::new(ServerState::new(
		config,
		Arc::new(TEST_CONFIG.to_string()),
		store,
		silences,
		marker,
		dispatcher,
		Peer::standalone(),
	))
}
