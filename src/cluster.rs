//! The cluster layer: peer membership, best-effort state broadcast, and
//! periodic full-state push-pull reconciliation over TCP.
//!
//! Peers are named by their advertised address. Every connection performs a
//! symmetric exchange: hello (membership) plus a full snapshot per state
//! channel; per-write deltas are pushed to all known peers as they happen.
//! Merges are idempotent and commutative, so duplicate delivery and
//! re-ordering are harmless.

use std::{
	collections::{BTreeSet, HashMap},
	net::SocketAddr,
	sync::{
		Arc, RwLock,
		atomic::{AtomicBool, Ordering},
	},
	time::Duration,
};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::{
	net::{TcpListener, TcpStream},
	sync::{Notify, mpsc},
};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, trace, warn};

use crate::error::{ClusterError, StoreError};

const DEFAULT_PUSH_PULL_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_SETTLE_TIMEOUT: Duration = Duration::from_secs(10);
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ClusterConfig {
	/// Listen address; `None` disables clustering entirely.
	pub bind_addr: Option<SocketAddr>,
	/// Address other peers should dial; defaults to the bind address.
	pub advertise_addr: Option<SocketAddr>,
	/// Seed peers, `host:port`.
	pub seeds: Vec<String>,
	pub push_pull_interval: Duration,
	pub settle_timeout: Duration,
}

impl Default for ClusterConfig {
	fn default() -> Self {
		Self {
			bind_addr: None,
			advertise_addr: None,
			seeds: Vec::new(),
			push_pull_interval: DEFAULT_PUSH_PULL_INTERVAL,
			settle_timeout: DEFAULT_SETTLE_TIMEOUT,
		}
	}
}

/// A state channel replicated across the cluster.
pub trait ReplicatedState: Send + Sync {
	/// Full-state snapshot as an opaque blob.
	fn snapshot(&self) -> Vec<u8>;
	/// Merge a remote blob; idempotent, commutative, associative.
	fn merge(&self, data: &[u8]) -> Result<usize, StoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
enum Gossip {
	Hello {
		from: String,
		members: Vec<String>,
	},
	State {
		channel: String,
		data: Vec<u8>,
	},
	Part {
		from: String,
	},
}

struct Inner {
	name: String,
	channels: HashMap<String, Arc<dyn ReplicatedState>>,
	members: RwLock<BTreeSet<String>>,
	received_remote_state: AtomicBool,
	settled: Notify,
}

impl Inner {
	fn handle(&self, message: Gossip) -> Option<Gossip> {
		match message {
			Gossip::Hello { from, members } => {
				let mut known = self.members.write().unwrap_or_else(|e| e.into_inner());
				known.insert(from);
				known.extend(members);
				crate::metrics::set_cluster_peers(known.len());
				None
			}
			Gossip::State { channel, data } => {
				match self.channels.get(&channel) {
					Some(state) => match state.merge(&data) {
						Ok(merged) => {
							trace!(channel, merged, "merged remote state");
							self.received_remote_state.store(true, Ordering::SeqCst);
							self.settled.notify_waiters();
						}
						Err(err) => {
							warn!(channel, "failed to merge remote state: {err}");
							crate::metrics::inc_gossip_drops(&channel);
						}
					},
					None => {
						warn!(channel, "state for unknown channel");
					}
				}
				None
			}
			Gossip::Part { from } => {
				let mut known = self.members.write().unwrap_or_else(|e| e.into_inner());
				known.remove(&from);
				crate::metrics::set_cluster_peers(known.len());
				None
			}
		}
	}

	fn hello(&self) -> Gossip {
		Gossip::Hello {
			from: self.name.clone(),
			members: self
				.members
				.read()
				.unwrap_or_else(|e| e.into_inner())
				.iter()
				.cloned()
				.collect(),
		}
	}

	fn snapshots(&self) -> Vec<Gossip> {
		self.channels
			.iter()
			.map(|(name, state)| Gossip::State {
				channel: name.clone(),
				data: state.snapshot(),
			})
			.collect()
	}
}

/// Handle to this node's view of the cluster.
#[derive(Clone)]
pub struct Peer {
	inner: Arc<Inner>,
	push_pull_interval: Duration,
	settle_timeout: Duration,
}

impl Peer {
	/// A cluster of one: no listener, no peers, settle is immediate.
	pub fn standalone() -> Self {
		let name = format!("standalone/{}", uuid::Uuid::new_v4());
		let inner = Arc::new(Inner {
			name: name.clone(),
			channels: HashMap::new(),
			members: RwLock::new(BTreeSet::from([name])),
			received_remote_state: AtomicBool::new(false),
			settled: Notify::new(),
		});
		crate::metrics::set_cluster_peers(1);
		Self {
			inner,
			push_pull_interval: DEFAULT_PUSH_PULL_INTERVAL,
			settle_timeout: Duration::ZERO,
		}
	}

	/// Join (or found) a cluster: bind the listener, spawn the accept and
	/// reconciliation loops, and wire per-write broadcast channels.
	pub async fn start(
		config: ClusterConfig,
		channels: Vec<(String, Arc<dyn ReplicatedState>)>,
		mut broadcasts: Vec<(String, mpsc::UnboundedReceiver<Vec<u8>>)>,
	) -> Result<Self, ClusterError> {
		let Some(bind_addr) = config.bind_addr else {
			return Ok(Self::standalone());
		};

		let listener = TcpListener::bind(bind_addr)
			.await
			.map_err(ClusterError::Bind)?;
		let local = listener.local_addr().map_err(ClusterError::Bind)?;
		let advertise = config.advertise_addr.unwrap_or(local);
		let name = advertise.to_string();
		info!(%local, advertise = %name, "cluster listening");

		let inner = Arc::new(Inner {
			name: name.clone(),
			channels: channels.into_iter().collect(),
			members: RwLock::new(BTreeSet::from([name.clone()])),
			received_remote_state: AtomicBool::new(false),
			settled: Notify::new(),
		});
		crate::metrics::set_cluster_peers(1);

		// Seed membership; actual reachability is probed by push-pull.
		{
			let mut members = inner.members.write().unwrap_or_else(|e| e.into_inner());
			for seed in &config.seeds {
				if seed != &name {
					members.insert(seed.clone());
				}
			}
			crate::metrics::set_cluster_peers(members.len());
		}

		let peer = Self {
			inner: inner.clone(),
			push_pull_interval: config.push_pull_interval,
			settle_timeout: config.settle_timeout,
		};

		// Accept loop: every inbound connection is a symmetric exchange.
		let accept_inner = inner.clone();
		tokio::spawn(async move {
			loop {
				match listener.accept().await {
					Ok((stream, remote)) => {
						trace!(%remote, "inbound cluster connection");
						let inner = accept_inner.clone();
						tokio::spawn(async move {
							if let Err(err) = serve_exchange(inner, stream).await {
								debug!(%remote, "cluster exchange failed: {err}");
							}
						});
					}
					Err(err) => {
						warn!("cluster accept failed: {err}");
						tokio::time::sleep(Duration::from_secs(1)).await;
					}
				}
			}
		});

		// Periodic push-pull with every known peer.
		let reconcile = peer.clone();
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(reconcile.push_pull_interval);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			loop {
				ticker.tick().await;
				reconcile.push_pull_all().await;
			}
		});

		// Fast first reconciliation so settle usually succeeds quickly.
		let initial = peer.clone();
		tokio::spawn(async move {
			initial.push_pull_all().await;
		});

		// Per-write delta broadcasts.
		for (channel, mut rx) in broadcasts.drain(..) {
			let inner = inner.clone();
			tokio::spawn(async move {
				while let Some(data) = rx.recv().await {
					broadcast_state(&inner, &channel, data).await;
				}
			});
		}

		Ok(peer)
	}

	pub fn name(&self) -> &str {
		&self.inner.name
	}

	pub fn members(&self) -> Vec<String> {
		self.inner
			.members
			.read()
			.unwrap_or_else(|e| e.into_inner())
			.iter()
			.cloned()
			.collect()
	}

	/// This node's position in the sorted member list; drives the peer
	/// wait stage so cluster members fan out sequentially.
	pub fn position(&self) -> usize {
		self.inner
			.members
			.read()
			.unwrap_or_else(|e| e.into_inner())
			.iter()
			.position(|m| *m == self.inner.name)
			.unwrap_or(0)
	}

	pub fn peer_wait(&self, peer_timeout: Duration) -> Duration {
		peer_timeout * self.position() as u32
	}

	/// Block until the cluster has settled: remote state received from at
	/// least one peer, or the settle timeout elapsed, whichever first.
	pub async fn settle(&self) {
		if self.settle_timeout.is_zero() || self.members().len() <= 1 {
			debug!("no peers to settle with");
			return;
		}
		if self.inner.received_remote_state.load(Ordering::SeqCst) {
			return;
		}

		info!(timeout = ?self.settle_timeout, "waiting for cluster to settle");
		tokio::select! {
			() = self.inner.settled.notified() => {
				info!("cluster settled: received remote state");
			}
			() = tokio::time::sleep(self.settle_timeout) => {
				info!("cluster settle timeout elapsed");
			}
		}
	}

	/// Run one push-pull round against every known peer now. Exposed for
	/// the daemon's initial sync and for tests.
	pub async fn push_pull_all(&self) {
		let peers: Vec<String> = self
			.members()
			.into_iter()
			.filter(|m| *m != self.inner.name)
			.collect();

		for peer in peers {
			if let Err(err) = dial_exchange(self.inner.clone(), &peer).await {
				debug!(peer, "push-pull failed: {err}");
			}
		}
	}

	/// Announce departure to every peer; best effort.
	pub async fn part(&self) {
		let message = Gossip::Part {
			from: self.inner.name.clone(),
		};
		let Ok(encoded) = bincode::serialize(&message) else {
			return;
		};
		for peer in self.members() {
			if peer == self.inner.name {
				continue;
			}
			let bytes = Bytes::from(encoded.clone());
			let _ = tokio::time::timeout(DIAL_TIMEOUT, async {
				if let Ok(stream) = TcpStream::connect(&peer).await {
					let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
					let _ = framed.send(bytes).await;
				}
			})
			.await;
		}
	}
}

async fn send_all(
	framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
	messages: impl IntoIterator<Item = Gossip>,
) -> Result<(), ClusterError> {
	for message in messages {
		let encoded = bincode::serialize(&message)?;
		framed.send(Bytes::from(encoded)).await?;
	}
	Ok(())
}

/// Serve one inbound exchange: merge everything the dialer sends, then
/// reply with our own hello and snapshots.
async fn serve_exchange(inner: Arc<Inner>, stream: TcpStream) -> Result<(), ClusterError> {
	let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

	while let Some(frame) = framed.next().await {
		let frame = frame?;
		let message: Gossip = bincode::deserialize(&frame)?;
		let done = matches!(message, Gossip::Hello { .. });
		inner.handle(message);
		// The hello arrives last in a dialer's opening volley; reply then.
		if done {
			let mut reply = inner.snapshots();
			reply.push(inner.hello());
			send_all(&mut framed, reply).await?;
			framed.flush().await?;
		}
	}
	Ok(())
}

/// Dial a peer and run the symmetric exchange from the initiating side.
async fn dial_exchange(inner: Arc<Inner>, peer: &str) -> Result<(), ClusterError> {
	let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(peer))
		.await
		.map_err(|_| {
			ClusterError::Io(std::io::Error::new(
				std::io::ErrorKind::TimedOut,
				"dial timed out",
			))
		})??;

	let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

	let mut opening = inner.snapshots();
	opening.push(inner.hello());
	send_all(&mut framed, opening).await?;
	framed.flush().await?;

	// Read the reply until the peer's hello, then we are reconciled.
	while let Some(frame) = framed.next().await {
		let frame = frame?;
		let message: Gossip = bincode::deserialize(&frame)?;
		let done = matches!(message, Gossip::Hello { .. });
		inner.handle(message);
		if done {
			break;
		}
	}
	Ok(())
}

/// Push one delta to every known peer; best effort.
async fn broadcast_state(inner: &Arc<Inner>, channel: &str, data: Vec<u8>) {
	let members: Vec<String> = inner
		.members
		.read()
		.unwrap_or_else(|e| e.into_inner())
		.iter()
		.filter(|m| **m != inner.name)
		.cloned()
		.collect();

	if members.is_empty() {
		return;
	}

	let message = Gossip::State {
		channel: channel.to_string(),
		data,
	};
	let Ok(encoded) = bincode::serialize(&message) else {
		return;
	};

	for peer in members {
		let bytes = Bytes::from(encoded.clone());
		let result = tokio::time::timeout(DIAL_TIMEOUT, async {
			let stream = TcpStream::connect(&peer).await?;
			let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
			framed.send(bytes).await?;
			framed.flush().await?;
			Ok::<(), std::io::Error>(())
		})
		.await;

		match result {
			Ok(Ok(())) => trace!(peer, channel, "broadcast delta"),
			Ok(Err(err)) => debug!(peer, channel, "broadcast failed: {err}"),
			Err(_) => debug!(peer, channel, "broadcast timed out"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	struct TestState {
		data: RwLock<BTreeSet<String>>,
	}

	impl TestState {
		fn new() -> Arc<Self> {
			Arc::new(Self {
				data: RwLock::new(BTreeSet::new()),
			})
		}

		fn insert(&self, value: &str) {
			self.data.write().unwrap().insert(value.to_string());
		}

		fn contains(&self, value: &str) -> bool {
			self.data.read().unwrap().contains(value)
		}
	}

	impl ReplicatedState for TestState {
		fn snapshot(&self) -> Vec<u8> {
			bincode::serialize(&*self.data.read().unwrap()).unwrap()
		}

		fn merge(&self, data: &[u8]) -> Result<usize, StoreError> {
			let remote: BTreeSet<String> =
				bincode::deserialize(data).map_err(|e| StoreError::Decode(e.to_string()))?;
			let mut local = self.data.write().unwrap();
			let before = local.len();
			local.extend(remote);
			Ok(local.len() - before)
		}
	}

	fn config(bind: &str, seeds: Vec<String>) -> ClusterConfig {
		ClusterConfig {
			bind_addr: Some(bind.parse().unwrap()),
			advertise_addr: None,
			seeds,
			push_pull_interval: Duration::from_secs(3600),
			settle_timeout: Duration::from_secs(5),
		}
	}

	#[tokio::test]
	async fn standalone_peer_needs_no_settling() {
		crate::metrics::init_metrics();
		let peer = Peer::standalone();
		assert_eq!(peer.position(), 0);
		assert_eq!(peer.peer_wait(Duration::from_secs(15)), Duration::ZERO);
		peer.settle().await;
	}

	#[tokio::test]
	async fn two_peers_converge_via_push_pull() {
		crate::metrics::init_metrics();

		let state_one = TestState::new();
		state_one.insert("from-one");

		let one = Peer::start(
			config("127.0.0.1:0", vec![]),
			vec![("test".into(), state_one.clone() as Arc<dyn ReplicatedState>)],
			vec![],
		)
		.await
		.unwrap();

		let state_two = TestState::new();
		state_two.insert("from-two");

		let two = Peer::start(
			config("127.0.0.1:0", vec![one.name().to_string()]),
			vec![("test".into(), state_two.clone() as Arc<dyn ReplicatedState>)],
			vec![],
		)
		.await
		.unwrap();

		two.push_pull_all().await;

		assert!(state_two.contains("from-one"), "dialer merged acceptor state");
		assert!(state_one.contains("from-two"), "acceptor merged dialer state");
		assert!(one.members().contains(&two.name().to_string()));
	}

	#[tokio::test]
	async fn broadcast_delta_reaches_peer() {
		crate::metrics::init_metrics();

		let state_one = TestState::new();
		let one = Peer::start(
			config("127.0.0.1:0", vec![]),
			vec![("test".into(), state_one.clone() as Arc<dyn ReplicatedState>)],
			vec![],
		)
		.await
		.unwrap();

		let state_two = TestState::new();
		let (tx, rx) = mpsc::unbounded_channel();
		let two = Peer::start(
			config("127.0.0.1:0", vec![one.name().to_string()]),
			vec![("test".into(), state_two.clone() as Arc<dyn ReplicatedState>)],
			vec![("test".into(), rx)],
		)
		.await
		.unwrap();
		// Learn membership first.
		two.push_pull_all().await;

		state_two.insert("delta");
		tx.send(bincode::serialize(&BTreeSet::from(["delta".to_string()])).unwrap())
			.unwrap();

		// Broadcast is asynchronous; poll briefly.
		for _ in 0..50 {
			if state_one.contains("delta") {
				return;
			}
			tokio::time::sleep(Duration::from_millis(20)).await;
		}
		panic!("delta never arrived at peer one");
	}
}
