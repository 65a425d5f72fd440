//! The Request-Context Facade (§4.7): the single entry point for starting a
//! forwarded connection. Binds the frontend handshake, the Upstream-Dialer,
//! the Transport-Race Controller, and the Byte-Pump together, and exposes
//! delegate hooks for a host to customize upstream selection and auth.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use proxy_core::error::{CopyError, ProxyError};
use proxy_core::metrics::Metrics;
use proxy_session::altsvc::AltServiceRegistry;
use proxy_session::race::RaceController;
use proxy_transport::endpoint::Endpoint;
use proxy_transport::stream::{BytesCounter, Socket};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::forward::{ConnectionId, ForwardConnection};

/// Host-provided hooks the facade consults while driving a connection.
/// Default implementations make every hook optional.
#[async_trait::async_trait]
pub trait Delegate: Send + Sync {
	/// Lets the host override upstream selection; returning `Ok(None)`
	/// means "use the default Transport-Race Controller dial".
	async fn on_connect_server(&self, _target: &Endpoint) -> Result<Option<Socket>, ProxyError> {
		Ok(None)
	}

	/// Lets the host supply credentials in response to a 407 from an
	/// intermediate proxy. Returning `None` means "give up, surface the
	/// 407 to the client".
	async fn on_auth_required(&self, _challenge: &str) -> Option<String> {
		None
	}

	/// Terminal notification; the default just logs.
	async fn on_error(&self, connection_id: ConnectionId, error: &CopyError) {
		debug!(?connection_id, %error, "forward connection failed");
	}
}

pub struct DefaultDelegate;

#[async_trait::async_trait]
impl Delegate for DefaultDelegate {}

#[derive(Default, Clone)]
pub struct Stats {
	pub active_connections: u64,
	pub total_connections: u64,
}

struct SharedState {
	altsvc: AltServiceRegistry,
	active: Mutex<HashMap<ConnectionId, tokio::task::AbortHandle>>,
	total: AtomicU64,
	metrics: Option<Arc<Metrics>>,
}

#[derive(Clone)]
pub struct RequestContextFacade {
	race: Arc<RaceController>,
	shared: Arc<SharedState>,
}

impl RequestContextFacade {
	pub fn new(race: Arc<RaceController>, altsvc: AltServiceRegistry) -> Self {
		Self::build(race, altsvc, None)
	}

	pub fn with_metrics(race: Arc<RaceController>, altsvc: AltServiceRegistry, metrics: Arc<Metrics>) -> Self {
		Self::build(race, altsvc, Some(metrics))
	}

	fn build(race: Arc<RaceController>, altsvc: AltServiceRegistry, metrics: Option<Arc<Metrics>>) -> Self {
		Self {
			race,
			shared: Arc::new(SharedState { altsvc, active: Mutex::new(HashMap::new()), total: AtomicU64::new(0), metrics }),
		}
	}

	/// Dials the upstream named by `target`, via the Delegate's override if
	/// it supplies one, otherwise via the Transport-Race Controller. Split
	/// out from `begin` so a frontend can write its own success/failure
	/// response to the client based on the outcome before any client bytes
	/// are forwarded (a CONNECT 200 must not be sent until the upstream is
	/// actually reachable).
	pub async fn dial(&self, target: Endpoint, delegate: &Arc<dyn Delegate>) -> Result<Socket, ProxyError> {
		match delegate.on_connect_server(&target).await? {
			Some(socket) => Ok(socket),
			None => {
				let outcome = self.race.dial(target.clone()).await?;
				if outcome.used_alt_service {
					info!(%target, "upstream reached via alt-service");
				}
				Ok(outcome.socket)
			},
		}
	}

	/// Dials the upstream and drives the connection through the Byte-Pump to
	/// completion. Convenience wrapper for hosts that don't need to inspect
	/// the dial outcome before committing to the client handshake; `dial`
	/// plus `run` let a frontend split those two steps instead.
	pub async fn begin(&self, client: Socket, target: Endpoint, delegate: Arc<dyn Delegate>) -> Result<(), CopyError> {
		let server = self.dial(target, &delegate).await.map_err(CopyError::Server)?;
		self.run(client, server, delegate).await
	}

	/// Constructs a Forward Connection from an already-dialed upstream
	/// socket and drives it through the Byte-Pump's state machine. The pump
	/// runs on its own task so its `AbortHandle` can be tracked, making
	/// `cancel` and `stats().active_connections` reflect real in-flight work.
	pub async fn run(&self, client: Socket, server: Socket, delegate: Arc<dyn Delegate>) -> Result<(), CopyError> {
		self.shared.total.fetch_add(1, Ordering::Relaxed);
		let mut connection = ForwardConnection::new();
		let id = connection.id;

		let client_counter = client.counter();
		let server_counter = server.counter();

		let task = tokio::spawn(async move { connection.run(client, server).await });
		self.shared.active.lock().await.insert(id, task.abort_handle());

		let result = match task.await {
			Ok(r) => r,
			Err(_) => Err(CopyError::Server(ProxyError::Aborted)),
		};
		self.shared.active.lock().await.remove(&id);

		if let Some(m) = &self.shared.metrics {
			let (client_sent, _) = counter_snapshot(&client_counter);
			let (server_sent, _) = counter_snapshot(&server_counter);
			// Bytes written to the server are what the client sent it;
			// bytes written to the client are what the server sent back.
			m.bytes_client_to_server.inc_by(server_sent);
			m.bytes_server_to_client.inc_by(client_sent);
		}
		if let Err(e) = &result {
			delegate.on_error(id, e).await;
		}
		result
	}

	/// Forces closure of a tracked connection; a no-op if it already
	/// finished.
	pub async fn cancel(&self, id: ConnectionId) {
		if let Some(handle) = self.shared.active.lock().await.remove(&id) {
			handle.abort();
		}
	}

	pub async fn stats(&self) -> Stats {
		Stats { active_connections: self.shared.active.lock().await.len() as u64, total_connections: self.shared.total.load(Ordering::Relaxed) }
	}

	pub fn altsvc(&self) -> &AltServiceRegistry {
		&self.shared.altsvc
	}
}

pub fn counter_snapshot(counter: &Option<BytesCounter>) -> (u64, u64) {
	counter.as_ref().map(|c| c.load()).unwrap_or((0, 0))
}
