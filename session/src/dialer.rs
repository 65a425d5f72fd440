//! The Upstream-Dialer (§4.2): given a target Endpoint and a Proxy Chain,
//! yields a connected upstream stream handle, consulting the Session Pool
//! first and only dialing fresh on a miss.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use proxy_core::error::ProxyError;
use proxy_transport::dns::CachedResolver;
use proxy_transport::endpoint::{Host, ProxyChain, SessionKey};
use proxy_transport::stream::Socket;
use proxy_transport::tls;
use tracing::debug;

use crate::pool::SessionPool;
use crate::retry::RetryInfo;
use crate::session::{MultiplexedConn, Protocol, UpstreamSession};

/// h2 has no hard concurrent-stream ceiling of its own (it is negotiated via
/// `SETTINGS_MAX_CONCURRENT_STREAMS`, typically around 100); QUIC's default
/// is similar. Both are treated as soft local caps on top of whatever the
/// peer actually negotiates.
const H2_MAX_CONCURRENT_STREAMS: u64 = 100;
const QUIC_MAX_CONCURRENT_STREAMS: u64 = 100;

pub struct Dialer {
	pool: SessionPool<UpstreamSession>,
	resolver: Arc<CachedResolver>,
	tls_config: Arc<rustls::ClientConfig>,
	quic_endpoint: quinn::Endpoint,
	enable_quic: bool,
	quic_host_allowlist: Arc<HashSet<String>>,
}

impl Dialer {
	pub fn new(pool: SessionPool<UpstreamSession>, resolver: Arc<CachedResolver>) -> anyhow::Result<Self> {
		Self::with_quic_config(pool, resolver, false, Arc::new(HashSet::new()))
	}

	/// `enable_quic`/`quic_host_allowlist` mirror `app::config::Config`'s
	/// fields of the same name: QUIC is refused outright unless both the
	/// feature is enabled and (if the allowlist is non-empty) the
	/// destination host is on it. This is the Upstream-Dialer's own
	/// defense-in-depth check; `session::race::RaceController` applies the
	/// same policy earlier, when deciding whether an advertised QUIC
	/// Alt-Service entry is even usable.
	pub fn with_quic_config(
		pool: SessionPool<UpstreamSession>,
		resolver: Arc<CachedResolver>,
		enable_quic: bool,
		quic_host_allowlist: Arc<HashSet<String>>,
	) -> anyhow::Result<Self> {
		let tls_config = tls::client_config(&["h2", "http/1.1"]).map_err(anyhow::Error::from)?;
		let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from((*tls_config).clone())
			.map_err(|e| anyhow::anyhow!("tls config is not usable for quic: {e}"))?;
		let mut quic_endpoint = quinn::Endpoint::client("0.0.0.0:0".parse().unwrap())?;
		quic_endpoint.set_default_client_config(quinn::ClientConfig::new(Arc::new(quic_crypto)));
		Ok(Self { pool, resolver, tls_config, quic_endpoint, enable_quic, quic_host_allowlist })
	}

	fn quic_allowed(&self, host: &Host) -> bool {
		self.enable_quic && (self.quic_host_allowlist.is_empty() || self.quic_host_allowlist.contains(&host.to_string()))
	}

	/// Returns a usable socket for `key`, bound to a session from the
	/// Session Pool. Dials a fresh session on a pool miss, walking
	/// `key.chain` hop by hop.
	pub async fn dial(&self, key: &SessionKey) -> Result<Socket, ProxyError> {
		if key.chain.hops().is_empty() {
			return self.dial_direct(key).await;
		}
		self.dial_through_chain(key).await
	}

	async fn dial_direct(&self, key: &SessionKey) -> Result<Socket, ProxyError> {
		let session = self.pool.get_or_dial(key, || async { self.establish(key).await }).await?;

		match session.protocol() {
			Protocol::H2 | Protocol::Quic => match session.open_stream(key).await {
				Ok(socket) => Ok(socket),
				Err(e) => {
					// A stream-open failure on a pooled multiplexed session
					// usually means the underlying connection itself died;
					// evict it so the next dial for this key doesn't hand
					// out the same dead session again.
					session.close(Some(e));
					self.pool.close_one(key);
					Err(e)
				},
			},
			Protocol::DirectTcp | Protocol::Tls => session.take_socket().ok_or(ProxyError::ConnectionClosed),
		}
	}

	async fn dial_through_chain(&self, key: &SessionKey) -> Result<Socket, ProxyError> {
		// Each hop is itself a direct dial to the next Endpoint; once
		// connected, the remaining hops are tunnelled through it via
		// protocol-specific upgrades handled by the engine crate.
		let first_hop = key.chain.hops().first().expect("non-empty chain");
		let addr = self.resolve(first_hop.host.clone(), first_hop.port).await?;
		Socket::dial(addr).await.map_err(|_| ProxyError::ConnectionFailed)
	}

	async fn establish(&self, key: &SessionKey) -> Result<UpstreamSession, ProxyError> {
		let addr = self.resolve(key.destination.host.clone(), key.destination.port).await?;
		match key.destination.scheme {
			proxy_transport::endpoint::Scheme::DirectTcp => {
				let socket = Socket::dial(addr).await.map_err(|_| ProxyError::ConnectionFailed)?;
				Ok(UpstreamSession::single_stream(key.clone(), Protocol::DirectTcp, socket, None))
			},
			proxy_transport::endpoint::Scheme::Tls => {
				let tcp = Socket::dial(addr).await.map_err(|_| ProxyError::ConnectionFailed)?;
				let server_name = match &key.destination.host {
					Host::Name(n) => tls::server_name(n).map_err(|_| ProxyError::CertCommonNameInvalid)?,
					Host::Addr(a) => rustls_pki_types::ServerName::IpAddress((*a).into()),
				};
				let (ext, counter, inner) = tcp.into_parts();
				let connector = tokio_rustls::TlsConnector::from(self.tls_config.clone());
				let tls_stream = connector
					.connect(server_name, Box::new(inner))
					.await
					.map_err(|_| ProxyError::CertError)?;
				let leaf_cert = tls_stream.get_ref().1.peer_certificates().and_then(|certs| certs.first()).map(|c| c.as_ref().to_vec());
				let socket = Socket::from_tls(ext, counter, tls_stream.into());
				Ok(UpstreamSession::single_stream(key.clone(), Protocol::Tls, socket, leaf_cert))
			},
			proxy_transport::endpoint::Scheme::H2 => {
				let tcp = Socket::dial(addr).await.map_err(|_| ProxyError::ConnectionFailed)?;
				let server_name = match &key.destination.host {
					Host::Name(n) => tls::server_name(n).map_err(|_| ProxyError::CertCommonNameInvalid)?,
					Host::Addr(a) => rustls_pki_types::ServerName::IpAddress((*a).into()),
				};
				let (_ext, _counter, inner) = tcp.into_parts();
				let connector = tokio_rustls::TlsConnector::from(self.tls_config.clone());
				let tls_stream = connector.connect(server_name, Box::new(inner)).await.map_err(|_| ProxyError::CertError)?;
				let (send_request, connection) =
					h2::client::handshake::<_, Bytes>(tls_stream).await.map_err(|_| ProxyError::TunnelConnectionFailed)?;
				tokio::spawn(async move {
					if let Err(e) = connection.await {
						debug!(error = %e, "h2 connection driver exited");
					}
				});
				let session = UpstreamSession::multiplexed(key.clone(), Protocol::H2, H2_MAX_CONCURRENT_STREAMS);
				session.attach_connection(MultiplexedConn::H2(send_request));
				Ok(session)
			},
			proxy_transport::endpoint::Scheme::Quic => {
				if !self.quic_allowed(&key.destination.host) {
					return Err(ProxyError::BlockedByClient);
				}
				let server_name = key.destination.host.to_string();
				let connecting = self.quic_endpoint.connect(addr, &server_name).map_err(|_| ProxyError::QuicHandshakeFailed)?;
				let connection = connecting.await.map_err(|_| ProxyError::QuicHandshakeFailed)?;
				let session = UpstreamSession::multiplexed(key.clone(), Protocol::Quic, QUIC_MAX_CONCURRENT_STREAMS);
				session.attach_connection(MultiplexedConn::Quic(connection));
				Ok(session)
			},
		}
	}

	async fn resolve(&self, host: Host, port: u16) -> Result<SocketAddr, ProxyError> {
		let ip = match host {
			Host::Addr(ip) => ip,
			Host::Name(name) => {
				debug!(%name, "resolving host");
				self.resolver.resolve(name).await.map_err(|_| ProxyError::NameNotResolved)?
			},
		};
		Ok(SocketAddr::from((ip, port)))
	}
}

/// Per-hop failure bookkeeping the caller folds into the Proxy-Retry
/// Throttler when a dial fails partway through a Proxy Chain.
pub fn record_hop_failure(chain: &ProxyChain, retry: &mut RetryInfo) {
	if !chain.is_direct() {
		retry.on_runtime_failure();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn record_hop_failure_only_arms_for_proxied_chains() {
		let mut retry = RetryInfo::new();
		record_hop_failure(&ProxyChain::direct(), &mut retry);
		assert!(retry.is_retry_allowed());
	}
}
