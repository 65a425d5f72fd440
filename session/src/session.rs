//! An `UpstreamSession` is a live, possibly-multiplexed connection
//! identified by a Session Key (§3). It is created empty and transitions
//! `HandshakePending -> Ready -> Draining -> Closed`, and must be
//! idempotently closeable from either side.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use proxy_core::error::ProxyError;
use proxy_transport::endpoint::{Host, SessionKey};
use proxy_transport::stream::Socket;
use proxy_transport::tls;
use tokio::sync::oneshot;

pub(crate) use crate::multiplex::MultiplexedConn;
use crate::multiplex;
use crate::pool::PoolEntry;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum SessionState {
	HandshakePending = 0,
	Ready = 1,
	Draining = 2,
	Closed = 3,
}

impl SessionState {
	fn from_u8(v: u8) -> Self {
		match v {
			0 => SessionState::HandshakePending,
			1 => SessionState::Ready,
			2 => SessionState::Draining,
			_ => SessionState::Closed,
		}
	}
}

/// How many logical streams a session can carry. Direct-TCP and TLS
/// sessions are single-stream; h2 and QUIC sessions are multiplexable.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Protocol {
	DirectTcp,
	Tls,
	H2,
	Quic,
}

impl Protocol {
	pub fn is_multiplexable(self) -> bool {
		matches!(self, Protocol::H2 | Protocol::Quic)
	}
}

struct StreamWaiter {
	respond: oneshot::Sender<Result<Socket, ProxyError>>,
}

struct Inner {
	key: SessionKey,
	protocol: Protocol,
	state: AtomicU8,
	next_stream_id: AtomicU64,
	waiters: Mutex<VecDeque<StreamWaiter>>,
	terminal_error: OnceLock<ProxyError>,
	// Single-stream sessions hand out their one socket exactly once.
	single_socket: Mutex<Option<Socket>>,
	max_streams: u64,
	// DER of the leaf certificate presented by the upstream, if this session
	// is TLS-backed. Backs the Session Pool's aliasing check.
	peer_certificate: Option<Vec<u8>>,
	// Set once the underlying h2/quic connection is established; absent for
	// single-stream sessions and for a multiplexed session still in
	// `HandshakePending`.
	conn: OnceLock<MultiplexedConn>,
}

#[derive(Clone)]
pub struct UpstreamSession {
	inner: Arc<Inner>,
}

impl UpstreamSession {
	/// Constructs a single-stream session (direct-tcp or tls) wrapping a
	/// socket that is already connected and ready for use. `peer_certificate`
	/// is the leaf certificate DER presented by the upstream, if any (tls
	/// sessions only), and is what `verify_alias` checks.
	pub fn single_stream(key: SessionKey, protocol: Protocol, socket: Socket, peer_certificate: Option<Vec<u8>>) -> Self {
		debug_assert!(!protocol.is_multiplexable());
		Self {
			inner: Arc::new(Inner {
				key,
				protocol,
				state: AtomicU8::new(SessionState::Ready as u8),
				next_stream_id: AtomicU64::new(0),
				waiters: Mutex::new(VecDeque::new()),
				terminal_error: OnceLock::new(),
				single_socket: Mutex::new(Some(socket)),
				max_streams: 1,
				peer_certificate,
				conn: OnceLock::new(),
			}),
		}
	}

	/// Constructs a multiplexable session (h2 or quic) with no connection
	/// attached yet; `attach_connection` moves it to `Ready` once the
	/// handshake completes.
	pub fn multiplexed(key: SessionKey, protocol: Protocol, max_streams: u64) -> Self {
		debug_assert!(protocol.is_multiplexable());
		Self {
			inner: Arc::new(Inner {
				key,
				protocol,
				state: AtomicU8::new(SessionState::HandshakePending as u8),
				next_stream_id: AtomicU64::new(0),
				waiters: Mutex::new(VecDeque::new()),
				terminal_error: OnceLock::new(),
				single_socket: Mutex::new(None),
				max_streams,
				peer_certificate: None,
				conn: OnceLock::new(),
			}),
		}
	}

	/// Attaches the established h2/quic connection handle and transitions
	/// the session to `Ready`. Called once by the Upstream-Dialer right
	/// after the multiplexed handshake completes; a session that never gets
	/// this call stays `HandshakePending` forever and is never handed out
	/// (`ready_to_use` requires `Ready`).
	pub(crate) fn attach_connection(&self, conn: MultiplexedConn) {
		let _ = self.inner.conn.set(conn);
		self.mark_ready();
	}

	/// Opens a fresh logical stream against this session's multiplexed
	/// connection. Fails if the session is not `Ready`, is already at its
	/// stream-capacity limit, or the connection itself has gone away.
	pub async fn open_stream(&self, key: &SessionKey) -> Result<Socket, ProxyError> {
		if self.state() != SessionState::Ready {
			return Err(self.terminal_error().unwrap_or(ProxyError::ConnectionClosed));
		}
		if self.at_stream_capacity() {
			return Err(ProxyError::TunnelConnectionFailed);
		}
		let socket = match self.inner.conn.get().ok_or(ProxyError::ConnectionClosed)? {
			MultiplexedConn::Quic(conn) => multiplex::open_quic_stream(conn).await?,
			MultiplexedConn::H2(send_request) => multiplex::open_h2_stream(send_request, key).await?,
		};
		self.next_stream_id();
		Ok(socket)
	}

	pub fn key(&self) -> &SessionKey {
		&self.inner.key
	}

	pub fn protocol(&self) -> Protocol {
		self.inner.protocol
	}

	pub fn state(&self) -> SessionState {
		SessionState::from_u8(self.inner.state.load(Ordering::Acquire))
	}

	pub fn mark_ready(&self) {
		let _ = self.inner.state.compare_exchange(
			SessionState::HandshakePending as u8,
			SessionState::Ready as u8,
			Ordering::AcqRel,
			Ordering::Acquire,
		);
	}

	pub fn mark_draining(&self) {
		self.inner.state.store(SessionState::Draining as u8, Ordering::Release);
	}

	/// Idempotent: closing an already-closed session is a no-op. Fails any
	/// waiters with the terminal error (or `ConnectionClosed` if none was
	/// recorded).
	pub fn close(&self, err: Option<ProxyError>) {
		let prior = self.inner.state.swap(SessionState::Closed as u8, Ordering::AcqRel);
		if prior == SessionState::Closed as u8 {
			return;
		}
		let err = err.unwrap_or(ProxyError::ConnectionClosed);
		let _ = self.inner.terminal_error.set(err);
		let mut waiters = self.inner.waiters.lock().unwrap();
		for waiter in waiters.drain(..) {
			let _ = waiter.respond.send(Err(err));
		}
	}

	pub fn terminal_error(&self) -> Option<ProxyError> {
		self.inner.terminal_error.get().copied()
	}

	/// Allocates the next stream id for a multiplexed session.
	pub fn next_stream_id(&self) -> u64 {
		self.inner.next_stream_id.fetch_add(1, Ordering::SeqCst)
	}

	/// Takes the single socket out of a single-stream session. Returns
	/// `None` if it has already been taken or the session is multiplexed.
	pub fn take_socket(&self) -> Option<Socket> {
		self.inner.single_socket.lock().unwrap().take()
	}
}

impl PoolEntry for UpstreamSession {
	fn ready_to_use(&self) -> bool {
		matches!(self.state(), SessionState::Ready) && self.terminal_error().is_none()
	}

	fn at_stream_capacity(&self) -> bool {
		self.inner.protocol.is_multiplexable() && self.inner.next_stream_id.load(Ordering::Relaxed) >= self.inner.max_streams
	}

	fn verify_alias(&self, host: &Host) -> bool {
		if self.state() != SessionState::Ready {
			return false;
		}
		self.inner
			.peer_certificate
			.as_deref()
			.is_some_and(|der| tls::verify_name_match(der, &host.to_string()))
	}
}

#[cfg(test)]
mod tests {
	use proxy_transport::endpoint::{Endpoint, Host, Scheme};

	use super::*;

	fn key() -> SessionKey {
		SessionKey::direct(Endpoint::new(Scheme::H2, Host::Name("example.com".into()), 443))
	}

	#[test]
	fn close_is_idempotent() {
		let s = UpstreamSession::multiplexed(key(), Protocol::H2, 100);
		s.close(Some(ProxyError::ConnectionReset));
		s.close(Some(ProxyError::TimedOut));
		assert_eq!(s.terminal_error(), Some(ProxyError::ConnectionReset));
	}

	#[tokio::test]
	async fn verify_alias_is_false_without_a_certificate() {
		let (a, _b) = tokio::io::duplex(64);
		let socket = Socket::from_memory(
			a,
			proxy_transport::stream::TcpConnectionInfo {
				peer_addr: "127.0.0.1:1".parse().unwrap(),
				local_addr: "127.0.0.1:2".parse().unwrap(),
				start: std::time::Instant::now(),
			},
		);
		let s = UpstreamSession::single_stream(key(), Protocol::Tls, socket, None);
		assert!(!s.verify_alias(&Host::Name("example.com".into())));
	}

	#[test]
	fn mark_ready_only_transitions_from_handshake_pending() {
		let s = UpstreamSession::multiplexed(key(), Protocol::H2, 100);
		s.mark_draining();
		s.mark_ready();
		assert_eq!(s.state(), SessionState::Draining);
	}
}
