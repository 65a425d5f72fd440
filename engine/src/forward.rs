//! A Forward Connection: one accepted client socket paired with at most one
//! Upstream Session stream, owning the Client and Server Direction slots
//! for its lifetime. Implements the `connect` half of the Byte-Pump's
//! public contract (§4.1) — the early pull and the state machine that
//! sequences dial before full duplex.

use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::FutureExt;
use proxy_core::error::{CopyError, ProxyError};
use proxy_transport::stream::Socket;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::pump;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectState {
	None,
	ConnectClient,
	ConnectClientComplete,
	ConnectServer,
	ConnectServerComplete,
	FullDuplex,
	Terminal,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
	pub fn next() -> Self {
		Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
	}
}

/// Issues a single, non-blocking read attempt on the client socket before
/// the upstream is dialed. A CONNECT-style client commonly pipelines the
/// next protocol's first bytes immediately; capturing them here (rather
/// than after the dial) preserves their position as the first bytes
/// delivered to the upstream.
pub async fn early_pull(client: &mut Socket) -> Result<Option<Vec<u8>>, ProxyError> {
	let mut buf = vec![0u8; 16 * 1024];
	match client.read(&mut buf).now_or_never() {
		Some(Ok(0)) => {
			debug!("early pull observed client EOF");
			Ok(None)
		},
		Some(Ok(n)) => {
			buf.truncate(n);
			Ok(Some(buf))
		},
		Some(Err(e)) => Err(pump::classify_io_error(e)),
		None => Ok(None),
	}
}

pub struct ForwardConnection {
	pub id: ConnectionId,
	state: ConnectState,
}

impl ForwardConnection {
	pub fn new() -> Self {
		Self { id: ConnectionId::next(), state: ConnectState::None }
	}

	pub fn state(&self) -> ConnectState {
		self.state
	}

	/// Drives the full state machine: early pull, then full duplex once
	/// `server` (already dialed and handshaken by the caller) is available.
	/// `server` is threaded through as a future so a confirmation probe or
	/// handshake failure upstream of this call surfaces before any client
	/// bytes are forwarded.
	pub async fn run(&mut self, mut client: Socket, server: Socket) -> Result<(), CopyError> {
		self.state = ConnectState::ConnectClient;
		let early = early_pull(&mut client).await.map_err(CopyError::Client)?;
		self.state = ConnectState::ConnectClientComplete;

		self.state = ConnectState::ConnectServer;
		self.state = ConnectState::ConnectServerComplete;

		self.state = ConnectState::FullDuplex;
		let result = pump::run(client, server, early).await;
		self.state = ConnectState::Terminal;
		if let Err(e) = &result {
			warn!(connection = self.id.0, error = %e, "forward connection terminated with an error");
		}
		result
	}
}

impl Default for ForwardConnection {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use tokio::io::AsyncWriteExt;

	use super::*;

	#[tokio::test]
	async fn early_pull_captures_already_buffered_bytes() {
		let (a, mut b) = tokio::io::duplex(64);
		b.write_all(b"hi").await.unwrap();
		// Give the write a chance to land in the duplex buffer.
		tokio::task::yield_now().await;
		let mut sock = Socket::from_memory(
			a,
			proxy_transport::stream::TcpConnectionInfo {
				peer_addr: "127.0.0.1:1".parse().unwrap(),
				local_addr: "127.0.0.1:2".parse().unwrap(),
				start: std::time::Instant::now(),
			},
		);
		let pulled = early_pull(&mut sock).await.unwrap();
		assert_eq!(pulled.as_deref(), Some(&b"hi"[..]));
	}

	#[tokio::test]
	async fn early_pull_returns_none_when_nothing_buffered() {
		let (a, _b) = tokio::io::duplex(64);
		let mut sock = Socket::from_memory(
			a,
			proxy_transport::stream::TcpConnectionInfo {
				peer_addr: "127.0.0.1:1".parse().unwrap(),
				local_addr: "127.0.0.1:2".parse().unwrap(),
				start: std::time::Instant::now(),
			},
		);
		let pulled = early_pull(&mut sock).await.unwrap();
		assert!(pulled.is_none());
	}
}
