//! The hot-path error taxonomy (§7): every variant here corresponds to a
//! condition the Byte-Pump and Upstream-Dialer must distinguish between in
//! order to pick the right client-facing response code or retry behavior.
//! Cold-path/setup errors (config parsing, TLS store loading) use
//! `anyhow::Result` instead and are not part of this enum.

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, Eq, PartialEq)]
pub enum ProxyError {
	#[error("operation would block")]
	IoPending,
	#[error("operation aborted")]
	Aborted,
	#[error("connection closed")]
	ConnectionClosed,
	#[error("connection reset by peer")]
	ConnectionReset,
	#[error("connection refused")]
	ConnectionRefused,
	#[error("connection failed")]
	ConnectionFailed,
	#[error("address unreachable")]
	AddressUnreachable,
	#[error("name not resolved")]
	NameNotResolved,
	#[error("timed out")]
	TimedOut,
	#[error("no buffer space available")]
	NoBufferSpace,
	#[error("certificate authority invalid")]
	CertAuthorityInvalid,
	#[error("certificate common name invalid")]
	CertCommonNameInvalid,
	#[error("certificate expired")]
	CertDateInvalid,
	#[error("certificate error")]
	CertError,
	#[error("disallowed URL scheme")]
	DisallowedUrlScheme,
	#[error("response body exceeded the configured size limit")]
	FileTooBig,
	#[error("upstream returned a failing HTTP response code")]
	HttpResponseCodeFailure,
	#[error("tunnel connection failed")]
	TunnelConnectionFailed,
	#[error("proxy authentication required")]
	ProxyAuthRequired,
	#[error("QUIC protocol error")]
	QuicProtocolError,
	#[error("QUIC handshake failed")]
	QuicHandshakeFailed,
	#[error("blocked by client policy")]
	BlockedByClient,
	#[error("message too big")]
	MsgTooBig,
}

impl ProxyError {
	/// Whether retrying the same upstream candidate (not just the next one)
	/// could plausibly succeed, used by the Proxy-Retry Throttler.
	pub fn is_transient(&self) -> bool {
		matches!(
			self,
			ProxyError::TimedOut | ProxyError::ConnectionReset | ProxyError::IoPending
		)
	}
}

#[derive(Error, Debug)]
pub enum CopyError {
	#[error("client side: {0}")]
	Client(#[source] ProxyError),
	#[error("server side: {0}")]
	Server(#[source] ProxyError),
}

impl CopyError {
	/// Implements the `OnBothDisconnected` preference rule: when both sides
	/// fail, prefer the client-side error unless it is a plain
	/// `connection_closed`, in which case the server-side error (usually more
	/// informative) wins.
	pub fn prefer(client: ProxyError, server: ProxyError) -> CopyError {
		if client == ProxyError::ConnectionClosed {
			CopyError::Server(server)
		} else {
			CopyError::Client(client)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn prefer_picks_server_error_when_client_side_is_plain_close() {
		let err = CopyError::prefer(ProxyError::ConnectionClosed, ProxyError::ConnectionReset);
		assert!(matches!(err, CopyError::Server(ProxyError::ConnectionReset)));
	}

	#[test]
	fn prefer_picks_client_error_otherwise() {
		let err = CopyError::prefer(ProxyError::ConnectionReset, ProxyError::TimedOut);
		assert!(matches!(err, CopyError::Client(ProxyError::ConnectionReset)));
	}
}
