//! Adapts an h2 or QUIC logical stream to `AsyncRead`/`AsyncWrite` so the
//! rest of the pipeline sees the same `Socket` it would for a plain TCP
//! connection. `UpstreamSession::open_stream` (in `session.rs`) is the only
//! caller; the variants here carry the per-connection handle an established
//! multiplexed session hands out fresh streams from.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use proxy_core::error::ProxyError;
use proxy_transport::endpoint::SessionKey;
use proxy_transport::stream::{Extension, Socket};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub(crate) enum MultiplexedConn {
	H2(h2::client::SendRequest<Bytes>),
	Quic(quinn::Connection),
}

/// Joins an independently-readable and independently-writable half (QUIC's
/// `open_bi` hands out two separate handles) into one duplex value.
struct JoinHalves<R, W> {
	read: R,
	write: W,
}

impl<R: AsyncRead + Unpin, W: Unpin> AsyncRead for JoinHalves<R, W> {
	fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.get_mut().read).poll_read(cx, buf)
	}
}

impl<R: Unpin, W: AsyncWrite + Unpin> AsyncWrite for JoinHalves<R, W> {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		Pin::new(&mut self.get_mut().write).poll_write(cx, buf)
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.get_mut().write).poll_flush(cx)
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.get_mut().write).poll_shutdown(cx)
	}
}

/// Adapts an h2 request/response body pair to `AsyncRead`/`AsyncWrite`. h2
/// hands back whole `Bytes` chunks rather than filling a caller-provided
/// buffer, so a partially-consumed chunk is held between polls.
struct H2Duplex {
	send: h2::SendStream<Bytes>,
	recv: h2::RecvStream,
	leftover: Option<Bytes>,
}

impl AsyncRead for H2Duplex {
	fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
		let this = self.get_mut();
		loop {
			if let Some(mut chunk) = this.leftover.take() {
				let n = chunk.len().min(buf.remaining());
				buf.put_slice(&chunk[..n]);
				let _ = this.recv.flow_control().release_capacity(n);
				chunk.advance(n);
				if !chunk.is_empty() {
					this.leftover = Some(chunk);
				}
				return Poll::Ready(Ok(()));
			}
			return match this.recv.poll_data(cx) {
				Poll::Ready(Some(Ok(chunk))) => {
					this.leftover = Some(chunk);
					continue;
				},
				Poll::Ready(Some(Err(e))) => Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e))),
				Poll::Ready(None) => Poll::Ready(Ok(())),
				Poll::Pending => Poll::Pending,
			};
		}
	}
}

impl AsyncWrite for H2Duplex {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		let this = self.get_mut();
		this.send.reserve_capacity(buf.len());
		match this.send.poll_capacity(cx) {
			Poll::Ready(Some(Ok(cap))) => {
				let n = cap.min(buf.len());
				this.send.send_data(Bytes::copy_from_slice(&buf[..n]), false).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
				Poll::Ready(Ok(n))
			},
			Poll::Ready(Some(Err(e))) => Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e))),
			Poll::Ready(None) => Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "h2 stream closed"))),
			Poll::Pending => Poll::Pending,
		}
	}

	fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Poll::Ready(Ok(()))
	}

	fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		let _ = self.get_mut().send.send_data(Bytes::new(), true);
		Poll::Ready(Ok(()))
	}
}

/// Opens a fresh bidirectional QUIC stream on an already-established
/// connection. Unlike h2, QUIC streams carry raw bytes with no framing, so
/// `open_bi`'s two halves need only be joined, not re-encoded.
pub(crate) async fn open_quic_stream(conn: &quinn::Connection) -> Result<Socket, ProxyError> {
	let (send, recv) = conn.open_bi().await.map_err(|_| ProxyError::QuicProtocolError)?;
	let joined = JoinHalves { read: recv, write: send };
	Ok(Socket::from_multiplexed(Extension::new(), None, Box::new(joined)))
}

/// Opens a fresh logical stream on an already-established h2 connection via
/// a standard (non-extended) HTTP/2 CONNECT request: `:method: CONNECT`,
/// `:authority: host:port`, no request body. A 2xx response's body is the
/// raw duplex byte stream for the tunnel.
pub(crate) async fn open_h2_stream(send_request: &h2::client::SendRequest<Bytes>, key: &SessionKey) -> Result<Socket, ProxyError> {
	let mut send_request = send_request.clone();
	let authority = format!("{}:{}", key.destination.host, key.destination.port);
	let request = http::Request::builder()
		.method(http::Method::CONNECT)
		.uri(authority)
		.body(())
		.map_err(|_| ProxyError::TunnelConnectionFailed)?;

	send_request.ready().await.map_err(|_| ProxyError::TunnelConnectionFailed)?;
	let (response_fut, send) = send_request.send_request(request, false).map_err(|_| ProxyError::TunnelConnectionFailed)?;
	let response = response_fut.await.map_err(|_| ProxyError::TunnelConnectionFailed)?;
	if !response.status().is_success() {
		return Err(ProxyError::HttpResponseCodeFailure);
	}
	let recv = response.into_body();
	let joined = H2Duplex { send, recv, leftover: None };
	Ok(Socket::from_multiplexed(Extension::new(), None, Box::new(joined)))
}
