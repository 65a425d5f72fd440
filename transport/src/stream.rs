//! A transport-agnostic duplex stream: the Byte-Pump only ever sees a
//! `Socket`, never a `TcpStream` or a `quinn::SendStream` directly. This is
//! what lets the Transport-Race Controller swap a native-TCP dial for an
//! Alt-Service hop without the engine crate knowing the difference.

use std::fmt;
use std::io::{Error, IoSlice};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsStream;

#[derive(Debug, Clone)]
pub struct TcpConnectionInfo {
	pub peer_addr: SocketAddr,
	pub local_addr: SocketAddr,
	pub start: Instant,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Alpn {
	Http11,
	H2,
	Other,
}

impl From<&[u8]> for Alpn {
	fn from(value: &[u8]) -> Self {
		match value {
			b"h2" => Alpn::H2,
			b"http/1.1" => Alpn::Http11,
			_ => Alpn::Other,
		}
	}
}

#[derive(Debug, Clone)]
pub struct TlsConnectionInfo {
	pub server_name: Option<String>,
	pub negotiated_alpn: Option<Alpn>,
}

/// A multiplexed substream (h2 or QUIC), adapted to `AsyncRead`/`AsyncWrite`
/// by its owning transport.
pub trait MultiplexedStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> MultiplexedStream for T {}

pub enum SocketType {
	Tcp(TcpStream),
	Tls(Box<TlsStream<Box<SocketType>>>),
	Multiplexed(Box<dyn MultiplexedStream>),
	Memory(DuplexStream),
	Boxed(Box<SocketType>),
}

impl fmt::Debug for SocketType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			SocketType::Tcp(_) => "Tcp",
			SocketType::Tls(_) => "Tls",
			SocketType::Multiplexed(_) => "Multiplexed",
			SocketType::Memory(_) => "Memory",
			SocketType::Boxed(_) => "Boxed",
		};
		f.write_str(name)
	}
}

macro_rules! dispatch {
	($self:expr, $inner:ident => $body:expr) => {
		match $self {
			SocketType::Tcp($inner) => $body,
			SocketType::Tls($inner) => $body,
			SocketType::Multiplexed($inner) => $body,
			SocketType::Memory($inner) => $body,
			SocketType::Boxed($inner) => $body,
		}
	};
}

impl AsyncRead for SocketType {
	fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
		dispatch!(self.get_mut(), inner => Pin::new(inner).poll_read(cx, buf))
	}
}

impl AsyncWrite for SocketType {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize, Error>> {
		dispatch!(self.get_mut(), inner => Pin::new(inner).poll_write(cx, buf))
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
		dispatch!(self.get_mut(), inner => Pin::new(inner).poll_flush(cx))
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
		dispatch!(self.get_mut(), inner => Pin::new(inner).poll_shutdown(cx))
	}

	fn poll_write_vectored(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		bufs: &[IoSlice<'_>],
	) -> Poll<Result<usize, Error>> {
		dispatch!(self.get_mut(), inner => Pin::new(inner).poll_write_vectored(cx, bufs))
	}

	fn is_write_vectored(&self) -> bool {
		dispatch!(self, inner => inner.is_write_vectored())
	}
}

#[derive(Debug, Clone, Default)]
pub struct BytesCounter {
	counts: Arc<(AtomicU64, AtomicU64)>,
}

impl BytesCounter {
	pub fn sent(&self, amt: usize) {
		self.counts.0.fetch_add(amt as u64, Ordering::Relaxed);
	}

	pub fn recv(&self, amt: usize) {
		self.counts.1.fetch_add(amt as u64, Ordering::Relaxed);
	}

	pub fn load(&self) -> (u64, u64) {
		(self.counts.0.load(Ordering::Relaxed), self.counts.1.load(Ordering::Relaxed))
	}
}

/// Type-erased per-connection metadata: `TcpConnectionInfo`, `TlsConnectionInfo`,
/// and similar are stashed here rather than threaded through every call site.
#[derive(Debug, Clone)]
pub enum Extension {
	Single(http::Extensions),
	Wrapped(http::Extensions, Arc<Extension>),
}

impl Default for Extension {
	fn default() -> Self {
		Self::new()
	}
}

impl Extension {
	pub fn new() -> Self {
		Extension::Single(http::Extensions::new())
	}

	pub fn wrap(ext: Arc<Extension>) -> Self {
		Extension::Wrapped(http::Extensions::new(), ext)
	}

	pub fn insert<T: Clone + Send + Sync + 'static>(&mut self, val: T) -> Option<T> {
		match self {
			Extension::Single(e) | Extension::Wrapped(e, _) => e.insert(val),
		}
	}

	pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
		match self {
			Extension::Single(e) => e.get::<T>(),
			Extension::Wrapped(e, inner) => e.get::<T>().or_else(|| inner.get::<T>()),
		}
	}
}

/// A live, transport-agnostic duplex connection. This is what a Forward
/// Connection's Direction slot holds.
pub struct Socket {
	ext: Extension,
	inner: SocketType,
	counter: Option<BytesCounter>,
}

impl Socket {
	pub fn into_parts(self) -> (Extension, Option<BytesCounter>, SocketType) {
		(self.ext, self.counter, self.inner)
	}

	pub fn from_memory(stream: DuplexStream, info: TcpConnectionInfo) -> Self {
		let mut ext = Extension::new();
		ext.insert(info);
		Socket { ext, inner: SocketType::Memory(stream), counter: Some(BytesCounter::default()) }
	}

	pub fn from_tcp(stream: TcpStream) -> std::io::Result<Self> {
		let mut ext = Extension::new();
		stream.set_nodelay(true)?;
		ext.insert(TcpConnectionInfo {
			peer_addr: stream.peer_addr()?,
			local_addr: stream.local_addr()?,
			start: Instant::now(),
		});
		Ok(Socket { ext, inner: SocketType::Tcp(stream), counter: Some(BytesCounter::default()) })
	}

	pub fn from_tls(ext: Extension, counter: Option<BytesCounter>, tls: TlsStream<Box<SocketType>>) -> Self {
		Socket { ext, inner: SocketType::Tls(Box::new(tls)), counter }
	}

	pub fn from_multiplexed(ext: Extension, counter: Option<BytesCounter>, stream: Box<dyn MultiplexedStream>) -> Self {
		Socket { ext, inner: SocketType::Multiplexed(stream), counter }
	}

	pub fn ext<T: Send + Sync + 'static>(&self) -> Option<&T> {
		self.ext.get::<T>()
	}

	pub fn get_ext(&self) -> Extension {
		self.ext.clone()
	}

	pub fn counter(&self) -> Option<BytesCounter> {
		self.counter.clone()
	}

	pub async fn dial(target: SocketAddr) -> std::io::Result<Socket> {
		let stream = TcpStream::connect(target).await?;
		Socket::from_tcp(stream)
	}
}

impl AsyncRead for Socket {
	fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
		let before = buf.filled().len();
		let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
		let read = buf.filled().len() - before;
		if let Some(c) = &self.counter {
			c.recv(read);
		}
		poll
	}
}

impl AsyncWrite for Socket {
	fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize, Error>> {
		let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
		if let (Some(c), Poll::Ready(Ok(n))) = (&self.counter, &poll) {
			c.sent(*n);
		}
		poll
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
		Pin::new(&mut self.inner).poll_flush(cx)
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
		Pin::new(&mut self.inner).poll_shutdown(cx)
	}

	fn is_write_vectored(&self) -> bool {
		self.inner.is_write_vectored()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn memory_socket_counts_bytes() {
		let (a, mut b) = tokio::io::duplex(64);
		let info = TcpConnectionInfo {
			peer_addr: "127.0.0.1:1".parse().unwrap(),
			local_addr: "127.0.0.1:2".parse().unwrap(),
			start: Instant::now(),
		};
		let mut sock = Socket::from_memory(a, info);
		tokio::io::AsyncWriteExt::write_all(&mut b, b"hello").await.unwrap();
		let mut buf = [0u8; 5];
		tokio::io::AsyncReadExt::read_exact(&mut sock, &mut buf).await.unwrap();
		assert_eq!(&buf, b"hello");
		assert_eq!(sock.counter().unwrap().load().1, 5);
	}
}
