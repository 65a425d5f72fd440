//! The Byte-Pump (§4.1): moves bytes between the two Direction slots of a
//! Forward Connection until both are closed, with bounded per-direction
//! progress before yielding back to the scheduler. The algorithm, including
//! the exact yield thresholds and the early-pull trick, is grounded on
//! naiveproxy's `NaiveConnection` state machine.

use std::time::{Duration, Instant};

use proxy_core::error::{CopyError, ProxyError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

/// Bytes read before a direction yields its task back to the scheduler tail
/// instead of continuing inline.
pub const YIELD_BYTES: usize = 32 * 1024;
/// Wall-clock budget before a direction yields even if under the byte
/// threshold, so one fast direction cannot starve the other.
pub const YIELD_AFTER: Duration = Duration::from_millis(20);

const READ_BUF_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Direction {
	Client,
	Server,
}

pub(crate) fn classify_io_error(e: std::io::Error) -> ProxyError {
	use std::io::ErrorKind::*;
	// ENOBUFS (Linux errno 105): the kernel socket buffer is momentarily
	// exhausted, not a dead connection. Distinct from `WouldBlock`, which
	// tokio's AsyncWrite already retries internally.
	if e.raw_os_error() == Some(105) {
		return ProxyError::NoBufferSpace;
	}
	match e.kind() {
		ConnectionReset => ProxyError::ConnectionReset,
		ConnectionRefused => ProxyError::ConnectionRefused,
		ConnectionAborted | BrokenPipe => ProxyError::ConnectionClosed,
		TimedOut => ProxyError::TimedOut,
		_ => ProxyError::ConnectionFailed,
	}
}

/// Attempts after which `write_all_retrying` gives up on `NoBufferSpace`.
const NOBUFS_MAX_ATTEMPTS: u32 = 12;
/// Backoff before the first retry.
const NOBUFS_BASE_BACKOFF: Duration = Duration::from_millis(10);
/// Backoff ceiling; with the base above, 12 attempts sum to roughly 4.5s.
const NOBUFS_MAX_BACKOFF: Duration = Duration::from_millis(640);

/// Like `AsyncWriteExt::write_all`, but retries in place on `NoBufferSpace`
/// with a capped exponential backoff instead of surfacing the error
/// immediately. Any other error is returned unchanged on the first failure.
async fn write_all_retrying(to: &mut (impl AsyncWrite + Unpin), buf: &[u8]) -> Result<(), ProxyError> {
	let mut attempt = 0u32;
	loop {
		match to.write_all(buf).await {
			Ok(()) => return Ok(()),
			Err(e) => {
				let err = classify_io_error(e);
				if err != ProxyError::NoBufferSpace || attempt >= NOBUFS_MAX_ATTEMPTS {
					return Err(err);
				}
				let backoff = NOBUFS_BASE_BACKOFF.saturating_mul(1 << attempt).min(NOBUFS_MAX_BACKOFF);
				tokio::time::sleep(backoff).await;
				attempt += 1;
			},
		}
	}
}

/// Copies from `from` to `to` until EOF, an error, or `disconnect` fires.
/// `early` is written first if present — this is how the Byte-Pump's
/// pre-dial read on the client socket gets delivered to the upstream
/// without being lost.
async fn copy_direction(
	mut from: impl AsyncRead + Unpin,
	mut to: impl AsyncWrite + Unpin,
	early: Option<Vec<u8>>,
	mut disconnect: watch::Receiver<bool>,
) -> Result<(), ProxyError> {
	if let Some(chunk) = early
		&& !chunk.is_empty()
	{
		write_all_retrying(&mut to, &chunk).await?;
	}

	let mut buf = vec![0u8; READ_BUF_SIZE];
	let mut bytes_since_yield = 0usize;
	let mut yield_deadline = Instant::now() + YIELD_AFTER;

	loop {
		if *disconnect.borrow() {
			return Ok(());
		}
		tokio::select! {
			biased;
			_ = disconnect.changed() => {
				return Ok(());
			}
			res = from.read(&mut buf) => {
				let n = res.map_err(classify_io_error)?;
				if n == 0 {
					return Ok(());
				}
				write_all_retrying(&mut to, &buf[..n]).await?;

				bytes_since_yield += n;
				let now = Instant::now();
				if bytes_since_yield > YIELD_BYTES || now > yield_deadline {
					bytes_since_yield = 0;
					yield_deadline = now + YIELD_AFTER;
					tokio::task::yield_now().await;
				}
			}
		}
	}
}

/// Runs the full-duplex loop over an already-connected client/server pair.
/// `early_pull` is the result of the pre-dial read on the client socket, if
/// any bytes were captured before the upstream was reachable.
///
/// Resolves with `ok` on clean half-closes; implements the
/// `OnBothDisconnected` preference rule when both sides fail: the
/// client-side error wins unless it is a plain `connection_closed`, in
/// which case the (usually more informative) server-side error is reported
/// instead.
pub async fn run<C, S>(client: C, server: S, early_pull: Option<Vec<u8>>) -> Result<(), CopyError>
where
	C: AsyncRead + AsyncWrite + Unpin,
	S: AsyncRead + AsyncWrite + Unpin,
{
	let (client_r, client_w) = tokio::io::split(client);
	let (server_r, server_w) = tokio::io::split(server);
	let (disc_tx, disc_rx) = watch::channel(false);

	let mut c2s = Box::pin(copy_direction(client_r, server_w, early_pull, disc_rx.clone()));
	let mut s2c = Box::pin(copy_direction(server_r, client_w, None, disc_rx));

	let (first, pending, first_is_client) = tokio::select! {
		r = &mut c2s => (r, s2c, true),
		r = &mut s2c => (r, c2s, false),
	};
	// The side that finished first disconnects the other: wake its select
	// loop even if it is parked on a read that may never complete.
	let _ = disc_tx.send(true);
	let second = pending.await;

	let (client_result, server_result) = if first_is_client { (first, second) } else { (second, first) };

	match (client_result, server_result) {
		(Ok(()), Ok(())) => Ok(()),
		(Err(c), Ok(())) => Err(CopyError::Client(c)),
		(Ok(()), Err(s)) => Err(CopyError::Server(s)),
		(Err(c), Err(s)) => Err(CopyError::prefer(c, s)),
	}
}

#[cfg(test)]
mod tests {
	use std::pin::Pin;
	use std::task::{Context, Poll};

	use tokio::io::AsyncWriteExt;

	use super::*;

	/// Fails the first `fail_count` writes with a simulated ENOBUFS, then
	/// succeeds.
	struct FlakyWriter {
		fail_count: u32,
		written: Vec<u8>,
	}

	impl AsyncWrite for FlakyWriter {
		fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
			let this = self.get_mut();
			if this.fail_count > 0 {
				this.fail_count -= 1;
				return Poll::Ready(Err(std::io::Error::from_raw_os_error(105)));
			}
			this.written.extend_from_slice(buf);
			Poll::Ready(Ok(buf.len()))
		}

		fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
			Poll::Ready(Ok(()))
		}

		fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
			Poll::Ready(Ok(()))
		}
	}

	#[test]
	fn classify_io_error_maps_enobufs_to_no_buffer_space() {
		let e = std::io::Error::from_raw_os_error(105);
		assert_eq!(classify_io_error(e), ProxyError::NoBufferSpace);
	}

	#[tokio::test(start_paused = true)]
	async fn write_all_retrying_recovers_from_transient_enobufs() {
		let mut w = FlakyWriter { fail_count: 3, written: Vec::new() };
		write_all_retrying(&mut w, b"hello").await.unwrap();
		assert_eq!(w.written, b"hello");
	}

	#[tokio::test(start_paused = true)]
	async fn write_all_retrying_gives_up_after_max_attempts() {
		let mut w = FlakyWriter { fail_count: NOBUFS_MAX_ATTEMPTS + 1, written: Vec::new() };
		let err = write_all_retrying(&mut w, b"hello").await.unwrap_err();
		assert_eq!(err, ProxyError::NoBufferSpace);
	}

	#[tokio::test]
	async fn forwards_bytes_until_eof() {
		let (client, mut client_peer) = tokio::io::duplex(1024);
		let (server, mut server_peer) = tokio::io::duplex(1024);

		let pump = tokio::spawn(run(client, server, None));

		client_peer.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
		let mut buf = vec![0u8; 64];
		let n = tokio::io::AsyncReadExt::read(&mut server_peer, &mut buf).await.unwrap();
		assert_eq!(&buf[..n], b"GET / HTTP/1.1\r\n\r\n");

		server_peer.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
		let n = tokio::io::AsyncReadExt::read(&mut client_peer, &mut buf).await.unwrap();
		assert_eq!(&buf[..n], b"HTTP/1.1 200 OK\r\n\r\n");

		drop(client_peer);
		drop(server_peer);
		let result = pump.await.unwrap();
		assert!(result.is_ok());
	}

	#[tokio::test]
	async fn early_pull_bytes_are_delivered_before_anything_else() {
		let (client, client_peer) = tokio::io::duplex(1024);
		let (server, mut server_peer) = tokio::io::duplex(1024);
		drop(client_peer);

		let pump = tokio::spawn(run(client, server, Some(b"preamble".to_vec())));

		let mut buf = vec![0u8; 64];
		let n = tokio::io::AsyncReadExt::read(&mut server_peer, &mut buf).await.unwrap();
		assert_eq!(&buf[..n], b"preamble");

		drop(server_peer);
		let _ = pump.await.unwrap();
	}

	#[tokio::test]
	async fn clean_close_on_both_sides_is_ok() {
		let (client, client_peer) = tokio::io::duplex(1024);
		let (server, server_peer) = tokio::io::duplex(1024);
		drop(client_peer);
		drop(server_peer);

		let result = run(client, server, None).await;
		// Both directions see immediate EOF (Ok), not an error, since
		// `duplex` delivers a clean close rather than a reset.
		assert!(result.is_ok());
	}

	#[test]
	fn prefer_rule_matches_core_error_semantics() {
		let err = CopyError::prefer(ProxyError::ConnectionClosed, ProxyError::ConnectionReset);
		assert!(matches!(err, CopyError::Server(ProxyError::ConnectionReset)));
	}
}
