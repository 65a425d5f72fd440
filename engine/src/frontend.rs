//! Parses the client-facing wire (§6): an HTTP CONNECT request, or a SOCKS5
//! handshake. Both hand the pump an opaque target `host:port`; the pump
//! itself is format-agnostic once the handshake completes.

use proxy_core::error::ProxyError;
use proxy_transport::endpoint::{Endpoint, Host, Scheme};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const MAX_HEADER_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct ConnectRequest {
	pub target: Endpoint,
	pub proxy_authorization: Option<String>,
}

/// Reads and parses a single `CONNECT host:port HTTP/1.1` request plus its
/// headers, terminated by a blank line.
pub async fn read_connect_request<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<ConnectRequest, ProxyError> {
	let mut total = 0usize;
	let mut line = String::new();
	reader.read_line(&mut line).await.map_err(|_| ProxyError::ConnectionFailed)?;
	total += line.len();
	let mut parts = line.trim_end().splitn(3, ' ');
	let method = parts.next().unwrap_or_default();
	let authority = parts.next().unwrap_or_default();
	if !method.eq_ignore_ascii_case("CONNECT") {
		return Err(ProxyError::DisallowedUrlScheme);
	}
	let (host, port) = parse_authority(authority)?;

	let mut proxy_authorization = None;
	loop {
		let mut header_line = String::new();
		let n = reader.read_line(&mut header_line).await.map_err(|_| ProxyError::ConnectionFailed)?;
		total += n;
		if total > MAX_HEADER_BYTES {
			return Err(ProxyError::FileTooBig);
		}
		let trimmed = header_line.trim_end();
		if trimmed.is_empty() {
			break;
		}
		if let Some((name, value)) = trimmed.split_once(':') {
			if name.trim().eq_ignore_ascii_case("proxy-authorization") {
				proxy_authorization = Some(value.trim().to_string());
			}
		}
	}

	Ok(ConnectRequest {
		target: Endpoint::new(Scheme::DirectTcp, Host::Name(host.into()), port),
		proxy_authorization,
	})
}

fn parse_authority(authority: &str) -> Result<(&str, u16), ProxyError> {
	let (host, port) = authority.rsplit_once(':').ok_or(ProxyError::DisallowedUrlScheme)?;
	let port: u16 = port.parse().map_err(|_| ProxyError::DisallowedUrlScheme)?;
	if host.is_empty() {
		return Err(ProxyError::DisallowedUrlScheme);
	}
	Ok((host, port))
}

/// Writes the success response for a CONNECT request. After this the pump
/// takes over; no further HTTP framing is involved.
pub async fn write_connect_ok<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<(), ProxyError> {
	writer.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await.map_err(|_| ProxyError::ConnectionFailed)
}

/// Writes a 407 challenge; the client may restart the CONNECT with
/// credentials.
pub async fn write_proxy_auth_required<W: AsyncWrite + Unpin>(writer: &mut W, realm: &str) -> Result<(), ProxyError> {
	let body = format!(
		"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"{realm}\"\r\nContent-Length: 0\r\n\r\n"
	);
	writer.write_all(body.as_bytes()).await.map_err(|_| ProxyError::ConnectionFailed)
}

pub async fn write_connect_failed<W: AsyncWrite + Unpin>(writer: &mut W, status: u16, reason: &str) -> Result<(), ProxyError> {
	let body = format!("HTTP/1.1 {status} {reason}\r\nContent-Length: 0\r\n\r\n");
	writer.write_all(body.as_bytes()).await.map_err(|_| ProxyError::ConnectionFailed)
}

/// Peeks the first byte to distinguish a SOCKS5 handshake (`0x05`) from an
/// HTTP CONNECT request (an ASCII method name); callers not yet needing
/// SOCKS5 support can ignore this and always call `read_connect_request`.
pub fn looks_like_socks5(first_byte: u8) -> bool {
	first_byte == 0x05
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn parses_a_minimal_connect_request() {
		let input = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n".to_vec();
		let mut reader = std::io::Cursor::new(input);
		let req = read_connect_request(&mut reader).await.unwrap();
		assert_eq!(req.target.port, 443);
		assert_eq!(req.target.host.to_string(), "example.com");
		assert!(req.proxy_authorization.is_none());
	}

	#[tokio::test]
	async fn captures_proxy_authorization_header() {
		let input = b"CONNECT example.com:443 HTTP/1.1\r\nProxy-Authorization: Basic abc123\r\n\r\n".to_vec();
		let mut reader = std::io::Cursor::new(input);
		let req = read_connect_request(&mut reader).await.unwrap();
		assert_eq!(req.proxy_authorization.as_deref(), Some("Basic abc123"));
	}

	#[tokio::test]
	async fn rejects_non_connect_methods() {
		let input = b"GET / HTTP/1.1\r\n\r\n".to_vec();
		let mut reader = std::io::Cursor::new(input);
		assert!(read_connect_request(&mut reader).await.is_err());
	}

	#[test]
	fn detects_socks5_first_byte() {
		assert!(looks_like_socks5(0x05));
		assert!(!looks_like_socks5(b'C'));
	}
}
