//! The data model shared by every layer above the wire: an `Endpoint` names
//! somewhere to connect to, a `ProxyChain` names the hops used to get there,
//! and a `SessionKey` is what the Session Pool partitions on.

use std::fmt;
use std::net::SocketAddr;

use proxy_core::strng::Strng;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, serde::Serialize, serde::Deserialize)]
pub enum Scheme {
	DirectTcp,
	Tls,
	H2,
	Quic,
}

impl fmt::Display for Scheme {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Scheme::DirectTcp => "direct-tcp",
			Scheme::Tls => "tls",
			Scheme::H2 => "h2",
			Scheme::Quic => "quic",
		};
		f.write_str(s)
	}
}

/// Either a DNS name or a literal address, kept distinct so the
/// Upstream-Dialer knows whether a resolve step is needed.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Host {
	Name(Strng),
	Addr(std::net::IpAddr),
}

impl fmt::Display for Host {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Host::Name(n) => f.write_str(n),
			Host::Addr(a) => write!(f, "{a}"),
		}
	}
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Endpoint {
	pub scheme: Scheme,
	pub host: Host,
	pub port: u16,
}

impl Endpoint {
	pub fn new(scheme: Scheme, host: Host, port: u16) -> Self {
		Self { scheme, host, port }
	}

	pub fn direct_tcp(host: impl Into<Strng>, port: u16) -> Self {
		Self::new(Scheme::DirectTcp, Host::Name(host.into()), port)
	}
}

impl fmt::Display for Endpoint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
	}
}

/// Ordered sequence of hops through which a target `Endpoint` is reached. An
/// empty chain means a direct connection.
#[derive(Debug, Clone, Default, Eq, PartialEq, Hash)]
pub struct ProxyChain(Vec<Endpoint>);

impl ProxyChain {
	pub fn direct() -> Self {
		Self(Vec::new())
	}

	pub fn new(hops: Vec<Endpoint>) -> Self {
		Self(hops)
	}

	pub fn is_direct(&self) -> bool {
		self.0.is_empty()
	}

	pub fn hops(&self) -> &[Endpoint] {
		&self.0
	}
}

/// Whether this request is allowed to reuse a session observed by another
/// principal; part of the Session Key so private and shared traffic never
/// share a multiplexed connection.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default)]
pub enum Privacy {
	#[default]
	Shared,
	Private,
}

/// Opaque tag partitioning sessions across network-isolation boundaries
/// (e.g. per-tab or per-site partitioning). Two different tags never share
/// a session even for an identical destination.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Default)]
pub struct NetworkAnonymizationTag(pub Strng);

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct SessionKey {
	pub destination: Endpoint,
	pub chain: ProxyChain,
	pub privacy: Privacy,
	pub anonymization: NetworkAnonymizationTag,
}

impl SessionKey {
	pub fn direct(destination: Endpoint) -> Self {
		Self {
			destination,
			chain: ProxyChain::direct(),
			privacy: Privacy::default(),
			anonymization: NetworkAnonymizationTag::default(),
		}
	}
}

/// A resolved socket address alongside the `Endpoint` it was resolved from,
/// handed from the resolver to the dialer.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedAddr {
	pub addr: SocketAddr,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn direct_chain_is_empty() {
		assert!(ProxyChain::direct().is_direct());
		assert!(!ProxyChain::new(vec![Endpoint::direct_tcp("proxy.example", 443)]).is_direct());
	}

	#[test]
	fn session_keys_with_different_anonymization_tags_are_distinct() {
		let dest = Endpoint::direct_tcp("example.com", 443);
		let a = SessionKey {
			anonymization: NetworkAnonymizationTag("tab-1".into()),
			..SessionKey::direct(dest.clone())
		};
		let b = SessionKey {
			anonymization: NetworkAnonymizationTag("tab-2".into()),
			..SessionKey::direct(dest)
		};
		assert_ne!(a, b);
	}
}
