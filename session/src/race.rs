//! The Transport-Race Controller (§4.3): for a given origin, decides which
//! transport to try, optionally races a usable Alt-Service entry against
//! the native dial, and records the outcome.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use proxy_core::error::ProxyError;
use proxy_core::metrics::Metrics;
use proxy_transport::endpoint::{Endpoint, Scheme, SessionKey};
use proxy_transport::stream::Socket;
use tracing::{debug, info};

use crate::altsvc::AltServiceRegistry;
use crate::dialer::Dialer;

/// Protocol versions this build will race against. h2 carries no meaningful
/// version number of its own, so advertisements for it use `1` as a nominal
/// tag; QUIC versions follow the historical gQUIC numbering also used by
/// naiveproxy (`46` is Q046), matching the worked `v="46"` examples.
const SUPPORTED_VERSIONS: &[u32] = &[1, 46];

/// Runtime policy the Transport-Race Controller enforces. Mirrors the
/// matching fields on `app::config::Config`; the app binary is expected to
/// construct this directly from its parsed configuration.
#[derive(Clone, Default)]
pub struct RaceConfig {
	/// Whether QUIC Alt-Service entries are ever considered usable at all.
	pub enable_quic: bool,
	/// If false, a QUIC dial failure classified as a network blackhole
	/// (an RTO-style timeout, rather than an explicit reset or protocol
	/// error) only bumps `recently_broken_count`, not `broken_until` — a
	/// single slow network blip should not exile the entry for minutes.
	pub mark_broken_when_network_blackholes: bool,
	/// If false, a failed QUIC alternative fails the whole dial instead of
	/// silently falling back to the primary transport.
	pub retry_without_alt_svc_on_quic_errors: bool,
	/// If non-empty, only these hosts may race a QUIC alternative.
	pub quic_host_allowlist: Arc<HashSet<String>>,
}

impl RaceConfig {
	fn quic_allowed_for(&self, host: &str) -> bool {
		self.enable_quic && (self.quic_host_allowlist.is_empty() || self.quic_host_allowlist.contains(host))
	}
}

pub struct RaceController {
	dialer: Arc<Dialer>,
	altsvc: AltServiceRegistry,
	require_confirmation: bool,
	config: RaceConfig,
	metrics: Option<Arc<Metrics>>,
}

pub struct RaceOutcome {
	pub socket: Socket,
	pub used_alt_service: bool,
}

impl RaceController {
	pub fn new(dialer: Arc<Dialer>, altsvc: AltServiceRegistry, require_confirmation: bool) -> Self {
		Self { dialer, altsvc, require_confirmation, config: RaceConfig::default(), metrics: None }
	}

	pub fn with_config(dialer: Arc<Dialer>, altsvc: AltServiceRegistry, require_confirmation: bool, config: RaceConfig) -> Self {
		Self { dialer, altsvc, require_confirmation, config, metrics: None }
	}

	pub fn with_metrics(
		dialer: Arc<Dialer>,
		altsvc: AltServiceRegistry,
		require_confirmation: bool,
		config: RaceConfig,
		metrics: Arc<Metrics>,
	) -> Self {
		Self { dialer, altsvc, require_confirmation, config, metrics: Some(metrics) }
	}

	pub async fn dial(&self, origin: Endpoint) -> Result<RaceOutcome, ProxyError> {
		let now = Instant::now();
		let host = origin.host.to_string();
		let usable = self.altsvc.get(&origin).filter(|e| !e.is_broken(now)).and_then(|e| {
			let candidate = e.advertised.iter().find(|a| {
				e.versions.contains(&a.protocol_version)
					&& SUPPORTED_VERSIONS.contains(&a.protocol_version)
					&& (a.endpoint.scheme != Scheme::Quic || self.config.quic_allowed_for(&host))
			})?;
			Some(candidate.endpoint.clone())
		});

		let Some(alt_endpoint) = usable else {
			debug!(%origin, "no usable alt-service entry, dialing directly");
			let key = SessionKey::direct(origin);
			let socket = self.dialer.dial(&key).await?;
			return Ok(RaceOutcome { socket, used_alt_service: false });
		};

		let primary_key = SessionKey::direct(origin.clone());
		let alt_key = SessionKey::direct(alt_endpoint.clone());

		let primary = self.dialer.dial(&primary_key);
		let alternative = self.dialer.dial(&alt_key);
		tokio::pin!(primary, alternative);

		let outcome = tokio::select! {
			res = &mut primary => ("primary", res),
			res = &mut alternative => ("alternative", res),
		};

		match outcome {
			("alternative", Ok(socket)) => {
				if self.require_confirmation {
					// A real confirmation probe is protocol-specific and is
					// performed by engine::facade before user data flows; here
					// we only gate the brokenness bookkeeping.
					info!(%origin, "alt-service won the race, awaiting confirmation");
				}
				self.altsvc.confirm(&origin);
				Ok(RaceOutcome { socket, used_alt_service: true })
			},
			("alternative", Err(e)) => {
				let is_blackhole = e == ProxyError::TimedOut;
				if is_blackhole && !self.config.mark_broken_when_network_blackholes {
					self.altsvc.mark_recently_broken(&origin);
				} else {
					self.altsvc.mark_broken(&origin);
					if let Some(m) = &self.metrics {
						m.dials_broken.inc();
					}
				}
				debug!(%origin, error = %e, "alt-service dial failed, falling back to primary");
				if alt_endpoint.scheme == Scheme::Quic && !self.config.retry_without_alt_svc_on_quic_errors {
					return Err(e);
				}
				let socket = primary.await?;
				Ok(RaceOutcome { socket, used_alt_service: false })
			},
			(_, Ok(socket)) => Ok(RaceOutcome { socket, used_alt_service: false }),
			(_, Err(e)) => Err(e),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn supported_versions_excludes_unknown_protocol_revisions() {
		assert!(!SUPPORTED_VERSIONS.contains(&99));
	}

	#[test]
	fn supported_versions_includes_the_advertised_quic_version() {
		assert!(SUPPORTED_VERSIONS.contains(&46));
	}

	#[test]
	fn quic_allowed_for_requires_both_enable_and_allowlist_membership() {
		let mut allowlist = HashSet::new();
		allowlist.insert("a.example.com".to_string());
		let cfg = RaceConfig { enable_quic: true, quic_host_allowlist: Arc::new(allowlist), ..RaceConfig::default() };
		assert!(cfg.quic_allowed_for("a.example.com"));
		assert!(!cfg.quic_allowed_for("b.example.com"));
		assert!(!RaceConfig::default().quic_allowed_for("a.example.com"));
	}
}
