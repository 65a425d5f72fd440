//! The enumerated configuration options (§6): loaded from a YAML or JSON
//! file, or an inline string, the way `agentgateway-app` loads its own
//! config — `serde_yaml` first (a superset of JSON), falling back to
//! `serde_json` for a friendlier error message on a pure-JSON document.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

fn default_listen_addr() -> SocketAddr {
	"127.0.0.1:1080".parse().unwrap()
}

fn default_max_redirects() -> u32 {
	20
}

fn default_idle_connection_timeout_seconds() -> u64 {
	30
}

fn default_retransmittable_on_wire_timeout_ms() -> u64 {
	200
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
	/// Address the front door listens on.
	#[serde(default = "default_listen_addr")]
	pub listen_addr: SocketAddr,

	/// Permit QUIC at all.
	pub enable_quic: bool,

	/// See the Transport-Race Controller's confirmation gate.
	pub require_confirmation: bool,

	/// Not used by the core pump; consumed by a host embedding the facade.
	#[serde(default = "default_max_redirects")]
	pub max_redirects: u32,

	/// Session Pool idle eviction.
	#[serde(default = "default_idle_connection_timeout_seconds")]
	pub idle_connection_timeout_seconds: u64,

	/// QUIC keepalive.
	#[serde(default = "default_retransmittable_on_wire_timeout_ms")]
	pub retransmittable_on_wire_timeout_ms: u64,

	/// Whether an RTO-timeout on a QUIC session marks its Alt-Service Entry
	/// broken.
	pub mark_broken_when_network_blackholes: bool,

	/// Governs post-failure fallback to the primary transport.
	pub retry_without_alt_svc_on_quic_errors: bool,

	/// If non-empty, only these hosts may use QUIC.
	pub quic_host_allowlist: HashSet<String>,

	/// Log output format: `plain` or `json`.
	pub log_format: String,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			listen_addr: default_listen_addr(),
			enable_quic: false,
			require_confirmation: false,
			max_redirects: default_max_redirects(),
			idle_connection_timeout_seconds: default_idle_connection_timeout_seconds(),
			retransmittable_on_wire_timeout_ms: default_retransmittable_on_wire_timeout_ms(),
			mark_broken_when_network_blackholes: false,
			retry_without_alt_svc_on_quic_errors: false,
			quic_host_allowlist: HashSet::new(),
			log_format: "plain".to_string(),
		}
	}
}

impl Config {
	pub fn idle_connection_timeout(&self) -> Duration {
		Duration::from_secs(self.idle_connection_timeout_seconds)
	}

	pub fn retransmittable_on_wire_timeout(&self) -> Duration {
		Duration::from_millis(self.retransmittable_on_wire_timeout_ms)
	}

	pub fn quic_allowed_for(&self, host: &str) -> bool {
		self.enable_quic && (self.quic_host_allowlist.is_empty() || self.quic_host_allowlist.contains(host))
	}
}

/// Parses `contents` as the configuration document, preferring YAML (a
/// strict superset of JSON) and falling back to JSON's own parser so a
/// malformed JSON document gets a JSON-shaped error message.
pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
	if contents.trim().is_empty() {
		return Ok(Config::default());
	}
	match serde_yaml::from_str(contents) {
		Ok(cfg) => Ok(cfg),
		Err(yaml_err) => serde_json::from_str(contents)
			.map_err(|json_err| anyhow::anyhow!("invalid configuration (yaml: {yaml_err}; json: {json_err})")),
	}
}

pub async fn load_from_file(path: &PathBuf) -> anyhow::Result<Config> {
	let contents = fs_err::tokio::read_to_string(path).await?;
	parse_config(&contents)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_document_yields_defaults() {
		let cfg = parse_config("").unwrap();
		assert!(!cfg.enable_quic);
		assert_eq!(cfg.max_redirects, 20);
	}

	#[test]
	fn yaml_document_overrides_selected_fields() {
		let cfg = parse_config("enable_quic: true\nquic_host_allowlist: [a.example.com]\n").unwrap();
		assert!(cfg.enable_quic);
		assert!(cfg.quic_allowed_for("a.example.com"));
		assert!(!cfg.quic_allowed_for("b.example.com"));
	}

	#[test]
	fn json_document_is_also_accepted() {
		let cfg = parse_config(r#"{"require_confirmation": true}"#).unwrap();
		assert!(cfg.require_confirmation);
	}

	#[test]
	fn malformed_document_is_rejected() {
		assert!(parse_config("enable_quic: [unterminated").is_err());
	}
}
