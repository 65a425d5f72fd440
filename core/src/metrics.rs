//! Lightweight counters exposed via `prometheus_client`, matching the
//! teacher's own use of that crate for connection/request counters
//! (`crates/agentgateway/src/telemetry/metrics.rs`). No HTTP exposition
//! server is wired here — `encode()` hands back the text format for a host
//! to serve however it already exposes its own admin surface.

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

pub struct Metrics {
	registry: Registry,
	pub bytes_client_to_server: Counter,
	pub bytes_server_to_client: Counter,
	pub sessions_active: Gauge,
	pub dials_broken: Counter,
}

impl Metrics {
	pub fn new() -> Self {
		let mut registry = Registry::default();
		let bytes_client_to_server = Counter::default();
		let bytes_server_to_client = Counter::default();
		let sessions_active = Gauge::default();
		let dials_broken = Counter::default();

		registry.register("bytes_client_to_server", "Total bytes pumped from client to server", bytes_client_to_server.clone());
		registry.register("bytes_server_to_client", "Total bytes pumped from server to client", bytes_server_to_client.clone());
		registry.register("sessions_active", "Upstream sessions currently held by the Session Pool", sessions_active.clone());
		registry.register("dials_broken", "Upstream dials that marked an Alt-Service Entry broken", dials_broken.clone());

		Self { registry, bytes_client_to_server, bytes_server_to_client, sessions_active, dials_broken }
	}

	/// Renders the current snapshot in the Prometheus text exposition
	/// format.
	pub fn encode(&self) -> anyhow::Result<String> {
		let mut buf = String::new();
		encode(&mut buf, &self.registry)?;
		Ok(buf)
	}
}

impl Default for Metrics {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn counters_start_at_zero_and_appear_in_the_encoded_output() {
		let metrics = Metrics::new();
		metrics.bytes_client_to_server.inc_by(42);
		let text = metrics.encode().unwrap();
		assert!(text.contains("bytes_client_to_server_total 42"));
	}
}
