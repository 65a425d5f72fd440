//! `tracing-subscriber` setup shared by the `app` binary and by tests that
//! want readable output. Log format and level are controlled by the
//! `LOG_FORMAT` and `RUST_LOG` environment variables, matching the
//! conventions of the wider proxy ambient stack.

use std::time::Instant;

use once_cell::sync::Lazy;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;

/// Process start time, used to compute uptime for status/readiness endpoints.
pub static APPLICATION_START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum LogFormat {
	#[default]
	Plain,
	Json,
}

impl std::str::FromStr for LogFormat {
	type Err = anyhow::Error;
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"json" => Ok(LogFormat::Json),
			"plain" | "text" | "" => Ok(LogFormat::Plain),
			other => Err(anyhow::anyhow!("unknown log format '{other}', expected 'plain' or 'json'")),
		}
	}
}

/// Installs the global `tracing` subscriber. Must be called once, early in
/// `main`, before any other component emits a span or event.
pub fn setup_logging(format: LogFormat) {
	Lazy::force(&APPLICATION_START_TIME);
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let registry = tracing_subscriber::registry().with(filter);
	match format {
		LogFormat::Json => {
			let layer = tracing_subscriber::fmt::layer()
				.json()
				.with_span_events(FmtSpan::CLOSE)
				.with_target(true);
			registry.with(layer).init();
		},
		LogFormat::Plain => {
			let layer = tracing_subscriber::fmt::layer().with_target(true);
			registry.with(layer).init();
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn log_format_parses_known_values() {
		assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
		assert_eq!("plain".parse::<LogFormat>().unwrap(), LogFormat::Plain);
		assert_eq!("".parse::<LogFormat>().unwrap(), LogFormat::Plain);
		assert!("xml".parse::<LogFormat>().is_err());
	}
}
