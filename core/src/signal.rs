//! Listens for OS shutdown signals (SIGTERM/SIGINT on unix, Ctrl-C
//! elsewhere) and turns them into a single `ShutdownTrigger` the app binary
//! can await.

use tokio::sync::watch;
use tracing::info;

#[derive(Clone)]
pub struct Shutdown {
	trigger: ShutdownTrigger,
}

impl Shutdown {
	pub fn new() -> Self {
		Self { trigger: ShutdownTrigger::new() }
	}

	/// Returns a future that resolves once a shutdown signal arrives.
	pub fn trigger(&self) -> ShutdownTrigger {
		self.trigger.clone()
	}

	/// Blocks until a shutdown signal is received, logging which one fired.
	pub async fn wait(&self) {
		imp::wait_for_signal().await;
		info!("shutdown signal received");
		self.trigger.signal_tx.send_replace(true);
	}
}

impl Default for Shutdown {
	fn default() -> Self {
		Self::new()
	}
}

#[derive(Clone)]
pub struct ShutdownTrigger {
	signal_tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
	fn new() -> Self {
		Self { signal_tx: watch::Sender::new(false) }
	}

	pub async fn signaled(&self) {
		let mut rx = self.signal_tx.subscribe();
		if *rx.borrow() {
			return;
		}
		let _ = rx.changed().await;
	}
}

#[cfg(unix)]
mod imp {
	use tokio::signal::unix::{SignalKind, signal};
	use tracing::debug;

	pub async fn wait_for_signal() {
		let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
		let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
		tokio::select! {
			_ = sigterm.recv() => debug!("received SIGTERM"),
			_ = sigint.recv() => debug!("received SIGINT"),
		}
	}
}

#[cfg(not(unix))]
mod imp {
	pub async fn wait_for_signal() {
		let _ = tokio::signal::ctrl_c().await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn trigger_resolves_immediately_once_fired() {
		let shutdown = Shutdown::new();
		let trigger = shutdown.trigger();
		shutdown.trigger.signal_tx.send_replace(true);
		// already-fired trigger must not block a fresh waiter
		trigger.signaled().await;
	}
}
