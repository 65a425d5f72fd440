//! Graceful-shutdown primitives shared by every long-lived task in the proxy:
//! the accept loop, each Forward Connection, and the Session Pool's idle
//! reapers all hold a `DrainWatcher` so a shutdown can wait for them to
//! finish instead of severing connections mid-flight.

use std::time::Duration;

pub use internal::{DrainMode, Signal as DrainTrigger, Watch as DrainWatcher};
use tracing::{Instrument, debug, info, warn};

/// Constructs a new drain pair. `DrainTrigger` starts a drain and waits for
/// it to complete; `DrainWatcher` should be held by anything participating in
/// the drain — it can be cloned, and the drain will not complete until every
/// outstanding clone is dropped.
pub fn new() -> (DrainTrigger, DrainWatcher) {
	internal::channel()
}

/// Runs `make_future` to completion, or until `drain` asks for a graceful
/// shutdown, in which case `make_future` is given up to `deadline` to wind
/// down before being abandoned.
pub async fn run_with_drain<F, O>(component: String, drain: DrainWatcher, deadline: Duration, make_future: F)
where
	F: AsyncFnOnce(DrainWatcher) -> O,
	O: Send + 'static,
{
	let (sub_drain_signal, sub_drain) = new();
	let fut = make_future(sub_drain).in_current_span();
	let watch = async move {
		let res = drain.wait_for_drain().await;
		if res.mode() == DrainMode::Graceful {
			info!(component, "drain started, waiting {:?} for connections to complete", deadline);
			if tokio::time::timeout(deadline, sub_drain_signal.start_drain_and_wait(DrainMode::Graceful))
				.await
				.is_err()
			{
				warn!(component, "drain deadline expired with pending connections, forcing shutdown");
			}
		} else {
			debug!(component, "terminating");
		}
		info!(component, "shutdown complete");
	};
	tokio::select! {
		_ = fut => {},
		_ = watch => {},
	}
}

mod internal {
	use tokio::sync::{mpsc, watch};

	pub fn channel() -> (Signal, Watch) {
		let (signal_tx, signal_rx) = watch::channel(None);
		let (watch_tx, watch_rx) = mpsc::channel(1);
		(
			Signal { signal_tx, watch_rx },
			Watch { signal_rx, _watch_tx: watch_tx },
		)
	}

	#[derive(Copy, Clone, Eq, PartialEq, Debug)]
	pub enum DrainMode {
		Graceful,
		Immediate,
	}

	pub struct Signal {
		signal_tx: watch::Sender<Option<DrainMode>>,
		watch_rx: mpsc::Receiver<()>,
	}

	impl Signal {
		/// Starts a drain in `mode` and waits for every outstanding `Watch` clone
		/// to be dropped.
		pub async fn start_drain_and_wait(mut self, mode: DrainMode) {
			let _ = self.signal_tx.send(Some(mode));
			// Every Watch clone holds a sender; once they're all dropped this
			// resolves with `RecvError`-equivalent `None`.
			let _ = self.watch_rx.recv().await;
		}
	}

	#[derive(Clone)]
	pub struct Watch {
		pub(super) signal_rx: watch::Receiver<Option<DrainMode>>,
		pub(super) _watch_tx: mpsc::Sender<()>,
	}

	#[derive(Copy, Clone)]
	pub struct DrainResult(DrainMode);

	impl DrainResult {
		pub fn mode(&self) -> DrainMode {
			self.0
		}
	}

	impl Watch {
		/// Resolves once a drain has been signalled.
		pub async fn wait_for_drain(mut self) -> DrainResult {
			loop {
				if let Some(mode) = *self.signal_rx.borrow() {
					return DrainResult(mode);
				}
				if self.signal_rx.changed().await.is_err() {
					return DrainResult(DrainMode::Immediate);
				}
			}
		}

		/// True once a drain has been signalled, without consuming `self`.
		pub fn is_draining(&self) -> bool {
			self.signal_rx.borrow().is_some()
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn drain_waits_for_all_watchers() {
		let (trigger, watcher) = new();
		let watcher2 = watcher.clone();
		let done = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
		let done2 = done.clone();
		tokio::spawn(async move {
			tokio::time::sleep(Duration::from_millis(10)).await;
			done2.store(true, std::sync::atomic::Ordering::SeqCst);
			drop(watcher2);
		});
		drop(watcher);
		trigger.start_drain_and_wait(DrainMode::Graceful).await;
		assert!(done.load(std::sync::atomic::Ordering::SeqCst));
	}
}
