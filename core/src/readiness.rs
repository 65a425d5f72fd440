//! Tracks components that must finish initializing (e.g. the DNS resolver
//! warming its cache, the listener binding its socket) before the process
//! reports itself ready.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

#[derive(Clone)]
pub struct Ready {
	inner: Arc<Inner>,
}

struct Inner {
	pending: AtomicUsize,
	notify: Notify,
}

impl Ready {
	pub fn new() -> Self {
		Self {
			inner: Arc::new(Inner { pending: AtomicUsize::new(0), notify: Notify::new() }),
		}
	}

	/// Registers one more component that must become ready. Drop the
	/// returned guard once that component has finished initializing.
	pub fn register(&self) -> BlockReady {
		self.inner.pending.fetch_add(1, Ordering::SeqCst);
		BlockReady { inner: self.inner.clone() }
	}

	/// Resolves once every outstanding `BlockReady` guard has been dropped.
	pub async fn wait(&self) {
		loop {
			if self.inner.pending.load(Ordering::SeqCst) == 0 {
				return;
			}
			self.inner.notify.notified().await;
		}
	}
}

impl Default for Ready {
	fn default() -> Self {
		Self::new()
	}
}

pub struct BlockReady {
	inner: Arc<Inner>,
}

impl Drop for BlockReady {
	fn drop(&mut self) {
		if self.inner.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
			self.inner.notify.notify_waiters();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn wait_resolves_once_all_guards_dropped() {
		let ready = Ready::new();
		let a = ready.register();
		let b = ready.register();
		let ready2 = ready.clone();
		let handle = tokio::spawn(async move {
			ready2.wait().await;
		});
		drop(a);
		tokio::task::yield_now().await;
		drop(b);
		handle.await.unwrap();
	}
}
