//! A caching resolver with round-robin address rotation: each cached name
//! gets a background task that refreshes the address set on TTL expiry, so
//! steady-state lookups never block on a query.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::{ResolveError, TokioResolver};
use proxy_core::strng::Strng;
use std::sync::Arc;
use tracing::debug;

const ERROR_BACKOFF: Duration = Duration::from_secs(5);
const MINIMUM_TTL: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct CircularBuffer<T> {
	data: Box<[T]>,
	index: AtomicUsize,
}

impl<T> CircularBuffer<T> {
	fn new(items: Box<[T]>) -> Self {
		Self { data: items, index: AtomicUsize::new(0) }
	}
}

impl<T: Copy> CircularBuffer<T> {
	fn get_and_advance(&self) -> Option<T> {
		if self.data.is_empty() {
			return None;
		}
		let i = self.index.fetch_add(1, Ordering::Relaxed);
		Some(self.data[i % self.data.len()])
	}
}

#[derive(Debug, Clone)]
pub struct CachedResolver {
	dns: Arc<TokioResolver>,
	entries: Arc<Mutex<HashMap<Strng, Arc<CacheEntry>>>>,
}

#[derive(Debug)]
struct CacheEntry {
	active: AtomicBool,
	addrs: ArcSwapOption<CircularBuffer<IpAddr>>,
	notify: tokio::sync::Notify,
}

impl CacheEntry {
	async fn background(&self, name: Strng, dns: Arc<TokioResolver>, cache: Arc<Mutex<HashMap<Strng, Arc<CacheEntry>>>>) {
		self.active.store(true, Ordering::Relaxed);
		loop {
			let was_active = self.active.swap(false, Ordering::Relaxed);
			if !was_active {
				if let Ok(mut cache) = cache.lock() {
					cache.remove(&name);
				}
				return;
			}
			let next_refresh = match resolve(&dns, &name).await {
				Ok((ips, expiry)) => {
					self.addrs.store(Some(Arc::new(CircularBuffer::new(ips))));
					expiry
				},
				Err(e) => {
					self.addrs.store(Some(Arc::new(CircularBuffer::new(Default::default()))));
					debug!("resolution of {name} failed: {e}");
					Instant::now() + ERROR_BACKOFF
				},
			};
			self.notify.notify_waiters();
			sleep_until_expired(next_refresh).await;
		}
	}

	async fn next(&self) -> Option<IpAddr> {
		self.active.store(true, Ordering::Relaxed);
		let notified = self.notify.notified();
		if let Some(entry) = self.addrs.load().as_ref() {
			return entry.get_and_advance();
		}
		notified.await;
		self.addrs.load().as_ref().and_then(|cb| cb.get_and_advance())
	}
}

async fn resolve(dns: &TokioResolver, host: &str) -> Result<(Box<[IpAddr]>, Instant), ResolveError> {
	let lookup = dns.lookup_ip(host).await?;
	let expiry = lookup.valid_until();
	Ok((lookup.iter().collect(), expiry))
}

impl CachedResolver {
	pub fn new(config: ResolverConfig, opts: ResolverOpts) -> Self {
		let mut builder = hickory_resolver::Resolver::builder_with_config(config, TokioConnectionProvider::default());
		*builder.options_mut() = opts;
		Self { dns: Arc::new(builder.build()), entries: Arc::new(Mutex::new(HashMap::new())) }
	}

	pub fn system() -> Result<Self, ResolveError> {
		let builder = hickory_resolver::Resolver::builder_tokio()?;
		Ok(Self { dns: Arc::new(builder.build()), entries: Arc::new(Mutex::new(HashMap::new())) })
	}

	/// Resolves `name` to one address, rotating round-robin across the
	/// cached address set on repeated calls.
	pub async fn resolve(&self, name: Strng) -> anyhow::Result<IpAddr> {
		let entry = {
			let mut cache = self.entries.lock().unwrap();
			if let Some(entry) = cache.get(&name).cloned() {
				entry.active.store(true, Ordering::Relaxed);
				entry
			} else {
				let entry = Arc::new(CacheEntry {
					active: AtomicBool::new(false),
					addrs: Default::default(),
					notify: Default::default(),
				});
				cache.insert(name.clone(), entry.clone());
				let bg = entry.clone();
				let dns = self.dns.clone();
				let cache = self.entries.clone();
				tokio::task::spawn(async move { bg.background(name, dns, cache).await });
				entry
			}
		};
		entry.next().await.ok_or_else(|| anyhow::anyhow!("no address available for lookup"))
	}
}

async fn sleep_until_expired(valid_until: Instant) {
	let minimum = Instant::now() + MINIMUM_TTL;
	let deadline = valid_until.max(minimum);
	tokio::time::sleep_until(deadline.into()).await;
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn circular_buffer_rotates() {
		let cb = CircularBuffer::new(vec!["1.1.1.1".parse().unwrap(), "2.2.2.2".parse().unwrap()].into_boxed_slice());
		let a = cb.get_and_advance().unwrap();
		let b = cb.get_and_advance().unwrap();
		let c = cb.get_and_advance().unwrap();
		assert_ne!(a, b);
		assert_eq!(a, c);
	}

	#[test]
	fn circular_buffer_empty_returns_none() {
		let cb: CircularBuffer<IpAddr> = CircularBuffer::new(Default::default());
		assert!(cb.get_and_advance().is_none());
	}
}
