//! The Session Pool (§4.6): lookup, insertion, aliasing, and eviction of
//! Upstream Sessions. Grounded directly on the workload HBONE connection
//! pool's design — a `pingora_pool::ConnectionPool` for LRU storage plus a
//! per-key `flurry::HashMap` of mutexes so concurrent dials for the same key
//! contend only with each other, never globally.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use proxy_core::metrics::Metrics;
use proxy_transport::endpoint::{Host, NetworkAnonymizationTag, Privacy, ProxyChain, SessionKey};
use tokio::sync::{Mutex, watch};
use tracing::{debug, trace};

/// What the pool stores per key. An `UpstreamSession` (defined in
/// `session.rs`) implements this.
pub trait PoolEntry: Clone + Send + Sync + 'static {
	/// Whether the entry is still usable, i.e. not in a terminal-error or
	/// draining state.
	fn ready_to_use(&self) -> bool;
	/// Whether a new stream would push this entry past its multiplexing
	/// limit, in which case it should not be handed out again.
	fn at_stream_capacity(&self) -> bool;
	/// Whether this entry may be reused under a Session Key naming a
	/// different host than the one it was dialed for — true iff its
	/// certificate (if any) covers `host`. The default denies aliasing;
	/// only certificate-bearing entries (TLS/h2/quic) override it.
	fn verify_alias(&self, host: &Host) -> bool {
		let _ = host;
		false
	}
}

/// The dimensions two Session Keys must share before one session may be
/// aliased across them: same proxy chain, same privacy, same
/// anonymization tag. Host is deliberately excluded — that's exactly what
/// aliasing lets differ.
#[derive(Clone, Eq, PartialEq, Hash)]
struct AliasGroup {
	chain: ProxyChain,
	privacy: Privacy,
	anonymization: NetworkAnonymizationTag,
}

impl AliasGroup {
	fn of(key: &SessionKey) -> Self {
		Self { chain: key.chain.clone(), privacy: key.privacy, anonymization: key.anonymization.clone() }
	}
}

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_CAPACITY: usize = 500;

#[derive(Clone)]
pub struct SessionPool<S: PoolEntry> {
	state: Arc<PoolState<S>>,
	pool_watcher: watch::Receiver<bool>,
}

struct PoolState<S: PoolEntry> {
	pool_notifier: watch::Sender<bool>,
	shutdown_tx: watch::Sender<bool>,
	shutdown_rx: watch::Receiver<bool>,
	connected_pool: Arc<pingora_pool::ConnectionPool<S>>,
	writelocks: flurry::HashMap<u64, Arc<Mutex<()>>>,
	// Secondary index for `find_or_alias`: which hashes belong to a given
	// alias group. Entries are pruned lazily when a lookup finds their hash
	// no longer present in `connected_pool`.
	alias_groups: std::sync::Mutex<HashMap<AliasGroup, Vec<u64>>>,
	idle_timeout: Duration,
	conn_counter: AtomicI64,
	metrics: Option<Arc<Metrics>>,
}

impl<S: PoolEntry> PoolState<S> {
	fn checkin(&self, hash: u64, group: AliasGroup, entry: S, meta: pingora_pool::ConnectionMeta) {
		if entry.at_stream_capacity() {
			debug!("entry for {:?} is at stream capacity, not returning it to the pool", meta);
			return;
		}
		let (evict, pickup) = self.connected_pool.put(&meta, entry);
		self.alias_groups.lock().unwrap().entry(group).or_default().push(hash);
		if let Some(m) = &self.metrics {
			m.sessions_active.inc();
		}
		let rx = self.shutdown_rx.clone();
		let pool = self.connected_pool.clone();
		let idle_timeout = self.idle_timeout;
		let meta2 = meta.clone();
		let metrics = self.metrics.clone();
		tokio::spawn(async move {
			pool.idle_timeout(&meta2, idle_timeout, evict, rx, pickup).await;
			if let Some(m) = &metrics {
				m.sessions_active.dec();
			}
			debug!("session {:?} evicted or checked out of the pool", meta2);
		});
		let _ = self.pool_notifier.send(true);
	}
}

impl<S: PoolEntry> Drop for PoolState<S> {
	fn drop(&mut self) {
		let _ = self.shutdown_tx.send(true);
	}
}

fn hash_key(key: &SessionKey) -> u64 {
	let mut h = DefaultHasher::new();
	key.hash(&mut h);
	h.finish()
}

impl<S: PoolEntry> SessionPool<S> {
	pub fn new() -> Self {
		Self::build(None)
	}

	pub fn with_metrics(metrics: Arc<Metrics>) -> Self {
		Self::build(Some(metrics))
	}

	fn build(metrics: Option<Arc<Metrics>>) -> Self {
		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let (pool_notifier, pool_watcher) = watch::channel(false);
		Self {
			state: Arc::new(PoolState {
				pool_notifier,
				shutdown_tx,
				shutdown_rx,
				connected_pool: Arc::new(pingora_pool::ConnectionPool::new(POOL_CAPACITY)),
				writelocks: flurry::HashMap::new(),
				alias_groups: std::sync::Mutex::new(HashMap::new()),
				idle_timeout: DEFAULT_IDLE_TIMEOUT,
				conn_counter: AtomicI64::new(0),
				metrics,
			}),
			pool_watcher,
		}
	}

	/// Exact-match lookup: a ready session under this key, if one exists.
	pub fn find(&self, key: &SessionKey) -> Option<S> {
		let hash = hash_key(key);
		let entry = self.state.connected_pool.get(&hash)?;
		if entry.ready_to_use() { Some(entry) } else { None }
	}

	/// Exact match, or a session dialed for a different host that shares
	/// this key's proxy chain, privacy, and anonymization tag, is not
	/// draining, and whose certificate `VerifyNameMatch`es this key's host.
	/// Aliased hits count as cache hits for brokenness purposes, same as an
	/// exact `find`.
	pub fn find_or_alias(&self, key: &SessionKey) -> Option<S> {
		if let Some(exact) = self.find(key) {
			return Some(exact);
		}
		let group = AliasGroup::of(key);
		let mut groups = self.state.alias_groups.lock().unwrap();
		let hashes = groups.get_mut(&group)?;
		let mut found = None;
		hashes.retain(|&hash| match self.state.connected_pool.get(&hash) {
			Some(entry) => {
				if found.is_none() && entry.ready_to_use() && entry.verify_alias(&key.destination.host) {
					found = Some(entry);
				}
				true
			},
			// Evicted since it was indexed; drop it from the group.
			None => false,
		});
		if groups.get(&group).is_some_and(Vec::is_empty) {
			groups.remove(&group);
		}
		found
	}

	/// `insert` fails (returns `false`) if a ready session already exists
	/// under this key — the caller should treat that as "someone beat us to
	/// it" and use `find` instead.
	pub fn insert(&self, key: &SessionKey, session: S) -> bool {
		if self.find(key).is_some() {
			return false;
		}
		let hash = hash_key(key);
		let meta = pingora_pool::ConnectionMeta::new(hash, self.state.conn_counter.fetch_add(1, Ordering::SeqCst));
		self.state.checkin(hash, AliasGroup::of(key), session, meta);
		true
	}

	/// Takes the per-key writelock, spawning a fresh session via `make` if
	/// no one else is already creating one for this key; otherwise waits
	/// for whoever holds the lock to finish and returns their result.
	/// Consults `find_or_alias`, not just `find`, so an existing session
	/// whose certificate covers this key's host is reused rather than
	/// redialed.
	pub async fn get_or_dial<F, Fut, E>(&self, key: &SessionKey, make: F) -> Result<S, E>
	where
		F: FnOnce() -> Fut,
		Fut: std::future::Future<Output = Result<S, E>>,
	{
		if let Some(existing) = self.find_or_alias(key) {
			return Ok(existing);
		}
		let hash = hash_key(key);
		let group = AliasGroup::of(key);
		let meta = pingora_pool::ConnectionMeta::new(hash, self.state.conn_counter.fetch_add(1, Ordering::SeqCst));

		let lock = {
			let guard = self.state.writelocks.guard();
			match self.state.writelocks.try_insert(hash, Arc::new(Mutex::new(())), &guard) {
				Ok(inserted) => inserted.clone(),
				Err(occupied) => occupied.current.clone(),
			}
		};

		match lock.try_lock() {
			Ok(_guard) => {
				trace!("won writelock for session key, dialing");
				let session = make().await?;
				self.state.checkin(hash, group, session.clone(), meta);
				Ok(session)
			},
			Err(_) => {
				debug!("another dial is in flight for this key, waiting");
				let mut watcher = self.pool_watcher.clone();
				loop {
					if let Some(existing) = self.find_or_alias(key) {
						return Ok(existing);
					}
					if watcher.changed().await.is_err() {
						// Pool shut down while we were waiting; fall back to dialing
						// ourselves rather than hanging forever.
						let session = make().await?;
						self.state.checkin(hash, group, session.clone(), meta);
						return Ok(session);
					}
				}
			},
		}
	}

	pub fn close_one(&self, key: &SessionKey) {
		let hash = hash_key(key);
		// pingora_pool has no explicit remove; an idle timeout of zero pops
		// it on the next reaper tick, which is close enough for a request
		// that should not be served again.
		let _ = self.state.connected_pool.get(&hash);
	}

	pub fn close_all(&self) {
		let _ = self.state.shutdown_tx.send(true);
	}
}

impl<S: PoolEntry> Default for SessionPool<S> {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use proxy_transport::endpoint::{Endpoint, Scheme};

	use super::*;

	#[derive(Clone)]
	struct FakeSession {
		ready: bool,
	}

	impl PoolEntry for FakeSession {
		fn ready_to_use(&self) -> bool {
			self.ready
		}
		fn at_stream_capacity(&self) -> bool {
			false
		}
	}

	fn key(host: &str) -> SessionKey {
		SessionKey::direct(Endpoint::new(Scheme::DirectTcp, proxy_transport::endpoint::Host::Name(host.into()), 443))
	}

	#[tokio::test]
	async fn insert_then_find_roundtrips() {
		let pool: SessionPool<FakeSession> = SessionPool::new();
		let k = key("example.com");
		assert!(pool.insert(&k, FakeSession { ready: true }));
		assert!(pool.find(&k).is_some());
	}

	#[tokio::test]
	async fn insert_fails_if_ready_session_exists() {
		let pool: SessionPool<FakeSession> = SessionPool::new();
		let k = key("example.com");
		assert!(pool.insert(&k, FakeSession { ready: true }));
		assert!(!pool.insert(&k, FakeSession { ready: true }));
	}

	#[tokio::test]
	async fn get_or_dial_reuses_ready_session() {
		let pool: SessionPool<FakeSession> = SessionPool::new();
		let k = key("example.com");
		pool.insert(&k, FakeSession { ready: true });
		let dial_count = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
		let dc = dial_count.clone();
		let got: Result<FakeSession, anyhow::Error> = pool
			.get_or_dial(&k, || async move {
				dc.fetch_add(1, Ordering::SeqCst);
				Ok(FakeSession { ready: true })
			})
			.await;
		assert!(got.is_ok());
		assert_eq!(dial_count.load(Ordering::SeqCst), 0);
	}
}
