//! The Alt-Service Registry (§4.4): persists advertised alternative
//! services per origin and tracks their brokenness, so the Transport-Race
//! Controller knows which alternatives are currently worth racing.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use proxy_transport::endpoint::Endpoint;

const BROKEN_BASE: Duration = Duration::from_secs(300);
const BROKEN_CAP: Duration = Duration::from_secs(60 * 60 * 24 * 2);

#[derive(Debug, Clone)]
pub struct AdvertisedEndpoint {
	pub endpoint: Endpoint,
	pub protocol_version: u32,
}

#[derive(Debug, Clone)]
pub struct AltServiceEntry {
	pub advertised: Vec<AdvertisedEndpoint>,
	pub versions: Vec<u32>,
	pub expiration: Instant,
	broken_until: Option<Instant>,
	broken_count: u32,
	recently_broken_count: u32,
}

impl AltServiceEntry {
	/// True iff the entry is currently broken, i.e. `now < broken_until`.
	pub fn is_broken(&self, now: Instant) -> bool {
		self.broken_until.is_some_and(|until| now < until)
	}

	pub fn recently_broken_count(&self) -> u32 {
		self.recently_broken_count
	}
}

#[derive(Default)]
struct Registry {
	entries: HashMap<Endpoint, AltServiceEntry>,
}

#[derive(Clone, Default)]
pub struct AltServiceRegistry {
	inner: std::sync::Arc<Mutex<Registry>>,
}

impl AltServiceRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Replaces the advertised list for `origin`. Callers must ensure this is
	/// invoked at most once per response carrying the advertisement header.
	pub fn set(&self, origin: Endpoint, advertised: Vec<AdvertisedEndpoint>, expiration: Instant, versions: Vec<u32>) {
		let mut reg = self.inner.lock().unwrap();
		let entry = reg.entries.entry(origin).or_insert_with(|| AltServiceEntry {
			advertised: Vec::new(),
			versions: Vec::new(),
			expiration,
			broken_until: None,
			broken_count: 0,
			recently_broken_count: 0,
		});
		entry.advertised = advertised;
		entry.versions = versions;
		entry.expiration = expiration;
	}

	/// Returns entries not yet expired, in insertion order, lazily dropping
	/// expired ones as it encounters them.
	pub fn get(&self, origin: &Endpoint) -> Option<AltServiceEntry> {
		let now_wall = Instant::now();
		let mut reg = self.inner.lock().unwrap();
		match reg.entries.get(origin) {
			Some(e) if e.expiration > now_wall => Some(e.clone()),
			Some(_) => {
				reg.entries.remove(origin);
				None
			},
			None => None,
		}
	}

	pub fn mark_broken(&self, origin: &Endpoint) {
		let mut reg = self.inner.lock().unwrap();
		if let Some(e) = reg.entries.get_mut(origin) {
			e.broken_count += 1;
			e.recently_broken_count += 1;
			let backoff = BROKEN_BASE.saturating_mul(1 << e.broken_count.min(8)).min(BROKEN_CAP);
			e.broken_until = Some(Instant::now() + backoff);
		}
	}

	pub fn mark_recently_broken(&self, origin: &Endpoint) {
		let mut reg = self.inner.lock().unwrap();
		if let Some(e) = reg.entries.get_mut(origin) {
			e.recently_broken_count += 1;
		}
	}

	/// Clears both brokenness marks after a confirmed successful use.
	pub fn confirm(&self, origin: &Endpoint) {
		let mut reg = self.inner.lock().unwrap();
		if let Some(e) = reg.entries.get_mut(origin) {
			e.broken_until = None;
			e.recently_broken_count = 0;
		}
	}

	/// Clears all `broken_until` instants (a network change may have fixed
	/// whatever made the alternative unreachable) while preserving
	/// `recently_broken_count`, which reflects historical flakiness.
	pub fn on_default_network_changed(&self) {
		let mut reg = self.inner.lock().unwrap();
		for e in reg.entries.values_mut() {
			e.broken_until = None;
		}
	}
}

#[cfg(test)]
mod tests {
	use proxy_transport::endpoint::{Host, Scheme};

	use super::*;

	fn origin() -> Endpoint {
		Endpoint::new(Scheme::DirectTcp, Host::Name("example.com".into()), 443)
	}

	#[test]
	fn broken_entry_is_filtered_until_elapsed() {
		let reg = AltServiceRegistry::new();
		reg.set(origin(), vec![], Instant::now() + Duration::from_secs(60), vec![1]);
		reg.mark_broken(&origin());
		let e = reg.get(&origin()).unwrap();
		assert!(e.is_broken(Instant::now()));
	}

	#[test]
	fn confirm_clears_broken_mark() {
		let reg = AltServiceRegistry::new();
		reg.set(origin(), vec![], Instant::now() + Duration::from_secs(60), vec![1]);
		reg.mark_broken(&origin());
		reg.confirm(&origin());
		let e = reg.get(&origin()).unwrap();
		assert!(!e.is_broken(Instant::now()));
		assert_eq!(e.recently_broken_count(), 0);
	}

	#[test]
	fn expired_entries_are_dropped_on_read() {
		let reg = AltServiceRegistry::new();
		reg.set(origin(), vec![], Instant::now() - Duration::from_secs(1), vec![1]);
		assert!(reg.get(&origin()).is_none());
	}

	#[test]
	fn network_change_clears_broken_but_not_recently_broken_count() {
		let reg = AltServiceRegistry::new();
		reg.set(origin(), vec![], Instant::now() + Duration::from_secs(60), vec![1]);
		reg.mark_broken(&origin());
		reg.on_default_network_changed();
		let e = reg.get(&origin()).unwrap();
		assert!(!e.is_broken(Instant::now()));
		assert_eq!(e.recently_broken_count(), 1);
	}
}
