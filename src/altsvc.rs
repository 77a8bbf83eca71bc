//! Alt-Svc cache (component G): remembers `h3` advertisements per authority
//! and probes them asynchronously, promoting the first one that succeeds.
//!
//! The core tracks and probes advertised alternatives but ships no bundled
//! HTTP/3 client of its own -- probing is expressed
//! against a pluggable `Http3Connector` trait so an outer crate can wire in
//! a real HTTP/3 stack without this module depending on one. Without a
//! connector configured, entries are parsed and recorded but never
//! promoted, which is a valid and common configuration (no h3 support
//! compiled in at all).
//!
//! The single-flight-per-authority probe shape is grounded in
//! `crates/agentgateway/src/client/dns.rs::CacheEntry::background`: a
//! background task per key owns a `Notify` so concurrent callers observing
//! the same pending entry don't each start their own probe loop.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use http::HeaderMap;
use tracing::{debug, trace};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Probes whether an advertised `h3` alternative is actually reachable.
/// Supplied by the outer library; the core has no transport-specific
/// dependency of its own for HTTP/3.
pub trait Http3Connector: Send + Sync {
	fn probe<'a>(&'a self, authority: &'a str) -> BoxFuture<'a, bool>;
}

/// One `Alt-Svc` entry: `h3=":port"; ma=seconds`. Only the `h3` protocol id
/// is recognised; every other advertised protocol is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AltSvcEntry {
	pub port: u16,
	pub max_age: Duration,
}

struct PendingProbe {
	entries: Vec<AltSvcEntry>,
	current_index: usize,
	last_probe_time: Option<Instant>,
	probing: bool,
}

struct Inner {
	/// Authority -> the alternative currently chosen and verified reachable.
	chosen: HashMap<String, AltSvcEntry>,
	/// Authority -> advertised-but-not-yet-verified entries.
	pending: HashMap<String, PendingProbe>,
}

/// Per-authority alt-svc bookkeeping plus the probe loop that promotes a
/// pending entry to `chosen` on first success.
pub struct AltSvcCache {
	inner: Mutex<Inner>,
	connector: Option<Arc<dyn Http3Connector>>,
}

impl AltSvcCache {
	pub fn new(connector: Option<Arc<dyn Http3Connector>>) -> Self {
		AltSvcCache {
			inner: Mutex::new(Inner {
				chosen: HashMap::new(),
				pending: HashMap::new(),
			}),
			connector,
		}
	}

	/// The chosen, already-verified alternative for `authority`, if any.
	pub fn chosen(&self, authority: &str) -> Option<AltSvcEntry> {
		self.inner.lock().unwrap().chosen.get(authority).cloned()
	}

	/// Record an `Alt-Svc` response header for `authority`. Entries are
	/// merged into the pending set; if a connector is configured and no
	/// probe is already in flight for this authority, a probe task is
	/// spawned.
	pub fn observe(self: &Arc<Self>, authority: &str, headers: &HeaderMap) {
		let Some(raw) = headers.get(http::header::ALT_SVC) else {
			return;
		};
		let Ok(raw) = raw.to_str() else { return };
		let entries = parse_alt_svc(raw);
		if entries.is_empty() {
			return;
		}

		let should_spawn = {
			let mut inner = self.inner.lock().unwrap();
			if inner.chosen.contains_key(authority) {
				// Already have a verified alternative; new advertisements
				// still get recorded in case the current one later fails.
			}
			let pending = inner
				.pending
				.entry(authority.to_string())
				.or_insert_with(|| PendingProbe {
					entries: Vec::new(),
					current_index: 0,
					last_probe_time: None,
					probing: false,
				});
			for e in entries {
				if !pending.entries.contains(&e) {
					pending.entries.push(e);
				}
			}
			if pending.probing {
				false
			} else {
				pending.probing = true;
				true
			}
		};

		if should_spawn {
			if let Some(connector) = self.connector.clone() {
				let cache = self.clone();
				let authority = authority.to_string();
				tokio::spawn(async move {
					cache.probe_loop(authority, connector).await;
				});
			} else {
				// No connector configured: leave the entries recorded but
				// mark probing done so a future `observe` can try again once
				// one is (there is no dynamic reconfiguration in this core,
				// so in practice this simply never re-spawns).
				let mut inner = self.inner.lock().unwrap();
				if let Some(p) = inner.pending.get_mut(authority) {
					p.probing = false;
				}
			}
		}
	}

	/// Mark the currently-chosen alternative for `authority` as failed: it
	/// is removed from `chosen` and the next pending entry (if any) is
	/// probed. Called by the dispatcher when a round trip against the
	/// chosen alternative fails.
	pub fn mark_failed(self: &Arc<Self>, authority: &str) {
		let (entries_remaining, connector) = {
			let mut inner = self.inner.lock().unwrap();
			inner.chosen.remove(authority);
			let remaining = inner
				.pending
				.get(authority)
				.map(|p| p.current_index < p.entries.len())
				.unwrap_or(false);
			(remaining, self.connector.clone())
		};
		if entries_remaining {
			if let Some(connector) = connector {
				let cache = self.clone();
				let authority = authority.to_string();
				tokio::spawn(async move {
					cache.probe_loop(authority, connector).await;
				});
			}
		}
	}

	async fn probe_loop(self: Arc<Self>, authority: String, connector: Arc<dyn Http3Connector>) {
		loop {
			let candidate = {
				let mut inner = self.inner.lock().unwrap();
				let Some(pending) = inner.pending.get_mut(&authority) else {
					return;
				};
				if inner.chosen.contains_key(&authority) {
					pending.probing = false;
					return;
				}
				let entry = pending.entries.get(pending.current_index).cloned();
				pending.last_probe_time = Some(Instant::now());
				entry
			};

			let Some(entry) = candidate else {
				let mut inner = self.inner.lock().unwrap();
				if let Some(p) = inner.pending.get_mut(&authority) {
					p.probing = false;
				}
				return;
			};

			let ok = connector.probe(&authority).await;
			let mut inner = self.inner.lock().unwrap();
			if ok {
				// First success wins: if another probe already raced us to
				// `chosen` for this authority, keep that one.
				inner.chosen.entry(authority.clone()).or_insert(entry);
				debug!(authority, "alt-svc h3 candidate verified");
				if let Some(p) = inner.pending.get_mut(&authority) {
					p.probing = false;
				}
				return;
			}
			trace!(authority, "alt-svc h3 candidate probe failed, trying next");
			if let Some(p) = inner.pending.get_mut(&authority) {
				p.current_index += 1;
			}
		}
	}
}

/// Parse an `Alt-Svc` header value into its `h3` entries, ignoring any
/// advertised protocol other than `h3`.
fn parse_alt_svc(raw: &str) -> Vec<AltSvcEntry> {
	if raw.eq_ignore_ascii_case("clear") {
		return Vec::new();
	}
	let mut out = Vec::new();
	for item in raw.split(',') {
		let mut params = item.split(';').map(str::trim);
		let Some(proto_and_port) = params.next() else {
			continue;
		};
		let Some((proto, port_str)) = proto_and_port.split_once('=') else {
			continue;
		};
		if proto.trim() != "h3" {
			continue;
		}
		let port_str = port_str.trim().trim_matches('"');
		let Some(port_str) = port_str.strip_prefix(':') else {
			continue;
		};
		let Ok(port) = port_str.parse::<u16>() else {
			continue;
		};
		let mut max_age = Duration::from_secs(86400);
		for param in params {
			if let Some(ma) = param.strip_prefix("ma=") {
				if let Ok(secs) = ma.trim().parse::<u64>() {
					max_age = Duration::from_secs(secs);
				}
			}
		}
		out.push(AltSvcEntry { port, max_age });
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_h3_entry_with_max_age() {
		let entries = parse_alt_svc(r#"h3=":443"; ma=3600"#);
		assert_eq!(entries.len(), 1);
		assert_eq!(entries[0].port, 443);
		assert_eq!(entries[0].max_age, Duration::from_secs(3600));
	}

	#[test]
	fn ignores_non_h3_protocols() {
		let entries = parse_alt_svc(r#"h2=":443"; ma=3600, h3=":8443""#);
		assert_eq!(entries.len(), 1);
		assert_eq!(entries[0].port, 8443);
	}

	#[test]
	fn clear_yields_no_entries() {
		assert!(parse_alt_svc("clear").is_empty());
	}

	#[tokio::test]
	async fn first_success_wins_and_is_cached() {
		struct AlwaysOk;
		impl Http3Connector for AlwaysOk {
			fn probe<'a>(&'a self, _authority: &'a str) -> BoxFuture<'a, bool> {
				Box::pin(async { true })
			}
		}
		let cache = Arc::new(AltSvcCache::new(Some(Arc::new(AlwaysOk))));
		let mut headers = HeaderMap::new();
		headers.insert(http::header::ALT_SVC, r#"h3=":443"; ma=3600"#.parse().unwrap());
		cache.observe("example.test:443", &headers);

		for _ in 0..50 {
			if cache.chosen("example.test:443").is_some() {
				break;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		assert_eq!(cache.chosen("example.test:443").unwrap().port, 443);
	}
}
