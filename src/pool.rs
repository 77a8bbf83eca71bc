//! Idle connection pool (component D): per-key idle lists (MRU-ordered),
//! a global LRU for the total cap, and late-binding handoff to waiters.
//!
//! Per-key state is sharded across a `flurry::HashMap` instead of a single
//! `std::sync::Mutex<HashMap<..>>`, and every idle entry's timeout is
//! actively enforced by a background watcher built on
//! `pingora_pool::ConnectionPool` -- the same two crates
//! `crates/hbone/src/pool.rs` reaches for (`established_conn_writelock` for
//! per-key sharding, `connected_pool`/`maybe_checkin_conn` for idle-timeout
//! eviction) rather than hand-rolling either concern.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, trace, Instrument};

use crate::conn::PersistentConnection;
use crate::error::{Error, Result};
use crate::h2conn::H2Connection;
use crate::key::ConnectionKey;
use crate::waiter::{Delivery, WaitQueue, WaitingDialer};

/// Either kind of connection the pool can hold idle.
#[derive(Clone)]
pub enum PooledConn {
	Http1(Arc<PersistentConnection>),
	Http2(Arc<H2Connection>),
}

impl PooledConn {
	fn is_broken(&self) -> bool {
		match self {
			PooledConn::Http1(c) => c.is_broken(),
			PooledConn::Http2(c) => c.is_broken(),
		}
	}

	fn mark_reused(&self) {
		if let PooledConn::Http1(c) = self {
			c.mark_reused();
		}
	}

	fn key(&self) -> &ConnectionKey {
		match self {
			PooledConn::Http1(c) => &c.key,
			PooledConn::Http2(c) => &c.key,
		}
	}

	fn is_http2(&self) -> bool {
		matches!(self, PooledConn::Http2(_))
	}
}

/// Pingora's pool is keyed by a plain `u64` hash rather than an arbitrary
/// `Eq + Hash` type, same constraint `crates/hbone/src/pool.rs` works around
/// (see its `guarded_get`/`enforce_key_integrity`). We don't need the deep
/// equality guard it adds on top, since our idle storage lives behind the
/// flurry-sharded `PerKey` below and is never looked up by hash alone.
fn hash_key(key: &ConnectionKey) -> u64 {
	let mut hasher = DefaultHasher::new();
	key.hash(&mut hasher);
	hasher.finish()
}

struct IdleEntry {
	conn: PooledConn,
	idle_since: Instant,
	probe_id: i32,
}

#[derive(Default)]
struct PerKey {
	// MRU at the back, matching the "return the most recently used idle
	// connection" ordering guarantee.
	entries: VecDeque<IdleEntry>,
	waiters: WaitQueue<PooledConn>,
}

/// The idle pool. Per-key state (`PerKey`) is reached through a
/// `flurry::HashMap` so two callers touching different keys never contend
/// on one lock; each key's own `Mutex<PerKey>` is held briefly and never
/// across a network operation. The small `lru` ledger below is the one
/// piece of genuinely cross-key state (the total-idle cap spans every key),
/// so it keeps its own narrow `std::sync::Mutex`.
pub struct Pool {
	per_key: flurry::HashMap<ConnectionKey, Arc<Mutex<PerKey>>>,
	lru: Mutex<VecDeque<(ConnectionKey, i32, Instant)>>,
	// Active idle-timeout enforcement: one `pingora_pool::ConnectionPool`
	// slot is reserved per idle entry purely as a scheduling primitive (we
	// do not store connections in it), so a connection left idle past
	// `idle_conn_timeout` is evicted even if nobody ever asks for that key
	// again, rather than only being noticed lazily on the next checkout.
	idle_probe: Arc<pingora_pool::ConnectionPool<()>>,
	next_probe_id: AtomicI32,
	drain_tx: watch::Sender<bool>,
	drain_rx: watch::Receiver<bool>,
	closed: AtomicBool,
	max_idle_total: usize,
	max_idle_per_host: usize,
	idle_conn_timeout: Duration,
	disable_keep_alives: bool,
	/// When set, `get_h2` skips an idle h2 connection that is already at
	/// `max_concurrent_streams` instead of handing it out and letting the
	/// extra stream queue inside `h2` -- the dispatcher dials a fresh
	/// connection for that caller instead.
	strict_max_concurrent_streams: bool,
}

impl Pool {
	pub fn new(
		max_idle_total: usize,
		max_idle_per_host: usize,
		idle_conn_timeout: Duration,
		disable_keep_alives: bool,
		strict_max_concurrent_streams: bool,
	) -> Arc<Self> {
		let (drain_tx, drain_rx) = watch::channel(false);
		Arc::new(Pool {
			per_key: flurry::HashMap::new(),
			lru: Mutex::new(VecDeque::new()),
			// Resize hint only, per `crates/hbone/src/pool.rs`'s own comment
			// on its `ConnectionPool::new(500)`: the number of distinct keys
			// expected before the backing map resizes, not a hard cap.
			idle_probe: Arc::new(pingora_pool::ConnectionPool::new(128)),
			next_probe_id: AtomicI32::new(0),
			drain_tx,
			drain_rx,
			closed: AtomicBool::new(false),
			max_idle_total,
			max_idle_per_host,
			idle_conn_timeout,
			disable_keep_alives,
			strict_max_concurrent_streams,
		})
	}

	/// Get-or-create the `PerKey` handle for `key`, mirroring
	/// `established_conn_writelock`'s own try-then-fetch pattern: attempt an
	/// insert, ignore whether we won the race, then read back whichever
	/// value is actually there.
	fn per_key(&self, key: &ConnectionKey) -> Arc<Mutex<PerKey>> {
		let guard = self.per_key.guard();
		if let Some(existing) = self.per_key.get(key, &guard) {
			return existing.clone();
		}
		let fresh = Arc::new(Mutex::new(PerKey::default()));
		let _ = self.per_key.try_insert(key.clone(), fresh, &guard);
		self
			.per_key
			.get(key, &guard)
			.cloned()
			.expect("just inserted, or raced with another inserter")
	}

	/// Put a connection (back) into the idle pool, or reject it.
	///
	/// If a waiter is already queued for this key, delivery happens
	/// directly instead of the connection going through the idle list at
	/// all -- except for HTTP/2, which is delivered to *all* current
	/// waiters and *also* retained in the idle list, since one h2
	/// connection can serve many callers.
	pub fn try_put(self: &Arc<Self>, conn: PooledConn) -> Result<()> {
		if self.disable_keep_alives {
			return Err(Error::KeepAlivesDisabled);
		}
		if conn.is_broken() {
			return Err(Error::ConnBroken);
		}
		if self.closed.load(Ordering::SeqCst) {
			return Err(Error::CloseIdle);
		}

		let key = conn.key().clone();
		let per_key = self.per_key(&key);

		if conn.is_http2() {
			let waiters = per_key.lock().unwrap().waiters.drain_live();
			for w in &waiters {
				w.deliver(Delivery::Conn(conn.clone()));
			}
			if !waiters.is_empty() {
				debug!(%key, n = waiters.len(), "delivered h2 connection to all waiters");
			}
			self.insert_idle(key, per_key, conn);
			return Ok(());
		}

		{
			let mut guard = per_key.lock().unwrap();
			if let Some(w) = guard.waiters.pop_live() {
				drop(guard);
				w.deliver(Delivery::Conn(conn));
				debug!(%key, "delivered idle connection directly to waiter");
				return Ok(());
			}
			if guard.entries.len() >= self.max_idle_per_host {
				return Err(Error::TooManyIdlePerHost);
			}
		}
		self.insert_idle(key, per_key, conn);
		Ok(())
	}

	fn insert_idle(self: &Arc<Self>, key: ConnectionKey, per_key: Arc<Mutex<PerKey>>, conn: PooledConn) {
		let now = Instant::now();
		if let PooledConn::Http1(c) = &conn {
			c.mark_idle();
		}
		let probe_id = self.next_probe_id.fetch_add(1, Ordering::SeqCst);
		per_key.lock().unwrap().entries.push_back(IdleEntry {
			conn,
			idle_since: now,
			probe_id,
		});
		let mut to_evict = Vec::new();
		{
			let mut lru = self.lru.lock().unwrap();
			lru.push_back((key.clone(), probe_id, now));
			while self.max_idle_total > 0 && lru.len() > self.max_idle_total {
				let Some(evicted) = lru.pop_front() else {
					break;
				};
				to_evict.push(evicted);
			}
		}
		for (evict_key, evict_id, _) in to_evict {
			self.evict_entry(&evict_key, evict_id, &per_key, &key);
		}
		self.spawn_idle_watcher(key, probe_id);
	}

	/// Remove and close the idle entry `evict_id` belonging to `evict_key`,
	/// used when the global `max_idle_total` cap is exceeded. `evict_key` may
	/// or may not be the key currently being inserted into -- the entry
	/// evicted is whichever has been idle longest across the whole pool --
	/// so the already-locked `PerKey` for the current insert is reused when
	/// it applies, and looked up fresh otherwise.
	fn evict_entry(
		&self,
		evict_key: &ConnectionKey,
		evict_id: i32,
		current_per_key: &Arc<Mutex<PerKey>>,
		inserting_key: &ConnectionKey,
	) {
		let per_key = if evict_key == inserting_key {
			current_per_key.clone()
		} else {
			self.per_key(evict_key)
		};
		let evicted = {
			let mut state = per_key.lock().unwrap();
			state
				.entries
				.iter()
				.position(|e| e.probe_id == evict_id)
				.map(|pos| state.entries.remove(pos).unwrap())
		};
		if let Some(entry) = evicted {
			trace!(key = %evict_key, "evicting LRU idle connection");
			close_conn(&entry.conn, Error::TooManyIdle);
		}
	}

	/// Spawn the background watcher that actively evicts this entry once
	/// `idle_conn_timeout` elapses, instead of relying solely on the next
	/// `queue_or_get`/`get_h2` call noticing it is stale. Shaped after
	/// `PoolState::maybe_checkin_conn`'s own spawned `idle_timeout` task.
	fn spawn_idle_watcher(self: &Arc<Self>, key: ConnectionKey, probe_id: i32) {
		let pool = self.clone();
		let meta = pingora_pool::ConnectionMeta::new(hash_key(&key), probe_id);
		let (evict_rx, pickup_rx) = self.idle_probe.put(&meta, ());
		let drain_rx = self.drain_rx.clone();
		let timeout = self.idle_conn_timeout;
		tokio::spawn(
			async move {
				pool
					.idle_probe
					.idle_timeout(&meta, timeout, evict_rx, drain_rx, pickup_rx)
					.await;
				pool.expire(&key, probe_id);
			}
			.in_current_span(),
		);
	}

	/// Remove `probe_id` from `key`'s idle list if it is still there --
	/// nobody already checked it out via `queue_or_get`/`get_h2` in the
	/// meantime -- and close the connection. Our own `PerKey`/`lru`
	/// bookkeeping is the authority on "still idle", not the pingora probe
	/// pool (which we only use as a timer here).
	fn expire(&self, key: &ConnectionKey, probe_id: i32) {
		let guard = self.per_key.guard();
		let Some(per_key) = self.per_key.get(key, &guard) else {
			return;
		};
		let evicted = {
			let mut state = per_key.lock().unwrap();
			state
				.entries
				.iter()
				.position(|e| e.probe_id == probe_id)
				.map(|pos| state.entries.remove(pos).unwrap())
		};
		let Some(entry) = evicted else { return };
		remove_from_lru(&self.lru, key, probe_id);
		trace!(%key, "evicting idle connection past its idle timeout");
		close_conn(&entry.conn, Error::IdleConnTimeout);
	}

	/// Try to satisfy `waiter` from an existing idle HTTP/1.1 connection for
	/// `key`; if none is live, enqueue the waiter and return `false`.
	pub fn queue_or_get(&self, key: &ConnectionKey, waiter: Arc<WaitingDialer<PooledConn>>) -> bool {
		let per_key = self.per_key(key);
		loop {
			let candidate = {
				let mut state = per_key.lock().unwrap();
				state
					.entries
					.iter()
					.rposition(|e| matches!(e.conn, PooledConn::Http1(_)))
					.map(|pos| state.entries.remove(pos).unwrap())
			};
			let Some(entry) = candidate else { break };
			remove_from_lru(&self.lru, key, entry.probe_id);

			if entry.conn.is_broken() || entry.idle_since.elapsed() > self.idle_conn_timeout {
				close_conn(&entry.conn, Error::IdleConnTimeout);
				continue;
			}
			entry.conn.mark_reused();
			if let PooledConn::Http1(c) = &entry.conn {
				c.clear_idle();
			}
			return waiter.deliver(Delivery::Conn(entry.conn));
		}

		per_key.lock().unwrap().waiters.push(waiter);
		false
	}

	/// HTTP/2-aware variant: returns a live idle `H2Connection` for `key`
	/// without removing it from the idle list (h2 connections remain
	/// resident and multiplexed across many callers). When
	/// `strict_max_concurrent_streams` is set, a connection already at its
	/// peer-advertised `max_concurrent_streams` is skipped rather than
	/// handed out, so the dispatcher dials a fresh connection for the extra
	/// stream instead of letting `h2` queue it behind the cap.
	pub fn get_h2(&self, key: &ConnectionKey) -> Option<Arc<H2Connection>> {
		let per_key = self.per_key(key);
		let state = per_key.lock().unwrap();
		state.entries.iter().rev().find_map(|e| match &e.conn {
			PooledConn::Http2(c) if !c.is_broken() => {
				if self.strict_max_concurrent_streams && c.will_exceed_max_streams() {
					None
				} else {
					Some(c.clone())
				}
			},
			_ => None,
		})
	}

	pub fn remove_idle_http1(&self, key: &ConnectionKey, conn: &Arc<PersistentConnection>) -> bool {
		let per_key = self.per_key(key);
		let mut state = per_key.lock().unwrap();
		if let Some(pos) = state.entries.iter().position(|e| match &e.conn {
			PooledConn::Http1(c) => Arc::ptr_eq(c, conn),
			_ => false,
		}) {
			let entry = state.entries.remove(pos).unwrap();
			drop(state);
			remove_from_lru(&self.lru, key, entry.probe_id);
			true
		} else {
			false
		}
	}

	pub fn close_all_idle(&self) {
		self.closed.store(true, Ordering::SeqCst);
		let _ = self.drain_tx.send(true);

		let guard = self.per_key.guard();
		for (_, per_key) in self.per_key.iter(&guard) {
			let mut state = per_key.lock().unwrap();
			for entry in state.entries.drain(..) {
				close_conn(&entry.conn, Error::CloseIdle);
			}
		}
		self.lru.lock().unwrap().clear();
	}

	pub fn idle_count(&self) -> usize {
		self.lru.lock().unwrap().len()
	}
}

fn remove_from_lru(lru: &Mutex<VecDeque<(ConnectionKey, i32, Instant)>>, key: &ConnectionKey, probe_id: i32) {
	let mut lru = lru.lock().unwrap();
	if let Some(pos) = lru.iter().position(|(k, id, _)| k == key && *id == probe_id) {
		lru.remove(pos);
	}
}

fn close_conn(conn: &PooledConn, err: Error) {
	match conn {
		PooledConn::Http1(c) => c.close(err),
		PooledConn::Http2(c) => c.close(err),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn test_key() -> ConnectionKey {
		ConnectionKey {
			proxy: None,
			scheme: crate::key::Scheme::Http,
			addr: Some("example.test:80".into()),
			force_h1: false,
		}
	}

	fn tuning() -> crate::conn::ConnTuning {
		crate::conn::ConnTuning {
			max_response_header_bytes: 1024,
			expect_continue_timeout: std::time::Duration::from_secs(1),
			disable_compression: false,
			response_header_timeout: None,
			read_buffer_size: 4096,
			write_buffer_size: 4096,
		}
	}

	#[test]
	fn idle_count_tracks_lru() {
		let pool = Pool::new(100, 2, std::time::Duration::from_secs(90), false, false);
		assert_eq!(pool.idle_count(), 0);
	}

	#[tokio::test]
	async fn per_host_cap_rejects_overflow() {
		let pool = Pool::new(100, 1, std::time::Duration::from_secs(90), false, false);
		let key = test_key();
		let conn1 = PersistentConnection::spawn(key.clone(), tokio::io::empty(), tuning());
		let conn2 = PersistentConnection::spawn(key.clone(), tokio::io::empty(), tuning());
		pool.try_put(PooledConn::Http1(conn1)).unwrap();
		assert!(matches!(
			pool.try_put(PooledConn::Http1(conn2)),
			Err(Error::TooManyIdlePerHost)
		));
	}
}
