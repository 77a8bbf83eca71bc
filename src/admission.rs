//! Dial admission (component E): enforces `max_conns_per_host`, queuing dial
//! requests past the cap and releasing the next queued waiter the moment an
//! in-flight dial finishes (success or failure).
//!
//! Implemented as a per-key `tokio::sync::Semaphore` (the same primitive
//! `examples/hypernetix-hyperspot/modules/system/api-gateway/src/middleware/rate_limit.rs`
//! -- a different repo in the reference pack, not this crate's own teacher --
//! uses for its own per-key admission control) rather than a hand-rolled
//! counter/queue: a semaphore permit acquired before dialling and held until
//! the dial (and, by construction, the connection's admission window)
//! completes gives exactly "increment on dial start, decrement only once the
//! dial is done" for free, and `acquire` already queues FIFO when the cap is
//! hit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::key::ConnectionKey;

/// Held for the duration of one dial attempt. Dropping it (on success or
/// failure) frees the slot for the next queued waiter, if any.
pub type AdmissionPermit = Option<OwnedSemaphorePermit>;

/// Per-host dial concurrency cap. `max_per_host == 0` means unlimited: no
/// semaphore is ever created and `acquire` returns immediately with no
/// permit to hold.
pub struct Admission {
	max_per_host: usize,
	semaphores: Mutex<HashMap<ConnectionKey, Arc<Semaphore>>>,
}

impl Admission {
	pub fn new(max_per_host: usize) -> Self {
		Admission {
			max_per_host,
			semaphores: Mutex::new(HashMap::new()),
		}
	}

	/// Acquire a dial slot for `key`, queuing if the per-host cap is already
	/// reached. Resolves in FIFO order as held permits are dropped.
	pub async fn acquire(&self, key: &ConnectionKey) -> AdmissionPermit {
		if self.max_per_host == 0 {
			return None;
		}
		let sem = {
			let mut map = self.semaphores.lock().unwrap();
			map.entry(key.clone())
				.or_insert_with(|| Arc::new(Semaphore::new(self.max_per_host)))
				.clone()
		};
		// The semaphore is never closed, so `acquire_owned` only fails if a
		// bug drops every permit holder and the owning `Arc` along with it
		// before this call resolves -- which cannot happen, since `sem` here
		// holds its own reference.
		sem.acquire_owned().await.ok()
	}

	/// Number of dial slots currently occupied for `key` (for tests and
	/// diagnostics only).
	pub fn in_use(&self, key: &ConnectionKey) -> usize {
		let map = self.semaphores.lock().unwrap();
		match map.get(key) {
			Some(sem) => self.max_per_host.saturating_sub(sem.available_permits()),
			None => 0,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::key::Scheme;

	fn key() -> ConnectionKey {
		ConnectionKey {
			proxy: None,
			scheme: Scheme::Http,
			addr: Some("example.test:80".into()),
			force_h1: false,
		}
	}

	#[tokio::test]
	async fn unlimited_never_blocks() {
		let admission = Admission::new(0);
		let k = key();
		let _p1 = admission.acquire(&k).await;
		let _p2 = admission.acquire(&k).await;
		assert_eq!(admission.in_use(&k), 0);
	}

	#[tokio::test]
	async fn cap_is_enforced_and_released_on_drop() {
		let admission = Arc::new(Admission::new(1));
		let k = key();
		let p1 = admission.acquire(&k).await;
		assert_eq!(admission.in_use(&k), 1);

		let admission2 = admission.clone();
		let k2 = k.clone();
		let waiter = tokio::spawn(async move { admission2.acquire(&k2).await });

		tokio::task::yield_now().await;
		assert_eq!(admission.in_use(&k), 1, "second acquire should still be queued");

		drop(p1);
		let p2 = waiter.await.unwrap();
		assert_eq!(admission.in_use(&k), 1);
		drop(p2);
		assert_eq!(admission.in_use(&k), 0);
	}
}
