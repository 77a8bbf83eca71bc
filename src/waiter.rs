//! `WaitingDialer` and `WaitQueue` -- the late-binding rendezvous between a
//! request that needs a connection and whichever of {idle pool, fresh dial}
//! produces one first. Generic over the delivered payload (`PooledConn` in
//! the pool, but kept payload-agnostic here so this module has no
//! dependency on the connection types it is rendezvousing).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::error::Error;

/// Outcome delivered to a waiter.
pub enum Delivery<T> {
	Conn(T),
	Err(Error),
}

/// A one-shot rendezvous between a request wanting a connection for a given
/// key and whichever of {newly-idle connection, completed dial} satisfies it
/// first. Delivery is race-free: `taken` is a compare-and-swap guard so at
/// most one deliverer wins.
pub struct WaitingDialer<T> {
	taken: AtomicBool,
	sender: Mutex<Option<oneshot::Sender<Delivery<T>>>>,
}

impl<T> WaitingDialer<T> {
	/// Returns the waiter half (to register in a `WaitQueue`) and the
	/// receiver half (for the caller to await).
	pub fn new() -> (Arc<WaitingDialer<T>>, oneshot::Receiver<Delivery<T>>) {
		let (tx, rx) = oneshot::channel();
		(
			Arc::new(WaitingDialer {
				taken: AtomicBool::new(false),
				sender: Mutex::new(Some(tx)),
			}),
			rx,
		)
	}

	/// Attempt to deliver. Returns `true` if this call won the race and the
	/// delivery was (or will be, modulo a dropped receiver) observed by the
	/// waiter; `false` if someone else already delivered or the waiter
	/// cancelled.
	pub fn deliver(&self, delivery: Delivery<T>) -> bool {
		if self
			.taken
			.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
			.is_err()
		{
			return false;
		}
		let sender = self.sender.lock().unwrap().take();
		match sender {
			Some(tx) => tx.send(delivery).is_ok(),
			None => false,
		}
	}

	/// Mark the waiter cancelled so no further delivery attempt succeeds.
	/// Returns `true` if this call won the race (i.e. no delivery happened
	/// and none ever will).
	pub fn cancel(&self) -> bool {
		self.taken
			.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
			.is_ok()
	}

	pub fn is_live(&self) -> bool {
		!self.taken.load(Ordering::SeqCst)
	}
}

/// FIFO of `WaitingDialer`s for one connection key.
///
/// Implemented as a two-stage queue (head + tail `VecDeque`, matching the
/// pattern of amortizing pop cost by swapping the drained head for the
/// buffered tail) so repeated pop-from-front doesn't shift the whole
/// backing store each time.
pub struct WaitQueue<T> {
	head: VecDeque<Arc<WaitingDialer<T>>>,
	tail: VecDeque<Arc<WaitingDialer<T>>>,
}

impl<T> Default for WaitQueue<T> {
	fn default() -> Self {
		WaitQueue {
			head: VecDeque::new(),
			tail: VecDeque::new(),
		}
	}
}

impl<T> WaitQueue<T> {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn push(&mut self, waiter: Arc<WaitingDialer<T>>) {
		self.tail.push_back(waiter);
	}

	/// Pop the next still-live waiter, skipping and discarding any that have
	/// already been cancelled or satisfied by a racing deliverer.
	pub fn pop_live(&mut self) -> Option<Arc<WaitingDialer<T>>> {
		loop {
			if self.head.is_empty() {
				if self.tail.is_empty() {
					return None;
				}
				std::mem::swap(&mut self.head, &mut self.tail);
			}
			let w = self.head.pop_front()?;
			if w.is_live() {
				return Some(w);
			}
		}
	}

	/// Drain all currently-queued waiters, discarding any already dead --
	/// used by the HTTP/2 "deliver to all waiters" rule: a freshly idle h2
	/// connection can serve every queued caller at once.
	pub fn drain_live(&mut self) -> Vec<Arc<WaitingDialer<T>>> {
		let mut all: Vec<_> = self.head.drain(..).chain(self.tail.drain(..)).collect();
		all.retain(|w| w.is_live());
		all
	}

	pub fn is_empty(&self) -> bool {
		self.head.is_empty() && self.tail.is_empty()
	}

	pub fn len(&self) -> usize {
		self.head.len() + self.tail.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn exactly_one_delivery_wins() {
		let (w, rx) = WaitingDialer::<u32>::new();
		assert!(w.deliver(Delivery::Conn(1)));
		assert!(!w.deliver(Delivery::Conn(2)));
		let got = rx.await;
		assert!(matches!(got, Ok(Delivery::Conn(1))));
	}

	#[test]
	fn cancel_before_delivery_blocks_delivery() {
		let (w, _rx) = WaitingDialer::<u32>::new();
		assert!(w.cancel());
		assert!(!w.deliver(Delivery::Conn(1)));
	}

	#[test]
	fn queue_skips_dead_waiters() {
		let mut q = WaitQueue::<u32>::new();
		let (w1, _r1) = WaitingDialer::new();
		let (w2, _r2) = WaitingDialer::new();
		w1.cancel();
		q.push(w1);
		q.push(w2.clone());
		let popped = q.pop_live().unwrap();
		assert!(Arc::ptr_eq(&popped, &w2));
	}
}
