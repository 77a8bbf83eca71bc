//! Body wrappers used across the dispatcher and response decoration (H):
//! the EOF-signal body that drives connection reuse, the rewind-tracking
//! wrapper the replay predicate inspects, and the dump-tee hook point.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use tokio::sync::oneshot;

use crate::error::Error;

pin_project! {
	/// Wraps a response body so that reaching `EOF` (a `None` frame) or an
	/// early `Close`/drop signals the read loop to decide connection reuse:
	/// a body fully drained hands the connection back to the idle pool.
	pub struct EofSignalBody<B> {
		#[pin]
		inner: B,
		done: bool,
		on_done: Option<oneshot::Sender<bool>>,
	}
}

impl<B> EofSignalBody<B> {
	pub fn new(inner: B, on_done: oneshot::Sender<bool>) -> Self {
		EofSignalBody {
			inner,
			done: false,
			on_done: Some(on_done),
		}
	}

	fn fire(self: Pin<&mut Self>, clean: bool) {
		let this = self.project();
		if let Some(tx) = this.on_done.take() {
			let _ = tx.send(clean);
		}
		*this.done = true;
	}
}

impl<B: Body<Data = Bytes, Error = Error>> Body for EofSignalBody<B> {
	type Data = Bytes;
	type Error = Error;

	fn poll_frame(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<Frame<Bytes>, Error>>> {
		let this = self.as_mut().project();
		let poll = this.inner.poll_frame(cx);
		match &poll {
			Poll::Ready(None) => self.fire(true),
			Poll::Ready(Some(Err(_))) => self.fire(false),
			_ => {},
		}
		poll
	}

	fn size_hint(&self) -> SizeHint {
		self.inner.size_hint()
	}
}

impl<B> Drop for EofSignalBody<B> {
	fn drop(&mut self) {
		// An early drop without having observed `EOF` is a "caller closed
		// early" -- not a clean reuse signal.
		if !self.done {
			if let Some(tx) = self.on_done.take() {
				let _ = tx.send(false);
			}
		}
	}
}

/// Shared flip-side of a `TrackedBody`, retained by the dispatcher after the
/// body itself has been moved into a connection's write loop -- the only
/// way to observe `did_read`/`did_close` once ownership has passed on.
#[derive(Clone, Default)]
pub struct TrackedBodyHandle {
	did_read: std::sync::Arc<std::sync::atomic::AtomicBool>,
	did_close: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl TrackedBodyHandle {
	pub fn did_read(&self) -> bool {
		self.did_read.load(std::sync::atomic::Ordering::SeqCst)
	}

	/// True once either a rewind is needed (body was consumed and cannot
	/// simply be resent as-is) -- used by the replay predicate to decide
	/// whether reissuing a request needs a `BodyFactory`.
	pub fn needs_rewind(&self) -> bool {
		self.did_read.load(std::sync::atomic::Ordering::SeqCst)
			|| self.did_close.load(std::sync::atomic::Ordering::SeqCst)
	}
}

pin_project! {
	/// Records whether the body has been read from and/or closed, so the
	/// replay predicate can decide whether a rewind is needed -- and
	/// whether one is even possible -- before reissuing a request on a
	/// fresh connection.
	pub struct TrackedBody<B> {
		#[pin]
		inner: B,
		handle: TrackedBodyHandle,
	}
}

impl<B> TrackedBody<B> {
	/// Wrap `inner`, returning the body and a cheaply-cloneable handle the
	/// caller can retain after the body itself is moved elsewhere.
	pub fn new(inner: B) -> (Self, TrackedBodyHandle) {
		let handle = TrackedBodyHandle::default();
		(
			TrackedBody {
				inner,
				handle: handle.clone(),
			},
			handle,
		)
	}
}

impl<B: Body<Data = Bytes, Error = Error>> Body for TrackedBody<B> {
	type Data = Bytes;
	type Error = Error;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<Frame<Bytes>, Error>>> {
		let this = self.project();
		let poll = this.inner.poll_frame(cx);
		if matches!(poll, Poll::Ready(Some(_))) {
			this.handle.did_read.store(true, std::sync::atomic::Ordering::SeqCst);
		}
		if matches!(poll, Poll::Ready(None)) {
			this.handle.did_close.store(true, std::sync::atomic::Ordering::SeqCst);
		}
		poll
	}

	fn size_hint(&self) -> SizeHint {
		self.inner.size_hint()
	}
}

/// A body factory: regenerates a fresh, unread body for replay. Supplied by
/// the caller for any streaming body that cannot simply be re-read from a
/// buffer.
pub trait BodyFactory: Send + Sync {
	fn make(&self) -> crate::conn::ReqBody;
}

/// Sink invoked with the raw bytes flowing through a body, without
/// perturbing the stream -- the hook point for an outer dump/tracing
/// library; this crate defines only the hook.
pub type TeeSink = std::sync::Arc<dyn Fn(&[u8]) + Send + Sync>;

pin_project! {
	pub struct TeeBody<B> {
		#[pin]
		inner: B,
		sinks: Vec<TeeSink>,
	}
}

impl<B> TeeBody<B> {
	pub fn new(inner: B, sinks: Vec<TeeSink>) -> Self {
		TeeBody { inner, sinks }
	}
}

impl<B: Body<Data = Bytes, Error = Error>> Body for TeeBody<B> {
	type Data = Bytes;
	type Error = Error;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<Frame<Bytes>, Error>>> {
		let this = self.project();
		let poll = this.inner.poll_frame(cx);
		if let Poll::Ready(Some(Ok(frame))) = &poll {
			if let Some(data) = frame.data_ref() {
				for sink in this.sinks.iter() {
					sink(data);
				}
			}
		}
		poll
	}

	fn size_hint(&self) -> SizeHint {
		self.inner.size_hint()
	}
}

#[cfg(test)]
mod tests {
	use http_body_util::{BodyExt, Full};

	use super::*;

	fn full(data: &'static str) -> impl Body<Data = Bytes, Error = Error> {
		Full::new(Bytes::from_static(data.as_bytes())).map_err(|never: std::convert::Infallible| match never {})
	}

	#[tokio::test]
	async fn tracked_body_reports_read_and_close() {
		let (body, handle) = TrackedBody::new(full("hello"));
		assert!(!handle.needs_rewind());
		let collected = body.collect().await.unwrap().to_bytes();
		assert_eq!(&collected[..], b"hello");
		assert!(handle.did_read());
		assert!(handle.needs_rewind());
	}

	#[tokio::test]
	async fn eof_signal_body_fires_true_on_clean_eof() {
		let (tx, rx) = oneshot::channel();
		let body = EofSignalBody::new(full("x"), tx);
		let _ = body.collect().await.unwrap();
		assert_eq!(rx.await, Ok(true));
	}

	#[tokio::test]
	async fn eof_signal_body_fires_false_on_early_drop() {
		let (tx, rx) = oneshot::channel();
		let body = EofSignalBody::new(full("x"), tx);
		drop(body);
		assert_eq!(rx.await, Ok(false));
	}
}
