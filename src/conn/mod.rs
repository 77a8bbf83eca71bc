//! Persistent HTTP/1.1 connection (component C): two concurrent tasks (the
//! write loop and the read loop) driving one wire-level socket, wired
//! together by a small set of `tokio::sync` channels.

pub mod read;
pub mod transfer;
pub mod write;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use bytes::Bytes;
use http::{HeaderMap, Request, Response};
use http_body_util::combinators::BoxBody;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::Instrument;

use crate::error::{Error, Result};
use crate::key::ConnectionKey;

pub type ReqBody = BoxBody<Bytes, Error>;

/// Per-connection tuning pulled out of `TransportOptions` at dial time, so
/// the read/write loops don't need the whole options struct.
#[derive(Debug, Clone, Copy)]
pub struct ConnTuning {
	pub max_response_header_bytes: usize,
	pub expect_continue_timeout: std::time::Duration,
	pub disable_compression: bool,
	pub response_header_timeout: Option<std::time::Duration>,
	pub read_buffer_size: usize,
	pub write_buffer_size: usize,
}

/// Whether this request qualifies for gzip auto-decode on the way back:
/// true only when the transport itself would add `Accept-Encoding: gzip`
/// (compression not disabled, and the caller didn't already set the
/// header). A caller-supplied `Accept-Encoding` means the caller wants to
/// handle decoding itself, so the read loop must leave the body alone even
/// if the server happens to answer with `Content-Encoding: gzip`.
pub(crate) fn wants_auto_accept_encoding(headers: &HeaderMap, disable_compression: bool) -> bool {
	!disable_compression && !headers.contains_key(http::header::ACCEPT_ENCODING)
}

/// A request handed to the write loop.
pub struct WriteRequest {
	pub request: Request<ReqBody>,
	pub extra_headers: HeaderMap,
	/// Set when the request carries `Expect: 100-continue`; the write loop
	/// flushes headers, then waits on this before sending the body. `true`
	/// means "send the body" (100 received, or the continue timer elapsed);
	/// `false` means "abort" (an error, or the connection closing).
	pub continue_wait: Option<oneshot::Receiver<bool>>,
	/// Write result, reported to both the caller and (via a cheap clone of
	/// the outcome) the read loop's reuse decision.
	pub reply: oneshot::Sender<Result<()>>,
}

/// Registered with the read loop alongside a `WriteRequest` so it knows a
/// response is expected and where to deliver it.
pub struct PendingResponse {
	pub reply: oneshot::Sender<Result<Response<read::IncomingBody>>>,
	/// Fires `true` once the write loop finishes the 100-continue wait with
	/// "send it", allowing the read loop to recognize a `100 Continue` and
	/// unblock the writer; `None` for requests with no `Expect` header.
	pub continue_signal: Option<oneshot::Sender<bool>>,
	/// See [`wants_auto_accept_encoding`]. Computed once at dispatch time
	/// from the same request headers the write loop sees, so the read
	/// loop's decode gate always agrees with what actually went on the wire.
	pub auto_accept_encoding: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnPhase {
	Active,
	Idle,
	Broken,
	Closed,
}

struct Shared {
	closed_error: Mutex<Option<Error>>,
	broken: AtomicBool,
	reused: AtomicBool,
	num_expected_responses: AtomicU64,
	bytes_written: AtomicU64,
	idle_since: Mutex<Option<Instant>>,
}

/// One live HTTP/1.1 socket, shared between the dispatcher (which sends
/// requests), the write loop, the read loop, and the idle pool.
pub struct PersistentConnection {
	pub key: ConnectionKey,
	shared: Shared,
	write_tx: mpsc::Sender<WriteRequest>,
	pending_tx: mpsc::Sender<PendingResponse>,
	close_tx: watch::Sender<()>,
}

impl PersistentConnection {
	/// Spawn the read and write loops over `io` and return the handle the
	/// dispatcher and pool operate on.
	pub fn spawn<IO>(key: ConnectionKey, io: IO, tuning: ConnTuning) -> std::sync::Arc<Self>
	where
		IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
	{
		let (write_tx, write_rx) = mpsc::channel::<WriteRequest>(1);
		let (pending_tx, pending_rx) = mpsc::channel::<PendingResponse>(1);
		let (close_tx, close_rx) = watch::channel(());

		let conn = std::sync::Arc::new(PersistentConnection {
			key,
			shared: Shared {
				closed_error: Mutex::new(None),
				broken: AtomicBool::new(false),
				reused: AtomicBool::new(false),
				num_expected_responses: AtomicU64::new(0),
				bytes_written: AtomicU64::new(0),
				idle_since: Mutex::new(None),
			},
			write_tx,
			pending_tx,
			close_tx,
		});

		let (reader, writer) = tokio::io::split(io);
		let reader = tokio::io::BufReader::with_capacity(tuning.read_buffer_size, reader);
		let writer = tokio::io::BufWriter::with_capacity(tuning.write_buffer_size, writer);

		let write_conn = conn.clone();
		let write_close = close_rx.clone();
		tokio::spawn(
			async move {
				write::write_loop(write_conn, writer, write_rx, write_close, tuning).await;
			}
			.in_current_span(),
		);

		let read_conn = conn.clone();
		tokio::spawn(
			async move {
				read::read_loop(read_conn, reader, pending_rx, close_rx, tuning).await;
			}
			.in_current_span(),
		);

		conn
	}

	/// Submit one request/response pair to this connection's loops. Fails
	/// immediately (without touching the wire) if the connection is already
	/// known to be broken or closed.
	pub async fn round_trip(
		&self,
		request: Request<ReqBody>,
		extra_headers: HeaderMap,
		disable_compression: bool,
	) -> Result<Response<read::IncomingBody>> {
		if let Some(e) = self.closed_error() {
			return Err(e);
		}
		self.shared
			.num_expected_responses
			.fetch_add(1, Ordering::SeqCst);

		let auto_accept_encoding = wants_auto_accept_encoding(request.headers(), disable_compression);

		let expects_continue = request
			.headers()
			.get(http::header::EXPECT)
			.map(|v| v.as_bytes().eq_ignore_ascii_case(b"100-continue"))
			.unwrap_or(false);

		let (write_reply_tx, write_reply_rx) = oneshot::channel();
		let (continue_tx, continue_rx) = if expects_continue {
			let (tx, rx) = oneshot::channel();
			(Some(tx), Some(rx))
		} else {
			(None, None)
		};

		let wr = WriteRequest {
			request,
			extra_headers,
			continue_wait: continue_rx,
			reply: write_reply_tx,
		};
		let (resp_tx, resp_rx) = oneshot::channel();
		let pending = PendingResponse {
			reply: resp_tx,
			continue_signal: continue_tx,
			auto_accept_encoding,
		};

		self
			.pending_tx
			.send(pending)
			.await
			.map_err(|_| Error::ConnBroken)?;
		self
			.write_tx
			.send(wr)
			.await
			.map_err(|_| Error::ConnBroken)?;

		// The write outcome surfaces through `reply`; a write failure that
		// wrote zero bytes is always safely replayable.
		let write_result = write_reply_rx.await.map_err(|_| Error::ConnBroken)?;
		if let Err(e) = write_result {
			return Err(e);
		}

		resp_rx.await.map_err(|_| Error::ConnBroken)?
	}

	pub fn mark_broken(&self, err: Error) {
		self.shared.broken.store(true, Ordering::SeqCst);
		self.set_closed_error(err);
	}

	pub fn is_broken(&self) -> bool {
		self.shared.broken.load(Ordering::SeqCst)
	}

	pub fn is_reused(&self) -> bool {
		self.shared.reused.load(Ordering::SeqCst)
	}

	pub fn mark_reused(&self) {
		self.shared.reused.store(true, Ordering::SeqCst);
	}

	pub fn closed_error(&self) -> Option<Error> {
		// `Error` does not implement `Clone`; callers only need to know
		// *that* it closed and, when possible, a representative reason.
		self.shared.closed_error.lock().unwrap().as_ref().map(|_| Error::ConnBroken)
	}

	pub fn set_closed_error(&self, err: Error) {
		let mut slot = self.shared.closed_error.lock().unwrap();
		if slot.is_none() {
			*slot = Some(err);
		}
		let _ = self.close_tx.send(());
	}

	pub fn close(&self, err: Error) {
		self.set_closed_error(err);
	}

	pub fn mark_idle(&self) {
		*self.shared.idle_since.lock().unwrap() = Some(Instant::now());
	}

	pub fn clear_idle(&self) {
		*self.shared.idle_since.lock().unwrap() = None;
	}

	pub fn idle_since(&self) -> Option<Instant> {
		*self.shared.idle_since.lock().unwrap()
	}

	pub fn bytes_written(&self) -> u64 {
		self.shared.bytes_written.load(Ordering::SeqCst)
	}

	pub(crate) fn add_bytes_written(&self, n: u64) {
		self.shared.bytes_written.fetch_add(n, Ordering::SeqCst);
	}
}
