//! HTTP/2 façade over the `h2` crate, grounded in
//! `crates/hbone/src/client.rs::spawn_connection`/`drive_connection`: one
//! task drives the connection state machine while `H2Connection` hands out
//! streams to callers via a cloneable `SendRequest`.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http::{Request, Response};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex};
use tracing::{debug, error, Instrument};

use crate::config::Http2Options;
use crate::conn::read::IncomingBody;
use crate::conn::ReqBody;
use crate::error::{Error, Result};
use crate::key::ConnectionKey;

/// One live HTTP/2 connection. Unlike `PersistentConnection`, a single
/// instance serves many concurrent callers (h2 multiplexes streams over one
/// socket), so the pool retains it across deliveries instead of removing it
/// from the idle list on checkout.
pub struct H2Connection {
	pub key: ConnectionKey,
	sender: AsyncMutex<h2::client::SendRequest<Bytes>>,
	broken: AtomicBool,
	stream_count: AtomicU32,
	max_concurrent_streams: u32,
	close_tx: watch::Sender<()>,
}

impl H2Connection {
	/// Perform the h2 handshake over `io` and spawn the connection driver
	/// task. Mirrors `spawn_connection`: the driver task races the
	/// connection's own state machine against ping-timeout and an explicit
	/// drain signal (here, `close()`).
	pub async fn handshake<IO>(key: ConnectionKey, io: IO, opts: &Http2Options) -> Result<Arc<Self>>
	where
		IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
	{
		let mut builder = h2::client::Builder::new();
		if let Some(w) = opts.initial_window_size {
			builder.initial_window_size(w);
		}
		if let Some(w) = opts.initial_connection_window_size {
			builder.initial_connection_window_size(w);
		}
		if let Some(f) = opts.max_frame_size {
			builder.max_frame_size(f);
		}
		if let Some(h) = opts.max_header_list_size {
			builder.max_header_list_size(h);
		}
		if let Some(s) = opts.max_concurrent_streams {
			builder.initial_max_send_streams(s as usize);
		}
		builder
			.max_send_buffer_size(opts.max_send_buffer_size)
			.enable_push(false);

		let (send_req, connection) = builder
			.handshake::<_, Bytes>(io)
			.await
			.map_err(|e| Error::H2(e.to_string()))?;

		let max_concurrent_streams = connection
			.max_concurrent_send_streams()
			.try_into()
			.unwrap_or(u32::MAX);

		let (close_tx, close_rx) = watch::channel(());
		let ping_timeout = opts.ping_timeout;
		tokio::spawn(
			async move {
				drive_connection(connection, close_rx, ping_timeout).await;
			}
			.in_current_span(),
		);

		Ok(Arc::new(H2Connection {
			key,
			sender: AsyncMutex::new(send_req),
			broken: AtomicBool::new(false),
			stream_count: AtomicU32::new(0),
			max_concurrent_streams,
			close_tx,
		}))
	}

	pub fn is_broken(&self) -> bool {
		self.broken.load(Ordering::SeqCst)
	}

	pub fn close(&self, _err: Error) {
		self.broken.store(true, Ordering::SeqCst);
		let _ = self.close_tx.send(());
	}

	pub fn stream_count(&self) -> u32 {
		self.stream_count.load(Ordering::SeqCst)
	}

	/// Send one request over a new stream and wait for the response headers.
	/// The response body is fully buffered into a single frame to match the
	/// rest of this crate's buffered-body model (see DESIGN.md).
	pub async fn send_request(
		&self,
		request: Request<ReqBody>,
	) -> Result<Response<IncomingBody>> {
		if self.is_broken() {
			return Err(Error::ConnBroken);
		}
		self.stream_count.fetch_add(1, Ordering::SeqCst);
		let result = self.send_request_inner(request).await;
		self.stream_count.fetch_sub(1, Ordering::SeqCst);
		if result.is_err() {
			// h2 surfaces connection-fatal errors (GOAWAY, reset) through the
			// per-stream result; any error here is treated conservatively as
			// connection-ending so the pool does not keep offering it out.
			self.broken.store(true, Ordering::SeqCst);
		}
		result
	}

	async fn send_request_inner(&self, request: Request<ReqBody>) -> Result<Response<IncomingBody>> {
		use http_body_util::BodyExt;

		let (parts, body) = request.into_parts();
		let head = Request::from_parts(parts, ());

		let (response_fut, mut send_stream) = {
			let mut sender = self.sender.lock().await;
			futures_util::future::poll_fn(|cx| sender.poll_ready(cx))
				.await
				.map_err(|e| Error::H2(e.to_string()))?;
			sender
				.send_request(head, false)
				.map_err(|e| Error::H2(e.to_string()))?
		};

		let mut body = body;
		loop {
			match body.frame().await {
				Some(Ok(frame)) => {
					if let Some(data) = frame.data_ref() {
						send_stream
							.send_data(data.clone(), false)
							.map_err(|e| Error::H2(e.to_string()))?;
					}
				},
				Some(Err(e)) => return Err(e),
				None => break,
			}
		}
		send_stream
			.send_data(Bytes::new(), true)
			.map_err(|e| Error::H2(e.to_string()))?;

		let response = response_fut.await.map_err(|e| Error::H2(e.to_string()))?;
		let (parts, mut recv_stream) = response.into_parts();

		let mut collected = bytes::BytesMut::new();
		while let Some(chunk) = recv_stream.data().await {
			let chunk = chunk.map_err(|e| Error::H2(e.to_string()))?;
			let _ = recv_stream.flow_control().release_capacity(chunk.len());
			collected.extend_from_slice(&chunk);
		}

		let (eof_tx, _eof_rx) = oneshot::channel();
		let body = IncomingBody::from_bytes(collected.freeze(), eof_tx);
		Ok(Response::from_parts(parts, body))
	}

	pub fn will_exceed_max_streams(&self) -> bool {
		self.stream_count.load(Ordering::SeqCst) + 1 >= self.max_concurrent_streams
	}
}

async fn drive_connection<S>(
	mut conn: h2::client::Connection<S, Bytes>,
	mut close_rx: watch::Receiver<()>,
	ping_timeout: std::time::Duration,
) where
	S: AsyncRead + AsyncWrite + Send + Unpin,
{
	let ping_pong = conn.ping_pong().expect("ping_pong should only be called once");
	let (ping_drop_tx, ping_drop_rx) = oneshot::channel::<()>();
	tokio::spawn(do_ping_pong(ping_pong, ping_drop_tx, ping_timeout).in_current_span());

	tokio::select! {
		_ = close_rx.changed() => {
			debug!("draining h2 connection");
		}
		_ = ping_drop_rx => {
			debug!("h2 ping timeout, dropping connection");
		}
		res = conn => {
			if let Err(e) = res {
				error!(error = %e, "h2 connection ended with error");
			}
		}
	}
}

async fn do_ping_pong(
	mut ping_pong: h2::PingPong,
	drop_tx: oneshot::Sender<()>,
	timeout: std::time::Duration,
) {
	loop {
		let ping = h2::Ping::opaque();
		tokio::time::sleep(timeout).await;
		if tokio::time::timeout(timeout, ping_pong.ping(ping)).await.is_err() {
			let _ = drop_tx.send(());
			return;
		}
	}
}
