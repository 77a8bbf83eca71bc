//! Protocol dispatcher / round-tripper (component F): the public
//! `Transport` type and its `round_trip` operation -- validation, Alt-Svc
//! consultation, connection acquisition, the replay predicate, and response
//! decoration (component H) applied to the result.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::{Method, Request, Response, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::altsvc::AltSvcCache;
use crate::body::{BodyFactory, TeeBody, TrackedBody};
use crate::conn::{ConnTuning, PersistentConnection, ReqBody};
use crate::decode;
use crate::dial;
use crate::error::{Error, Result};
use crate::h2conn::H2Connection;
use crate::key::ConnectionKey;
use crate::pool::{Pool, PooledConn};
use crate::waiter::{Delivery, WaitingDialer};
use crate::admission::Admission;
use crate::config::TransportOptions;

/// A response body with every concrete body type this crate produces
/// (buffered wire bodies, transcoded bodies, tee-wrapped bodies) erased
/// behind one boxed type, mirroring `ReqBody`'s treatment of request
/// bodies.
pub type RespBody = BoxBody<Bytes, Error>;

const IDEMPOTENT_METHODS: [Method; 4] = [Method::GET, Method::HEAD, Method::OPTIONS, Method::TRACE];

/// Cooperative cancellation handle for one in-flight `round_trip` call: an
/// explicit, caller-owned token, since the core has no ambient
/// context/request-scoped object to attach cancellation to otherwise.
#[derive(Clone, Default)]
pub struct RequestContext {
	cancelled: Arc<AtomicBool>,
	notify: Arc<Notify>,
}

impl RequestContext {
	pub fn new() -> Self {
		Self::default()
	}

	/// Mark this request cancelled and wake anything suspended waiting on it.
	pub fn cancel(&self) {
		self.cancelled.store(true, Ordering::SeqCst);
		self.notify.notify_waiters();
	}

	pub fn is_cancelled(&self) -> bool {
		self.cancelled.load(Ordering::SeqCst)
	}

	async fn cancelled(&self) {
		if self.is_cancelled() {
			return;
		}
		self.notify.notified().await;
	}
}

/// The transport core. Constructed once, shared (via `Arc`) across every
/// concurrent caller.
pub struct Transport {
	opts: Arc<TransportOptions>,
	pool: Arc<Pool>,
	admission: Arc<Admission>,
	altsvc: Arc<AltSvcCache>,
	next_request_id: AtomicU64,
	in_flight: Mutex<std::collections::HashMap<u64, RequestContext>>,
}

impl Transport {
	pub fn new(opts: TransportOptions) -> Arc<Self> {
		let opts = Arc::new(opts);
		let pool = Arc::new(Pool::new(
			opts.max_idle_conns,
			opts.max_idle_conns_per_host,
			opts.idle_conn_timeout,
			opts.disable_keep_alives,
			opts.h2.strict_max_concurrent_streams,
		));
		let admission = Arc::new(Admission::new(opts.max_conns_per_host));
		let altsvc = Arc::new(AltSvcCache::new(None));
		Arc::new(Transport {
			opts,
			pool,
			admission,
			altsvc,
			next_request_id: AtomicU64::new(0),
			in_flight: Mutex::new(std::collections::HashMap::new()),
		})
	}

	pub fn options(&self) -> &TransportOptions {
		&self.opts
	}

	fn conn_tuning(&self) -> ConnTuning {
		ConnTuning {
			max_response_header_bytes: self.opts.max_response_header_bytes,
			expect_continue_timeout: self.opts.expect_continue_timeout,
			disable_compression: self.opts.disable_compression,
			response_header_timeout: self.opts.response_header_timeout,
			read_buffer_size: self.opts.read_buffer_size,
			write_buffer_size: self.opts.write_buffer_size,
		}
	}

	/// Register a fresh cancellation context for a call about to start, and
	/// a matching id `cancel_request` can use to find it.
	fn register_context(&self) -> (u64, RequestContext) {
		let id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
		let ctx = RequestContext::new();
		self.in_flight.lock().unwrap().insert(id, ctx.clone());
		(id, ctx)
	}

	fn unregister_context(&self, id: u64) {
		self.in_flight.lock().unwrap().remove(&id);
	}

	/// Mark the in-flight request identified by `id` cancelled. A no-op if
	/// it already finished.
	pub fn cancel_request(&self, id: u64) {
		if let Some(ctx) = self.in_flight.lock().unwrap().get(&id) {
			ctx.cancel();
		}
	}

	/// `Transport::close_idle_connections`: close every idle connection and
	/// mark the pool closed to new idle insertions.
	pub fn close_idle_connections(&self) {
		self.pool.close_all_idle();
	}

	pub fn idle_count(&self) -> usize {
		self.pool.idle_count()
	}

	/// The public round-trip operation. Returns the generated request id
	/// alongside the in-flight future so the caller can retain the id for
	/// `cancel_request` before the call resolves.
	pub fn round_trip(
		self: &Arc<Self>,
		request: Request<ReqBody>,
	) -> (u64, impl std::future::Future<Output = Result<Response<RespBody>>> + 'static) {
		let (id, ctx) = self.register_context();
		let transport = self.clone();
		let fut = async move {
			let result = transport.round_trip_inner(request, &ctx, None).await;
			transport.unregister_context(id);
			result
		};
		(id, fut)
	}

	/// Variant accepting a `BodyFactory` so a streaming request body can be
	/// regenerated for replay after a reused connection turns out dead.
	pub fn round_trip_with_factory(
		self: &Arc<Self>,
		request: Request<ReqBody>,
		factory: Arc<dyn BodyFactory>,
	) -> (u64, impl std::future::Future<Output = Result<Response<RespBody>>> + 'static) {
		let (id, ctx) = self.register_context();
		let transport = self.clone();
		let fut = async move {
			let result = transport.round_trip_inner(request, &ctx, Some(factory)).await;
			transport.unregister_context(id);
			result
		};
		(id, fut)
	}

	async fn round_trip_inner(
		self: &Arc<Self>,
		request: Request<ReqBody>,
		ctx: &RequestContext,
		factory: Option<Arc<dyn BodyFactory>>,
	) -> Result<Response<RespBody>> {
		validate_request(&request)?;

		let force_h1 = wants_http1_only(&request);
		let uri = request.uri().clone();
		let authority = uri
			.authority()
			.map(|a| a.to_string())
			.ok_or(Error::MissingHost)?;

		// Consult the Alt-Svc cache. The core tracks and probes h3
		// advertisements but ships no bundled HTTP/3 client of its own;
		// without a caller-supplied prober (`AltSvcCache::new`'s hook)
		// nothing is ever promoted, so this is a no-op fast-path check
		// rather than a dead branch.
		if self.altsvc.chosen(&authority).is_some() {
			trace!(authority, "alt-svc alternative cached but no h3 transport wired in");
		}

		let proxy_uri = self.opts.resolve_proxy(&uri);
		let key = ConnectionKey::derive(&uri, proxy_uri.as_ref(), force_h1)?;

		let is_idempotent = request.method() == Method::CONNECT
			|| IDEMPOTENT_METHODS.contains(request.method());
		let has_idempotency_header = request.headers().contains_key("idempotency-key")
			|| request.headers().contains_key("x-idempotency-key");
		let body_is_end_stream = request.body().is_end_stream();
		let replayable = is_idempotent || has_idempotency_header || factory.is_some() || body_is_end_stream;
		// Whether a fresh, unread body can actually be produced for a second
		// attempt: an empty body can always be rebuilt trivially, and a
		// caller-supplied factory can always rebuild a streaming one. Absent
		// either, the body that was just moved into the failed attempt is
		// gone for good and a second attempt is not made.
		let can_reconstruct_body = body_is_end_stream || factory.is_some();

		let (parts, body) = request.into_parts();
		let (tracked, mut handle) = TrackedBody::new(body);

		let mut attempt = 0usize;
		let mut body = Some(ReqBody::new(tracked));
		loop {
			attempt += 1;
			if ctx.is_cancelled() {
				return Err(Error::RequestCanceled);
			}

			let attempt_request = Request::from_parts(parts.clone(), body.take().expect("body set before every attempt"));

			let acquired = self.acquire_connection(&key, &uri).await;
			let conn = match acquired {
				Ok(c) => c,
				Err(e) => return Err(e),
			};
			let reused = match &conn {
				PooledConn::Http1(c) => c.is_reused(),
				PooledConn::Http2(_) => true,
			};

			let result = tokio::select! {
				biased;
				_ = ctx.cancelled() => Err(Error::RequestCanceled),
				r = self.round_trip_on(&conn, attempt_request) => r,
			};

			match result {
				Ok(response) => {
					self.altsvc.observe(&authority, response.headers());
					self.release_connection(&key, conn);
					return self.decorate_response(response).await;
				},
				Err(e) => {
					self.release_connection_after_error(&key, conn);
					let should_replay =
						reused && replayable && attempt == 1 && e.is_replayable_cause();
					if !should_replay {
						warn!(error = %e, attempt, "round trip failed, not replaying");
						return Err(e);
					}
					if !can_reconstruct_body {
						if !handle.needs_rewind() {
							// The body was never read or closed during the failed
							// attempt, so no rewind is actually required -- but
							// without a factory or an end-stream body there is
							// nothing left to resend it with. Surface the original
							// failure rather than a misleading rewind error.
							warn!(error = %e, attempt, "replay candidate but no body factory available");
							return Err(e);
						}
						debug!(error = %e, "replay candidate but body cannot be rewound");
						return Err(Error::CannotRewindBody);
					}
					debug!(error = %e, "replaying request on a fresh connection");
					let fresh = match &factory {
						Some(f) => f.make(),
						None => ReqBody::new(
							http_body_util::Empty::new().map_err(|never: std::convert::Infallible| match never {}),
						),
					};
					let (tracked, fresh_handle) = TrackedBody::new(fresh);
					handle = fresh_handle;
					body = Some(ReqBody::new(tracked));
				},
			}
		}
	}

	async fn acquire_connection(self: &Arc<Self>, key: &ConnectionKey, uri: &Uri) -> Result<PooledConn> {
		// First try a cached-only HTTP/2 round trip: an idle h2 connection is
		// never removed from the pool on checkout (it is multiplexed across
		// many callers), so a plain lookup is enough -- no dial, no waiter.
		if let Some(conn) = self.pool.get_h2(key) {
			return Ok(PooledConn::Http2(conn));
		}

		let (waiter, rx) = WaitingDialer::<PooledConn>::new();
		if self.pool.queue_or_get(key, waiter.clone()) {
			return match rx.await {
				Ok(Delivery::Conn(c)) => Ok(c),
				Ok(Delivery::Err(e)) => Err(e),
				Err(_) => Err(Error::ConnBroken),
			};
		}
		// No idle connection was available. Rather than leave the waiter
		// registered for some unrelated future dial to satisfy it, cancel it
		// and dial ourselves -- keeping late-binding scoped to "a connection
		// already idle when the request arrives", which the `try_put`/
		// `queue_or_get` path above still honours.
		waiter.cancel();

		let target_addr = crate::key::target_addr(uri)?;
		let permit = self.admission.acquire(key).await;
		let dialled = dial::dial(key, &target_addr, &self.opts).await;
		drop(permit);
		match dialled? {
			dial::Dialled::Http1(socket) => {
				let conn = PersistentConnection::spawn(key.clone(), socket, self.conn_tuning());
				Ok(PooledConn::Http1(conn))
			},
			dial::Dialled::Http2(socket) => {
				let conn = H2Connection::handshake(key.clone(), socket, &self.opts.h2).await?;
				Ok(PooledConn::Http2(conn))
			},
		}
	}

	/// Run one request against an already-acquired connection.
	async fn round_trip_on(
		&self,
		conn: &PooledConn,
		request: Request<ReqBody>,
	) -> Result<Response<crate::conn::read::IncomingBody>> {
		match conn {
			PooledConn::Http1(c) => {
				c.round_trip(request, http::HeaderMap::new(), self.opts.disable_compression)
					.await
			},
			PooledConn::Http2(c) => c.send_request(request).await,
		}
	}

	/// The body is fully buffered by the time `round_trip_on` returns (see
	/// DESIGN.md), so there is no streaming tail left for the caller to
	/// drive -- the connection can go back to the pool immediately instead
	/// of waiting on a body-EOF signal from the caller.
	fn release_connection(&self, key: &ConnectionKey, conn: PooledConn) {
		let _ = key;
		if let Err(e) = self.pool.try_put(conn) {
			trace!(error = %e, "connection not returned to idle pool");
		}
	}

	fn release_connection_after_error(&self, key: &ConnectionKey, conn: PooledConn) {
		match &conn {
			PooledConn::Http1(c) if c.is_broken() => {
				self.pool.remove_idle_http1(key, c);
			},
			_ => {
				let _ = self.pool.try_put(conn);
			},
		}
	}

	async fn decorate_response(&self, response: Response<crate::conn::read::IncomingBody>) -> Result<Response<RespBody>> {
		let (parts, body) = response.into_parts();
		let collected = body.collect().await?.to_bytes();

		let decoded = if self.opts.disable_auto_decode {
			collected
		} else {
			match decode::encoding_for(&parts.headers, &collected) {
				Some(enc) => decode::transcode(&collected, enc),
				None => collected,
			}
		};

		let boxed: RespBody = http_body_util::Full::new(decoded)
			.map_err(|never: std::convert::Infallible| match never {})
			.boxed();
		let boxed = if self.opts.response_tee_sinks.is_empty() {
			boxed
		} else {
			TeeBody::new(boxed, self.opts.response_tee_sinks.clone()).boxed()
		};

		Ok(Response::from_parts(parts, boxed))
	}
}

/// `Connection: Upgrade`/`Upgrade: websocket` (or an explicit force) pins a
/// request to HTTP/1.1 even if the authority has since negotiated HTTP/2.
fn wants_http1_only<B>(request: &Request<B>) -> bool {
	let headers = request.headers();
	let is_upgrade = headers
		.get(http::header::CONNECTION)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.eq_ignore_ascii_case("upgrade"))
		.unwrap_or(false);
	is_upgrade || headers.contains_key(http::header::UPGRADE)
}

fn validate_request<B>(request: &Request<B>) -> Result<()> {
	if request.uri().host().is_none() {
		return Err(Error::MissingHost);
	}
	for (name, value) in request.headers().iter() {
		if value.to_str().is_err() {
			return Err(Error::InvalidHeader {
				field: name.to_string(),
				reason: "non-ASCII header value".to_string(),
			});
		}
	}
	Ok(())
}

