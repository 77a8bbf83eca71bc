//! The read loop: parses status lines and headers off the wire, frames
//! response bodies, and decides when a connection goes back to the idle
//! pool.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Response, StatusCode};
use http_body::{Body, Frame, SizeHint};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{trace, warn};

use super::transfer::{read_chunked_body, read_content_length};
use super::{ConnTuning, PendingResponse, PersistentConnection};
use crate::decode;
use crate::error::{Error, Result};

/// A fully-buffered response body (see DESIGN.md for why this crate
/// buffers rather than streams response bodies) that yields its data as a
/// single frame, then signals EOF on the next poll.
pub struct IncomingBody {
	data: Option<Bytes>,
	eof_tx: Option<oneshot::Sender<bool>>,
}

impl IncomingBody {
	fn new(data: Bytes, eof_tx: oneshot::Sender<bool>) -> Self {
		IncomingBody {
			data: Some(data),
			eof_tx: Some(eof_tx),
		}
	}

	fn empty(eof_tx: oneshot::Sender<bool>) -> Self {
		IncomingBody {
			data: Some(Bytes::new()),
			eof_tx: Some(eof_tx),
		}
	}

	/// Build a buffered body from bytes already fully collected elsewhere
	/// (used by the h2 façade, which has no wire-level chunk/length framing
	/// of its own to drive this type from).
	pub(crate) fn from_bytes(data: Bytes, eof_tx: oneshot::Sender<bool>) -> Self {
		IncomingBody::new(data, eof_tx)
	}
}

impl Body for IncomingBody {
	type Data = Bytes;
	type Error = Error;

	fn poll_frame(
		mut self: Pin<&mut Self>,
		_cx: &mut Context<'_>,
	) -> Poll<Option<Result<Frame<Bytes>>>> {
		if let Some(data) = self.data.take() {
			if data.is_empty() {
				if let Some(tx) = self.eof_tx.take() {
					let _ = tx.send(true);
				}
				return Poll::Ready(None);
			}
			return Poll::Ready(Some(Ok(Frame::data(data))));
		}
		if let Some(tx) = self.eof_tx.take() {
			let _ = tx.send(true);
		}
		Poll::Ready(None)
	}

	fn size_hint(&self) -> SizeHint {
		match &self.data {
			Some(d) => SizeHint::with_exact(d.len() as u64),
			None => SizeHint::with_exact(0),
		}
	}
}

impl Drop for IncomingBody {
	fn drop(&mut self) {
		if let Some(tx) = self.eof_tx.take() {
			// Dropped without being fully drained: treat as an early close,
			// same as `EofSignalBody`'s drop guard.
			let _ = tx.send(false);
		}
	}
}

pub(super) async fn read_loop<R>(
	conn: Arc<PersistentConnection>,
	reader: R,
	mut pending_rx: mpsc::Receiver<PendingResponse>,
	mut close_rx: watch::Receiver<()>,
	tuning: ConnTuning,
) where
	R: AsyncRead + Unpin,
{
	let mut reader = reader;
	loop {
		let pending = tokio::select! {
			biased;
			_ = close_rx.changed() => {
				trace!("read loop: connection closing, exiting");
				return;
			}
			p = pending_rx.recv() => match p {
				Some(p) => p,
				None => return,
			},
		};

		// Peek one byte before a request is outstanding to detect a
		// server that closed (or sent an idle `408`) while this
		// connection sat in the pool. Here we already have a pending
		// request queued, so an EOF observed on the very first byte read
		// is surfaced as `ServerClosedIdle` rather than a generic read
		// error, which is what makes it eligible for transparent replay.
		if let Err(fatal) = read_response(&mut reader, tuning, pending).await {
			warn!(error = %fatal, "read loop failed");
			conn.mark_broken(Error::ConnBroken);
			return;
		}
	}
}

/// Drives one request's worth of response parsing and delivers the result
/// to `pending.reply`. Consumes `pending` since the reply can only be sent
/// once. Returns `Err` only for connection-fatal conditions (after having
/// already notified the waiting caller); the read loop exits on `Err`.
async fn read_response<R>(
	reader: &mut R,
	tuning: ConnTuning,
	mut pending: PendingResponse,
) -> Result<()>
where
	R: AsyncRead + Unpin,
{
	// Handle up to five informational 1xx responses per request; 101 is
	// terminal and hands back a writable, caller-owned body. The cap applies
	// only to 1xx reads -- the final, non-1xx response is always read.
	let mut informational_count = 0u32;
	loop {
		let headers_result = match tuning.response_header_timeout {
			Some(timeout) => match tokio::time::timeout(timeout, read_headers(reader, tuning.max_response_header_bytes)).await {
				Ok(result) => result,
				Err(_) => Err(Error::ResponseHeaderTimeout),
			},
			None => read_headers(reader, tuning.max_response_header_bytes).await,
		};
		let (status, headers, _raw_header_bytes) = match headers_result {
			Ok(v) => v,
			Err(e) => {
				let first_byte = matches!(e, Error::MalformedResponse(ref m) if m == "EOF");
				let to_report = if first_byte { Error::ServerClosedIdle } else { e };
				let _ = pending.reply.send(Err(match &to_report {
					Error::ServerClosedIdle => Error::ServerClosedIdle,
					Error::ResponseHeaderTimeout => Error::ResponseHeaderTimeout,
					other => Error::MalformedResponse(other.to_string()),
				}));
				return Err(to_report);
			},
		};

		if status == StatusCode::SWITCHING_PROTOCOLS {
			let (eof_tx, _eof_rx) = oneshot::channel();
			let body = IncomingBody::empty(eof_tx);
			let response = build_response(status, headers, body);
			let _ = pending.reply.send(Ok(response));
			return Ok(());
		}

		if status.is_informational() {
			informational_count += 1;
			if informational_count > 5 {
				let err = Error::TooManyInformationalResponses;
				let _ = pending.reply.send(Err(Error::TooManyInformationalResponses));
				return Err(err);
			}
			if status == StatusCode::CONTINUE {
				if let Some(tx) = pending.continue_signal.take() {
					let _ = tx.send(true);
				}
			}
			continue;
		}

		// A 2xx (or any non-1xx) after a `100` unblocks the writer too, in
		// case the server skipped the `100` and went straight to the final
		// response.
		if let Some(tx) = pending.continue_signal.take() {
			let _ = tx.send(true);
		}

		// Past any 1xx: the transfer loop terminates here.
		let body_result = read_body(reader, &headers, status, pending.auto_accept_encoding).await;
		let (body, uncompressed) = match body_result {
			Ok(v) => v,
			Err(e) => {
				let _ = pending.reply.send(Err(Error::MalformedResponse(e.to_string())));
				return Err(e);
			},
		};
		let mut headers = headers;
		if uncompressed {
			headers.remove(http::header::CONTENT_LENGTH);
			headers.remove(http::header::CONTENT_ENCODING);
		}
		fix_pragma_quirk(&mut headers);
		let (eof_tx, _eof_rx) = oneshot::channel();
		let body = IncomingBody::new(body, eof_tx);
		let response = build_response(status, headers, body);
		let _ = pending.reply.send(Ok(response));
		return Ok(());
	}
}

fn build_response(status: StatusCode, headers: HeaderMap, body: IncomingBody) -> Response<IncomingBody> {
	let mut response = Response::new(body);
	*response.status_mut() = status;
	*response.headers_mut() = headers;
	response
}

/// `Pragma: no-cache` without a matching `Cache-Control` is folded into an
/// equivalent `Cache-Control: no-cache` (a long-standing HTTP/1.0
/// interoperability quirk).
fn fix_pragma_quirk(headers: &mut HeaderMap) {
	let has_pragma_no_cache = headers
		.get(http::header::PRAGMA)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.eq_ignore_ascii_case("no-cache"))
		.unwrap_or(false);
	if has_pragma_no_cache && !headers.contains_key(http::header::CACHE_CONTROL) {
		headers.insert(
			http::header::CACHE_CONTROL,
			HeaderValue::from_static("no-cache"),
		);
	}
}

/// Read and parse one status line + header block, bounded by
/// `max_header_bytes`. Returns the parsed status, headers, and the raw byte
/// count consumed.
async fn read_headers<R>(
	reader: &mut R,
	max_header_bytes: usize,
) -> Result<(StatusCode, HeaderMap, usize)>
where
	R: AsyncRead + Unpin,
{
	let mut buf = BytesMut::with_capacity(512);
	let mut one = [0u8; 1];
	loop {
		let n = reader.read(&mut one).await.map_err(Error::read_from_server)?;
		if n == 0 {
			if buf.is_empty() {
				return Err(Error::MalformedResponse("EOF".to_string()));
			}
			return Err(Error::read_from_server(std::io::Error::new(
				std::io::ErrorKind::UnexpectedEof,
				"eof mid-headers",
			)));
		}
		buf.extend_from_slice(&one);
		if buf.len() > max_header_bytes {
			return Err(Error::HeaderListTooLong {
				limit: max_header_bytes,
			});
		}
		if buf.len() >= 4 && &buf[buf.len() - 4..] == b"\r\n\r\n" {
			break;
		}
	}

	let mut header_storage = [httparse::EMPTY_HEADER; 64];
	let mut parsed = httparse::Response::new(&mut header_storage);
	match parsed.parse(&buf) {
		Ok(httparse::Status::Complete(_)) => {},
		Ok(httparse::Status::Partial) => {
			return Err(Error::MalformedResponse("incomplete status line".into()));
		},
		Err(e) => return Err(Error::MalformedResponse(format!("{e}"))),
	}

	let code = parsed
		.code
		.ok_or_else(|| Error::MalformedResponse("missing status code".into()))?;
	let status =
		StatusCode::from_u16(code).map_err(|_| Error::MalformedResponse("bad status code".into()))?;

	let mut headers = HeaderMap::new();
	for h in parsed.headers.iter() {
		if h.name.is_empty() {
			continue;
		}
		let name = HeaderName::from_bytes(h.name.as_bytes())
			.map_err(|_| Error::MalformedResponse(format!("bad header name {:?}", h.name)))?;
		let value = HeaderValue::from_bytes(h.value)
			.map_err(|_| Error::MalformedResponse(format!("bad header value for {}", h.name)))?;
		headers.append(name, value);
	}

	Ok((status, headers, buf.len()))
}

/// Apply transfer framing to read the response body, then (H) gzip
/// auto-decode it if the transport added `Accept-Encoding: gzip` and the
/// response says `Content-Encoding: gzip`. `auto_accept_encoding` is `false`
/// whenever the caller supplied its own `Accept-Encoding` (it wants to
/// decode the body itself), so decoding is skipped even for a gzip
/// response in that case. Returns the decoded bytes and whether
/// decompression happened (`Uncompressed`).
async fn read_body<R>(
	reader: &mut R,
	headers: &HeaderMap,
	status: StatusCode,
	auto_accept_encoding: bool,
) -> Result<(Bytes, bool)>
where
	R: AsyncRead + Unpin,
{
	if status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
		return Ok((Bytes::new(), false));
	}

	let is_chunked = headers
		.get(http::header::TRANSFER_ENCODING)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.to_ascii_lowercase().contains("chunked"))
		.unwrap_or(false);
	let content_length = headers
		.get(http::header::CONTENT_LENGTH)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.parse::<u64>().ok());

	let raw = if is_chunked {
		read_chunked_body(reader).await?
	} else if let Some(len) = content_length {
		read_content_length(reader, len).await?
	} else {
		Bytes::new()
	};

	if !auto_accept_encoding {
		return Ok((raw, false));
	}
	let is_gzip = headers
		.get(http::header::CONTENT_ENCODING)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.eq_ignore_ascii_case("gzip"))
		.unwrap_or(false);
	if is_gzip {
		let decoded = decode::gunzip(raw).await?;
		Ok((decoded, true))
	} else {
		Ok((raw, false))
	}
}
