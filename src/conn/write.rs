//! The write loop: serializes one request at a time onto the wire.

use std::sync::Arc;
use std::time::Duration;

use http::{HeaderMap, Method};
use http_body::Body as _;
use http_body_util::BodyExt as _;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use super::transfer::{choose_request_framing, write_chunk, write_final_chunk, Framing};
use super::{ConnTuning, PersistentConnection, WriteRequest};
use crate::error::{Error, Result};

/// Header names the default header-write order re-derives explicitly, and
/// so must not be echoed a second time from the caller's header map.
fn is_excluded(name: &http::HeaderName) -> bool {
	matches!(
		name.as_str(),
		"host" | "user-agent" | "content-length" | "transfer-encoding" | "trailer"
	) || name.as_str().starts_with("x-transport-order-")
}

/// The header-order directive marker: when present, its value is a
/// comma-separated, case-insensitive list of header names giving the wire
/// order the rest of the caller's headers should be flushed in (spec.md
/// §4.C's "Ordered" mode). Headers present on the request but not named in
/// the list are flushed afterwards, in their original relative order.
const HEADER_ORDER_DIRECTIVE: &str = "x-transport-order-list";

fn header_order_directive(headers: &HeaderMap) -> Option<Vec<String>> {
	let value = headers.get(HEADER_ORDER_DIRECTIVE)?.to_str().ok()?;
	Some(
		value
			.split(',')
			.map(|s| s.trim().to_ascii_lowercase())
			.filter(|s| !s.is_empty())
			.collect(),
	)
}

/// Buffer the caller's non-excluded headers, then flush them sorted by
/// position in `order` (headers not named in `order` keep their original
/// relative order, appended after every named one) -- the "buffer ...
/// then sort ... then flush" mode spec.md §4.C describes, as opposed to
/// the default mode's direct, unbuffered write.
fn write_ordered_headers(out: &mut String, headers: &HeaderMap, order: &[String]) {
	let mut buffered: Vec<(&http::HeaderName, &http::HeaderValue)> = headers
		.iter()
		.filter(|(name, _)| !is_excluded(name))
		.collect();
	buffered.sort_by_key(|(name, _)| {
		order
			.iter()
			.position(|wanted| wanted == name.as_str())
			.unwrap_or(order.len())
	});
	for (name, value) in buffered {
		out.push_str(name.as_str());
		out.push_str(": ");
		out.push_str(value.to_str().unwrap_or(""));
		out.push_str("\r\n");
	}
}

pub(super) async fn write_loop<W>(
	conn: Arc<PersistentConnection>,
	mut writer: W,
	mut rx: mpsc::Receiver<WriteRequest>,
	mut close_rx: watch::Receiver<()>,
	tuning: ConnTuning,
) where
	W: AsyncWrite + Unpin,
{
	loop {
		let wr = tokio::select! {
			biased;
			_ = close_rx.changed() => {
				trace!("write loop: connection closing, exiting");
				return;
			}
			wr = rx.recv() => match wr {
				Some(wr) => wr,
				None => return,
			},
		};

		let before = conn.bytes_written();
		let result = write_one(
			&conn,
			&mut writer,
			wr.request,
			&wr.extra_headers,
			wr.continue_wait,
			tuning,
		)
		.await;
		let wrote_nothing = conn.bytes_written() == before;

		let outcome = match result {
			Ok(()) => Ok(()),
			Err(e) => {
				warn!(error = %e, "write loop failed");
				conn.mark_broken(Error::ConnBroken);
				if wrote_nothing {
					Err(e.nothing_written())
				} else {
					Err(e)
				}
			},
		};

		if wr.reply.send(outcome).is_err() {
			debug!("write loop: reply receiver dropped");
		}
	}
}

async fn write_one<W>(
	conn: &Arc<PersistentConnection>,
	writer: &mut W,
	request: http::Request<super::ReqBody>,
	extra_headers: &HeaderMap,
	continue_wait: Option<tokio::sync::oneshot::Receiver<bool>>,
	tuning: ConnTuning,
) -> Result<()>
where
	W: AsyncWrite + Unpin,
{
	let (parts, body) = request.into_parts();

	// Request line. CONNECT emits bare `host:port`; everything else an
	// absolute-path (proxy-absolute-URI requests are rewritten upstream by
	// the dispatcher before this point).
	let target = if parts.method == Method::CONNECT {
		parts
			.uri
			.authority()
			.map(|a| a.to_string())
			.unwrap_or_else(|| parts.uri.to_string())
	} else if parts.uri.authority().is_some() {
		// Proxy-absolute-form: the dispatcher leaves the full `scheme://host/path`
		// URI on the request when this connection goes to an HTTP proxy for a
		// plain-HTTP target.
		parts.uri.to_string()
	} else {
		let mut t = parts.uri.path().to_string();
		if t.is_empty() {
			t = "/".to_string();
		}
		if let Some(q) = parts.uri.query() {
			t.push('?');
			t.push_str(q);
		}
		t
	};
	let mut out = format!("{} {} HTTP/1.1\r\n", parts.method, target);

	// Host header: explicit `Host` field wins, else the URL host
	// (lower-cased, IPv6 zone stripped by `ConnectionKey::derive` already).
	let host_header = parts
		.headers
		.get(http::header::HOST)
		.and_then(|v| v.to_str().ok())
		.map(|s| s.to_string())
		.or_else(|| parts.uri.host().map(|h| h.to_lowercase()));
	if let Some(host) = host_header {
		out.push_str(&format!("host: {}\r\n", host));
	}

	// User-Agent: default unless the caller set it explicitly; setting it
	// to the empty string suppresses the header entirely.
	match parts.headers.get(http::header::USER_AGENT) {
		None => out.push_str(&format!("user-agent: transport-core/{}\r\n", env!("CARGO_PKG_VERSION"))),
		Some(v) if v.as_bytes().is_empty() => {},
		Some(v) => out.push_str(&format!("user-agent: {}\r\n", v.to_str().unwrap_or(""))),
	}

	let known_len = body.size_hint().exact();
	let framing = choose_request_framing(&parts.method, known_len);
	match framing {
		Framing::ContentLength(n) => out.push_str(&format!("content-length: {}\r\n", n)),
		Framing::Chunked => out.push_str("transfer-encoding: chunked\r\n"),
		Framing::None | Framing::UntilClose => {},
	}

	if super::wants_auto_accept_encoding(&parts.headers, tuning.disable_compression) {
		out.push_str("accept-encoding: gzip\r\n");
	}

	match header_order_directive(&parts.headers) {
		Some(order) => write_ordered_headers(&mut out, &parts.headers, &order),
		None => {
			for (name, value) in parts.headers.iter() {
				if is_excluded(name) {
					continue;
				}
				out.push_str(name.as_str());
				out.push_str(": ");
				out.push_str(value.to_str().unwrap_or(""));
				out.push_str("\r\n");
			}
		},
	}
	for (name, value) in extra_headers.iter() {
		out.push_str(name.as_str());
		out.push_str(": ");
		out.push_str(value.to_str().unwrap_or(""));
		out.push_str("\r\n");
	}
	out.push_str("\r\n");

	writer.write_all(out.as_bytes()).await?;
	conn.add_bytes_written(out.len() as u64);
	writer.flush().await?;

	// `Expect: 100-continue`: headers are already flushed above. If the
	// request carried the header, wait for the read loop to say whether to
	// proceed -- `true` on a `100` response, `false` on an error or early
	// close -- before sending the body at all. The continue timer elapsing
	// is treated the same as an explicit `true`: per spec.md §4.C, a server
	// that simply never answers before the timeout is assumed willing to
	// receive the body, not refusing it.
	if let Some(wait) = continue_wait {
		match tokio::time::timeout(tuning.expect_continue_timeout, wait).await {
			Ok(Ok(true)) | Err(_) => {},
			Ok(Ok(false)) | Ok(Err(_)) => {
				// Abort: the server answered (or the wait otherwise resolved)
				// without us ever sending the announced body. The request's
				// response (e.g. a `417`) still arrives normally through the
				// read loop, but the connection's framing state is now out of
				// sync for any future request -- it must never be reused.
				drop(body);
				conn.mark_broken(Error::ConnBroken);
				return Ok(());
			},
		}
	}

	write_body(conn, writer, body, framing).await
}

async fn write_body<W>(
	conn: &Arc<PersistentConnection>,
	writer: &mut W,
	mut body: super::ReqBody,
	framing: Framing,
) -> Result<()>
where
	W: AsyncWrite + Unpin,
{
	futures_util::pin_mut!(body);
	loop {
		let Some(frame) = body.as_mut().frame().await else {
			break;
		};
		let frame = frame?;
		let Some(data) = frame.data_ref() else {
			continue;
		};
		match framing {
			Framing::Chunked => write_chunk(writer, data).await?,
			_ => {
				writer.write_all(data).await?;
				conn.add_bytes_written(data.len() as u64);
			},
		}
	}
	if framing == Framing::Chunked {
		write_final_chunk(writer).await?;
	}
	writer.flush().await?;
	Ok(())
}

/// Default Expect: 100-continue timeout used when the dispatcher does not
/// override it.
pub const DEFAULT_EXPECT_CONTINUE_TIMEOUT: Duration = Duration::from_secs(1);

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn no_directive_is_none() {
		let mut headers = HeaderMap::new();
		headers.insert("accept", "text/plain".parse().unwrap());
		assert!(header_order_directive(&headers).is_none());
	}

	#[test]
	fn directive_parses_lowercased_list() {
		let mut headers = HeaderMap::new();
		headers.insert(HEADER_ORDER_DIRECTIVE, "Accept, X-Custom,user-agent".parse().unwrap());
		let order = header_order_directive(&headers).unwrap();
		assert_eq!(order, vec!["accept", "x-custom", "user-agent"]);
	}

	#[test]
	fn ordered_write_follows_directive_then_appends_rest() {
		let mut headers = HeaderMap::new();
		headers.insert("x-custom", "c".parse().unwrap());
		headers.insert("accept", "a".parse().unwrap());
		headers.insert("x-unlisted", "u".parse().unwrap());
		let order = vec!["accept".to_string(), "x-custom".to_string()];

		let mut out = String::new();
		write_ordered_headers(&mut out, &headers, &order);
		let lines: Vec<&str> = out.lines().collect();
		assert_eq!(lines, vec!["accept: a", "x-custom: c", "x-unlisted: u"]);
	}

	#[test]
	fn ordered_write_excludes_reserved_headers() {
		let mut headers = HeaderMap::new();
		headers.insert("host", "example.test".parse().unwrap());
		headers.insert("accept", "a".parse().unwrap());
		let order = vec!["host".to_string(), "accept".to_string()];

		let mut out = String::new();
		write_ordered_headers(&mut out, &headers, &order);
		assert_eq!(out, "accept: a\r\n");
	}
}
