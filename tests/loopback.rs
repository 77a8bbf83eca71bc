//! End-to-end scenarios against a real in-process TCP loopback server:
//! basic GET, gzip auto-decode, transparent replay after a server closes a
//! reused connection, replay refused for an unrewindable body, and a proxy
//! CONNECT failure.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http::{Request, Uri};
use http_body_util::{BodyExt, Full};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use transport_core::conn::transfer::{write_chunk, write_final_chunk};
use transport_core::{Error, ProxyResolver, ReqBody, Transport, TransportOptions};

fn empty_body() -> ReqBody {
	Full::new(Bytes::new())
		.map_err(|never: std::convert::Infallible| match never {})
		.boxed()
}

/// Reads one HTTP/1.1 request off `sock` up to and including the blank line
/// terminating the headers, discarding the bytes. Good enough for a test
/// server that doesn't need to inspect what the client sent.
async fn drain_request_headers(sock: &mut tokio::net::TcpStream) {
	let mut buf = Vec::new();
	let mut byte = [0u8; 1];
	loop {
		let n = sock.read(&mut byte).await.unwrap_or(0);
		if n == 0 {
			return;
		}
		buf.push(byte[0]);
		if buf.len() >= 4 && &buf[buf.len() - 4..] == b"\r\n\r\n" {
			return;
		}
	}
}

async fn bind_loopback() -> (TcpListener, String) {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	(listener, addr.to_string())
}

#[tokio::test]
async fn basic_get() {
	let (listener, addr) = bind_loopback().await;
	tokio::spawn(async move {
		let (mut sock, _) = listener.accept().await.unwrap();
		drain_request_headers(&mut sock).await;
		sock
			.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi")
			.await
			.unwrap();
	});

	let transport = Transport::new(TransportOptions::default());
	let uri: http::Uri = format!("http://{addr}/").parse().unwrap();
	let request = Request::builder().uri(uri).body(empty_body()).unwrap();
	let (_, fut) = transport.round_trip(request);
	let response = fut.await.unwrap();
	assert_eq!(response.status(), 200);
	let body = response.into_body().collect().await.unwrap().to_bytes();
	assert_eq!(&body[..], b"hi");
}

#[tokio::test]
async fn gzip_auto_decode() {
	use async_compression::tokio::write::GzipEncoder;

	let mut encoder = GzipEncoder::new(Vec::new());
	encoder.write_all(b"hello").await.unwrap();
	encoder.shutdown().await.unwrap();
	let compressed = encoder.into_inner();

	let (listener, addr) = bind_loopback().await;
	tokio::spawn(async move {
		let (mut sock, _) = listener.accept().await.unwrap();
		drain_request_headers(&mut sock).await;
		sock
			.write_all(b"HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nTransfer-Encoding: chunked\r\n\r\n")
			.await
			.unwrap();
		write_chunk(&mut sock, &compressed).await.unwrap();
		write_final_chunk(&mut sock).await.unwrap();
	});

	let transport = Transport::new(TransportOptions::default());
	let uri: http::Uri = format!("http://{addr}/").parse().unwrap();
	let request = Request::builder().uri(uri).body(empty_body()).unwrap();
	let (_, fut) = transport.round_trip(request);
	let response = fut.await.unwrap();
	assert_eq!(response.status(), 200);
	assert!(!response.headers().contains_key(http::header::CONTENT_ENCODING));
	let body = response.into_body().collect().await.unwrap().to_bytes();
	assert_eq!(&body[..], b"hello");
}

#[tokio::test]
async fn retry_on_server_closed_idle() {
	// Each accepted connection serves exactly one request, then the socket
	// is dropped -- simulating a server that closes an idle keep-alive
	// connection right as the client tries to reuse it for a second request.
	let (listener, addr) = bind_loopback().await;
	let accept_count = Arc::new(AtomicUsize::new(0));
	let counter = accept_count.clone();
	tokio::spawn(async move {
		loop {
			let Ok((mut sock, _)) = listener.accept().await else {
				return;
			};
			counter.fetch_add(1, Ordering::SeqCst);
			tokio::spawn(async move {
				drain_request_headers(&mut sock).await;
				let _ = sock
					.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
					.await;
				// Drop without waiting for a second request: the connection
				// goes idle in the client's pool, then the socket closes.
			});
		}
	});

	let transport = Transport::new(TransportOptions::default());
	let uri: http::Uri = format!("http://{addr}/").parse().unwrap();

	let req1 = Request::builder().uri(uri.clone()).body(empty_body()).unwrap();
	let (_, fut1) = transport.round_trip(req1);
	let resp1 = fut1.await.unwrap();
	assert_eq!(resp1.status(), 200);

	// Give the server task a moment to close the socket after replying.
	tokio::time::sleep(std::time::Duration::from_millis(20)).await;

	let req2 = Request::builder().uri(uri).body(empty_body()).unwrap();
	let (_, fut2) = transport.round_trip(req2);
	let resp2 = fut2.await.unwrap();
	assert_eq!(resp2.status(), 200);
	let body = resp2.into_body().collect().await.unwrap().to_bytes();
	assert_eq!(&body[..], b"ok");

	// One dial for the first request, a second dial for the transparent
	// replay after the reused connection turned out to be closed.
	assert_eq!(accept_count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn post_with_content_length_round_trips() {
	let (listener, addr) = bind_loopback().await;
	tokio::spawn(async move {
		let (mut sock, _) = listener.accept().await.unwrap();
		let mut buf = Vec::new();
		let mut chunk = [0u8; 256];
		loop {
			let n = sock.read(&mut chunk).await.unwrap();
			buf.extend_from_slice(&chunk[..n]);
			if buf.windows(4).any(|w| w == b"\r\n\r\n") && buf.ends_with(b"payload") {
				break;
			}
			if n == 0 {
				break;
			}
		}
		assert!(
			std::str::from_utf8(&buf).unwrap().contains("content-length: 7"),
			"expected content-length framing, got: {}",
			String::from_utf8_lossy(&buf)
		);
		sock
			.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
			.await
			.unwrap();
	});

	let transport = Transport::new(TransportOptions::default());
	let uri: http::Uri = format!("http://{addr}/").parse().unwrap();
	let body = Full::new(Bytes::from_static(b"payload"))
		.map_err(|never: std::convert::Infallible| match never {})
		.boxed();
	let request = Request::builder()
		.method("POST")
		.uri(uri)
		.body(body)
		.unwrap();
	let (_, fut) = transport.round_trip(request);
	let response = fut.await.unwrap();
	assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn missing_host_is_rejected_without_dialing() {
	let transport = Transport::new(TransportOptions::default());
	let uri: http::Uri = "/just/a/path".parse().unwrap();
	let request = Request::builder().uri(uri).body(empty_body()).unwrap();
	let (_, fut) = transport.round_trip(request);
	let err = fut.await.unwrap_err();
	assert!(matches!(err, Error::MissingHost));
}

#[tokio::test]
async fn replay_forbidden_for_unrewindable_body() {
	// Each accepted connection serves one request and closes, same as
	// `retry_on_server_closed_idle` -- the second request below reuses the
	// pooled connection from the first and discovers it dead only once the
	// read side sees EOF.
	let (listener, addr) = bind_loopback().await;
	let accept_count = Arc::new(AtomicUsize::new(0));
	let counter = accept_count.clone();
	tokio::spawn(async move {
		loop {
			let Ok((mut sock, _)) = listener.accept().await else {
				return;
			};
			counter.fetch_add(1, Ordering::SeqCst);
			tokio::spawn(async move {
				drain_request_headers(&mut sock).await;
				let _ = sock
					.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
					.await;
			});
		}
	});

	let transport = Transport::new(TransportOptions::default());
	let uri: http::Uri = format!("http://{addr}/").parse().unwrap();

	let req1 = Request::builder().uri(uri.clone()).body(empty_body()).unwrap();
	let (_, fut1) = transport.round_trip(req1);
	let resp1 = fut1.await.unwrap();
	assert_eq!(resp1.status(), 200);

	tokio::time::sleep(std::time::Duration::from_millis(20)).await;

	// A streaming body: `http_body::Body::is_end_stream` defaults to false
	// and this type never overrides it, so the dispatcher has no cheap way
	// to treat it as trivially replayable. The `idempotency-key` header is
	// what makes the retry a *candidate* at all (a plain POST without one
	// never is); without a `BodyFactory`, the body that was already written
	// once onto the dead connection can't be rebuilt for a second attempt.
	let stream = futures_util::stream::once(async {
		Ok::<_, Error>(http_body::Frame::data(Bytes::from_static(b"chunk")))
	});
	let body: ReqBody = http_body_util::StreamBody::new(stream).boxed();
	let req2 = Request::builder()
		.method("POST")
		.uri(uri)
		.header("idempotency-key", "abc123")
		.body(body)
		.unwrap();
	let (_, fut2) = transport.round_trip(req2);
	let err = fut2.await.unwrap_err();
	assert!(matches!(err, Error::CannotRewindBody));

	// No second dial: the reused connection's write went through before the
	// server's close was noticed, so replay was refused rather than retried
	// on a fresh connection.
	assert_eq!(accept_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn proxy_connect_failure_surfaces_typed_error() {
	struct FixedProxy(Uri);
	impl ProxyResolver for FixedProxy {
		fn resolve(&self, _uri: &Uri) -> Option<Uri> {
			Some(self.0.clone())
		}
	}

	let (listener, addr) = bind_loopback().await;
	tokio::spawn(async move {
		let (mut sock, _) = listener.accept().await.unwrap();
		drain_request_headers(&mut sock).await;
		let _ = sock
			.write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\nContent-Length: 0\r\n\r\n")
			.await;
	});

	let proxy_uri: Uri = format!("http://{addr}/").parse().unwrap();
	let mut opts = TransportOptions::default();
	opts.proxy_resolver = Arc::new(FixedProxy(proxy_uri));
	let transport = Transport::new(opts);

	// The target must be `https` for the dialer to route it through an
	// HTTP(S) proxy via `CONNECT` rather than sending it proxy-absolute-form.
	let uri: http::Uri = "https://example.test/".parse().unwrap();
	let request = Request::builder().uri(uri).body(empty_body()).unwrap();
	let (_, fut) = transport.round_trip(request);
	let err = fut.await.unwrap_err();
	match err {
		Error::ProxyConnectFailed(msg) => {
			assert!(msg.contains("Proxy Authentication Required"), "got: {msg}");
		},
		other => panic!("expected ProxyConnectFailed, got {other:?}"),
	}
}
