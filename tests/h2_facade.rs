//! ALPN promotion to HTTP/2 (spec.md §8 scenario 6): once a connection is
//! recognized as HTTP/2 (see `choose_protocol` in `src/dial/mod.rs` for the
//! ALPN decision itself), it becomes an `H2Connection` façade -- one socket,
//! driven by a single background task, handing out streams to as many
//! callers as ask for one instead of spawning a fresh read/write loop pair
//! per request the way `PersistentConnection` does for HTTP/1.1.
//!
//! Exercised here over a plain TCP loopback pair (no TLS/ALPN involved --
//! the crate's TLS connector has no seam for injecting a test root store),
//! with a minimal `h2::server` handshake standing in for a real h2 origin.

use bytes::Bytes;
use http::{Request, Response};
use http_body_util::{BodyExt, Full};

use transport_core::h2conn::H2Connection;
use transport_core::key::{ConnectionKey, Scheme};
use transport_core::{Http2Options, ReqBody};

fn test_key() -> ConnectionKey {
	ConnectionKey {
		proxy: None,
		scheme: Scheme::Https,
		addr: Some("example.test:443".into()),
		force_h1: false,
	}
}

fn empty_body() -> ReqBody {
	Full::new(Bytes::new())
		.map_err(|never: std::convert::Infallible| match never {})
		.boxed()
}

#[tokio::test]
async fn h2_facade_serves_multiple_requests_over_one_socket() {
	let (client_io, server_io) = tokio::io::duplex(64 * 1024);

	tokio::spawn(async move {
		let mut conn = h2::server::handshake(server_io).await.unwrap();
		let mut served = 0;
		while let Some(result) = conn.accept().await {
			let (request, mut respond) = result.unwrap();
			served += 1;
			let body = format!("reply {served}");
			let response = Response::builder().status(200).body(()).unwrap();
			let mut send = respond.send_response(response, false).unwrap();
			send.send_data(Bytes::from(body), true).unwrap();
			drop(request);
			if served == 2 {
				return;
			}
		}
	});

	let conn = H2Connection::handshake(test_key(), client_io, &Http2Options::default())
		.await
		.unwrap();

	// Two requests served by the same façade, neither spawning its own
	// read/write loop pair -- the defining behavior of an h2 connection
	// versus the HTTP/1.1 `PersistentConnection` engine.
	for expected in ["reply 1", "reply 2"] {
		let request = Request::builder()
			.method("GET")
			.uri("https://example.test/")
			.body(empty_body())
			.unwrap();
		let response = conn.send_request(request).await.unwrap();
		assert_eq!(response.status(), 200);
		let body = response.into_body().collect().await.unwrap().to_bytes();
		assert_eq!(&body[..], expected.as_bytes());
	}

	assert_eq!(conn.stream_count(), 0);
	assert!(!conn.is_broken());
}
