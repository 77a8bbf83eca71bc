//! SOCKS5 and HTTP-CONNECT proxy traversal.
//!
//! SOCKS5 negotiation is delegated to `tokio-socks` (grounded on
//! `other_examples/4774b766_penumbra-x-rquest__src-connect.rs.rs`, which
//! reaches for the same `tokio_socks::tcp::Socks5Stream` rather than
//! hand-rolling the byte protocol). HTTP CONNECT is hand-rolled the same
//! way the HTTP/1.1 engine itself is: a `CONNECT host:port` request line,
//! an optional `Proxy-Authorization: Basic` header derived from the proxy
//! URL's userinfo, and a response read with `httparse` bounded by a
//! one-minute default timeout.

use std::time::Duration;

use base64::Engine;
use http::Uri;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;

use crate::config::TransportOptions;
use crate::error::{Error, Result};

pub async fn socks5_connect(
	raw: TcpStream,
	proxy: &Uri,
	target_addr: &str,
) -> std::result::Result<TcpStream, tokio_socks::Error> {
	let stream = if let Some(auth) = proxy.authority().and_then(|_| proxy_userinfo(proxy)) {
		Socks5Stream::connect_with_password_and_socket(
			raw,
			target_addr,
			&auth.0,
			&auth.1,
		)
		.await?
	} else {
		Socks5Stream::connect_with_socket(raw, target_addr).await?
	};
	Ok(stream.into_inner())
}

fn proxy_userinfo(proxy: &Uri) -> Option<(String, String)> {
	// `http::Uri` does not expose userinfo directly; the authority's raw
	// text carries it as `user:pass@host`.
	let authority = proxy.authority()?.as_str();
	let (cred, _) = authority.split_once('@')?;
	let (user, pass) = cred.split_once(':').unwrap_or((cred, ""));
	Some((user.to_string(), pass.to_string()))
}

/// Bound the `CONNECT` exchange by a one-minute default timeout when the
/// caller supplied none via the request context (the core has no per-call
/// context object, so this timeout is always applied).
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

pub async fn http_connect(
	mut raw: TcpStream,
	proxy: &Uri,
	target_addr: &str,
	opts: &TransportOptions,
) -> Result<TcpStream> {
	tokio::time::timeout(
		DEFAULT_CONNECT_TIMEOUT,
		http_connect_inner(&mut raw, proxy, target_addr, opts),
	)
	.await
	.map_err(|_| Error::ProxyConnectFailed("timed out".into()))??;
	Ok(raw)
}

async fn http_connect_inner(
	stream: &mut TcpStream,
	proxy: &Uri,
	target_addr: &str,
	opts: &TransportOptions,
) -> Result<()> {
	let mut req = format!("CONNECT {target_addr} HTTP/1.1\r\nHost: {target_addr}\r\n");
	if let Some((user, pass)) = proxy_userinfo(proxy) {
		let token = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
		req.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
	}
	if let Some(provider) = &opts.proxy_connect_headers {
		for (name, value) in provider.headers(proxy, target_addr).iter() {
			req.push_str(&format!(
				"{}: {}\r\n",
				name.as_str(),
				value.to_str().unwrap_or("")
			));
		}
	}
	req.push_str("\r\n");
	stream.write_all(req.as_bytes()).await?;
	stream.flush().await?;

	read_connect_response(stream).await
}

async fn read_connect_response<R: AsyncRead + Unpin>(stream: &mut R) -> Result<()> {
	let mut buf = Vec::new();
	let mut byte = [0u8; 1];
	loop {
		let n = stream.read(&mut byte).await?;
		if n == 0 {
			return Err(Error::ProxyConnectFailed("connection closed".into()));
		}
		buf.push(byte[0]);
		if buf.len() >= 4 && &buf[buf.len() - 4..] == b"\r\n\r\n" {
			break;
		}
		if buf.len() > 64 * 1024 {
			return Err(Error::ProxyConnectFailed("response headers too large".into()));
		}
	}
	let mut headers = [httparse::EMPTY_HEADER; 32];
	let mut parsed = httparse::Response::new(&mut headers);
	match parsed.parse(&buf) {
		Ok(httparse::Status::Complete(_)) => {},
		_ => return Err(Error::ProxyConnectFailed("malformed CONNECT response".into())),
	}
	let code = parsed
		.code
		.ok_or_else(|| Error::ProxyConnectFailed("missing status code".into()))?;
	if code != 200 {
		let reason = parsed.reason.unwrap_or("");
		return Err(Error::ProxyConnectFailed(format!("{code} {reason}")));
	}
	Ok(())
}
