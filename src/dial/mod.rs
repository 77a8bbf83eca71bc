//! Connection establishment pipeline (component B): dial -> optional
//! SOCKS5/HTTP-CONNECT proxy traversal -> optional TLS handshake ->
//! ALPN-based protocol promotion to HTTP/2.

pub mod proxy;
pub mod tls;

use std::sync::Arc;
use std::time::Duration;

use http::Uri;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::config::TransportOptions;
use crate::error::{Error, Result};
use crate::key::ConnectionKey;
use crate::socket::{Alpn, Socket};

/// Outcome of dialling a key: either a plain/TLS socket ready for the
/// HTTP/1.1 engine, or a socket that already negotiated HTTP/2 over ALPN
/// and should be handed to the h2 façade instead.
pub enum Dialled {
	Http1(Socket),
	Http2(Socket),
}

/// Default TCP dialler: `tokio::net::TcpStream::connect`, matching
/// `crates/agentgateway/src/transport/stream.rs::Socket::dial`'s default.
pub async fn default_dial(addr: &str) -> Result<TcpStream> {
	trace!(addr, "dialing tcp");
	TcpStream::connect(addr)
		.await
		.map_err(|e| Error::Dial(format!("{addr}: {e}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Protocol {
	Http1,
	Http2,
}

/// Decide which protocol a dialled, TLS-terminated socket should be treated
/// as, given the ALPN token it negotiated (if any). `force_h1` always wins
/// over a negotiated `h2` -- the mandated downgrade for `Connection:
/// Upgrade` requests (e.g. websockets) against an h2-capable origin
/// (spec.md §4.B step 5) -- and `force_protocol == Http2` with no way to
/// reach h2 is a hard error rather than a silent HTTP/1.1 fallback.
fn choose_protocol(
	alpn: Option<Alpn>,
	force_h1: bool,
	force_protocol: crate::config::ForceProtocol,
) -> Result<Protocol> {
	match alpn {
		Some(Alpn::H2) if force_h1 => Ok(Protocol::Http1),
		Some(Alpn::H2) => Ok(Protocol::Http2),
		_ => {
			if matches!(force_protocol, crate::config::ForceProtocol::Http2) {
				return Err(Error::Http2NotSupported);
			}
			Ok(Protocol::Http1)
		},
	}
}

/// Run the full pipeline for `key`: dial -> proxy traversal -> TLS ->
/// ALPN promotion.
///
/// `target_addr` is the real `host:port` to reach for this request,
/// computed independently of `key.addr` -- which `ConnectionKey::derive`
/// deliberately clears to `None` for an HTTP-proxy-to-HTTP-target key (such
/// connections are pooled and reused across different targets behind that
/// proxy), so that variant can still be dialed here even though it carries
/// no target address of its own.
pub async fn dial(key: &ConnectionKey, target_addr: &str, opts: &Arc<TransportOptions>) -> Result<Dialled> {
	let proxy_uri: Option<Uri> = key.proxy.as_deref().and_then(|p| p.parse().ok());

	// A caller-supplied `dial_tls` hook takes over the whole dial-plus-TLS
	// step for a direct `https` connection (§6: "dial_tls(ctx, network,
	// addr) -> conn"); it is not consulted for proxied connections, which
	// still need the CONNECT/SOCKS5 traversal to run first.
	if proxy_uri.is_none() && key.scheme == crate::key::Scheme::Https {
		if let Some(hook) = &opts.dial_tls {
			trace!(addr = %target_addr, "dialing via caller-supplied dial_tls hook");
			let io = hook.dial_tls(&target_addr).await?;
			let socket = Socket::Custom(io);
			return match choose_protocol(socket.negotiated_alpn(), key.force_h1, opts.force_protocol)? {
				Protocol::Http1 => Ok(Dialled::Http1(socket)),
				Protocol::Http2 => Ok(Dialled::Http2(socket)),
			};
		}
	}

	let socket = if let Some(proxy) = &proxy_uri {
		match proxy.scheme_str() {
			Some("socks5") | Some("socks5h") => {
				let raw = default_dial(proxy.authority().map(|a| a.as_str()).unwrap_or_default()).await?;
				proxy::socks5_connect(raw, proxy, &target_addr)
					.await
					.map(Socket::Plain)
					.map_err(|e| Error::ProxyConnectFailed(e.to_string()))?
			},
			Some("http") | Some("https") if key.scheme == crate::key::Scheme::Https => {
				let raw = default_dial(proxy.authority().map(|a| a.as_str()).unwrap_or_default()).await?;
				let tunnelled = proxy::http_connect(raw, proxy, &target_addr, opts)
					.await
					.map_err(|e| Error::ProxyConnectFailed(e.to_string()))?;
				Socket::Plain(tunnelled)
			},
			_ => {
				// Plain-HTTP-over-HTTP-proxy: no CONNECT tunnel, the request
				// is sent proxy-absolute-form directly to the proxy socket.
				let raw = default_dial(proxy.authority().map(|a| a.as_str()).unwrap_or_default()).await?;
				Socket::Plain(raw)
			},
		}
	} else if let Some(hook) = &opts.dial {
		trace!(addr = %target_addr, "dialing via caller-supplied dial hook");
		Socket::Custom(hook.dial(&target_addr).await?)
	} else {
		Socket::Plain(default_dial(&target_addr).await?)
	};

	if key.scheme != crate::key::Scheme::Https {
		// Cleartext HTTP/2 has no ALPN to promote on, so `enable_h2c` is
		// taken as prior knowledge that the target speaks h2c directly --
		// skipped entirely when `force_h1` pins the request to HTTP/1.1.
		if opts.enable_h2c && !key.force_h1 {
			return Ok(Dialled::Http2(socket));
		}
		return Ok(Dialled::Http1(socket));
	}

	let host = target_addr
		.rsplit_once(':')
		.map(|(h, _)| h)
		.unwrap_or(&target_addr);
	let tls_socket = tokio::time::timeout(
		opts.tls_handshake_timeout,
		tls::handshake(socket, host, opts, key.force_h1),
	)
	.await
	.map_err(|_| Error::TlsHandshakeTimeout)??;

	let alpn = tls_socket.negotiated_alpn();
	debug!(?alpn, "tls handshake complete");

	// `force_h1` already kept `h2` out of our own ALPN offer in `tls::handshake`,
	// so the `force_h1` arm below only fires for a `tls_handshake` hook's own
	// connector; fall back to HTTP/1.1 rather than erroring, same as the
	// `dial_tls` branch above.
	match choose_protocol(alpn, key.force_h1, opts.force_protocol)? {
		Protocol::Http1 => Ok(Dialled::Http1(tls_socket)),
		Protocol::Http2 => Ok(Dialled::Http2(tls_socket)),
	}
}

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::ForceProtocol;

	#[test]
	fn h2_alpn_promotes_by_default() {
		let choice = choose_protocol(Some(Alpn::H2), false, ForceProtocol::None).unwrap();
		assert_eq!(choice, Protocol::Http2);
	}

	#[test]
	fn force_h1_downgrades_h2_alpn_instead_of_erroring() {
		// A `Connection: Upgrade` request pinned to HTTP/1.1 must not fail
		// just because the origin turns out to be h2-capable.
		let choice = choose_protocol(Some(Alpn::H2), true, ForceProtocol::None).unwrap();
		assert_eq!(choice, Protocol::Http1);
		let choice = choose_protocol(Some(Alpn::H2), true, ForceProtocol::Http2).unwrap();
		assert_eq!(choice, Protocol::Http1);
	}

	#[test]
	fn no_h2_alpn_falls_back_to_http1() {
		let choice = choose_protocol(Some(Alpn::Http11), false, ForceProtocol::None).unwrap();
		assert_eq!(choice, Protocol::Http1);
		let choice = choose_protocol(None, false, ForceProtocol::None).unwrap();
		assert_eq!(choice, Protocol::Http1);
	}

	#[test]
	fn force_http2_without_h2_alpn_errors() {
		let err = choose_protocol(None, false, ForceProtocol::Http2).unwrap_err();
		assert!(matches!(err, Error::Http2NotSupported));
	}
}
