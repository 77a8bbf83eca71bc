//! TLS handshake: `rustls`/`tokio-rustls`, the same stack
//! `crates/agentgateway/src/transport/tls.rs` and `crates/hbone/src/pool.rs::connect`
//! use, with the default `ClientConfig` root store sourced from
//! `rustls-native-certs`.

use std::sync::{Arc, OnceLock};

use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio_rustls::TlsConnector;

use crate::config::TransportOptions;
use crate::error::{Error, Result};
use crate::socket::Socket;

static DEFAULT_CLIENT_CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();

fn default_client_config() -> Arc<ClientConfig> {
	DEFAULT_CLIENT_CONFIG
		.get_or_init(|| {
			let mut roots = rustls::RootCertStore::empty();
			if let Ok(certs) = rustls_native_certs::load_native_certs().certs.into_iter().try_fold(
				Vec::new(),
				|mut acc, cert| -> std::result::Result<Vec<_>, ()> {
					acc.push(cert);
					Ok(acc)
				},
			) {
				for cert in certs {
					let _ = roots.add(cert);
				}
			}
			let cfg = ClientConfig::builder()
				.with_root_certificates(roots)
				.with_no_client_auth();
			Arc::new(cfg)
		})
		.clone()
}

/// Perform the TLS handshake over `socket`. Only `Socket::Plain` (the
/// common case: direct dial, or the tail end of a SOCKS5/CONNECT tunnel,
/// both of which hand back a plain `TcpStream`) actually performs a
/// handshake here; a socket that already carries TLS or came from a
/// caller-supplied `DialTls` hook passes through unchanged -- a custom
/// hook's socket with no reachable ALPN info is treated as "no ALPN info
/// available" and the dispatcher defaults to HTTP/1.1 (see
/// `Socket::negotiated_alpn`).
///
/// If a `tls_handshake` hook is configured, it replaces this function's own
/// rustls handshake for any `Socket::Plain` input, handing back whatever
/// TLS-terminated socket the hook produces wrapped as `Socket::Custom`.
///
/// `force_h1` omits `h2` from the ALPN offer entirely, so a compliant server
/// has nothing to pick but `http/1.1` -- the mandated downgrade for
/// `Connection: Upgrade` requests (e.g. websockets) against an h2-capable
/// origin never has to rely on the caller noticing and falling back.
pub async fn handshake(socket: Socket, host: &str, opts: &TransportOptions, force_h1: bool) -> Result<Socket> {
	let tcp = match socket {
		Socket::Plain(tcp) => tcp,
		other => return Ok(other),
	};

	if let Some(hook) = &opts.tls_handshake {
		let io = hook.handshake(host, Box::new(tcp)).await?;
		return Ok(Socket::Custom(io));
	}

	let mut cfg = (*default_client_config()).clone();
	cfg.alpn_protocols = if force_h1 {
		vec![b"http/1.1".to_vec()]
	} else {
		vec![b"h2".to_vec(), b"http/1.1".to_vec()]
	};
	let connector = TlsConnector::from(Arc::new(cfg));
	let server_name = ServerName::try_from(host.to_string())
		.map_err(|_| Error::Dial(format!("invalid server name: {host}")))?;

	let stream = connector.connect(server_name, tcp).await.map_err(Error::Io)?;
	Ok(Socket::Tls(Box::new(stream)))
}
