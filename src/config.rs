//! `TransportOptions`: the process- or instance-wide configuration surface.
//! A plain constructible struct, not a global -- the outer library owns
//! any process-wide default instance as an opt-in convenience.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::{HeaderMap, Uri};

use crate::error::Result;

/// Which protocol, if any, the caller forces every request onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForceProtocol {
	#[default]
	None,
	Http1,
	Http2,
	Http3,
}

/// Resolves the proxy (if any) a request should be routed through.
pub trait ProxyResolver: Send + Sync {
	fn resolve(&self, uri: &Uri) -> Option<Uri>;
}

/// No proxy, ever. The default.
#[derive(Debug, Default)]
pub struct NoProxy;
impl ProxyResolver for NoProxy {
	fn resolve(&self, _uri: &Uri) -> Option<Uri> {
		None
	}
}

/// Supplies extra headers for a proxy `CONNECT` request.
pub trait ProxyConnectHeaders: Send + Sync {
	fn headers(&self, proxy: &Uri, target: &str) -> HeaderMap;
}

/// Debug/trace sink the transport reports low-level events to, in addition
/// to `tracing`. Kept as a trait (per `crates/hbone/src/pool.rs`'s
/// `CertificateFetcher`) rather than a bare closure so stateful
/// implementations and test doubles are first class.
pub trait DebugLog: Send + Sync {
	fn log(&self, line: &str);
}

/// Configuration for the transport core.
#[derive(Clone)]
pub struct TransportOptions {
	// Timeouts
	pub tls_handshake_timeout: Duration,
	pub response_header_timeout: Option<Duration>,
	pub expect_continue_timeout: Duration,
	pub idle_conn_timeout: Duration,

	// Pool limits
	pub max_idle_conns: usize,
	pub max_idle_conns_per_host: usize,
	pub max_conns_per_host: usize,

	// Buffer sizes
	pub read_buffer_size: usize,
	pub write_buffer_size: usize,

	// Feature switches
	pub disable_keep_alives: bool,
	pub disable_compression: bool,
	pub force_protocol: ForceProtocol,
	pub enable_h2c: bool,
	pub disable_auto_decode: bool,

	// Header-parsing bound
	pub max_response_header_bytes: usize,

	// Hooks
	pub proxy_resolver: Arc<dyn ProxyResolver>,
	pub proxy_connect_headers: Option<Arc<dyn ProxyConnectHeaders>>,
	pub debug_log: Option<Arc<dyn DebugLog>>,

	/// Sinks invoked with raw response body bytes as they're decorated.
	/// The core defines only the hook point; an outer dump/tracing library
	/// owns what the sinks actually do.
	pub response_tee_sinks: Vec<crate::body::TeeSink>,

	/// Overrides the plain TCP dial step (§4.B step 1) for every connection
	/// that is not routed through a SOCKS5/HTTP-CONNECT proxy. `None` uses
	/// `dial::default_dial` (`tokio::net::TcpStream::connect`).
	pub dial: Option<Arc<dyn Dial>>,
	/// Overrides the dial-plus-TLS step for `https` targets: when set, this
	/// replaces *both* the TCP dial and the TLS handshake for a direct
	/// (non-proxied) connection, handing back a socket the core treats as
	/// already TLS-terminated. A socket returned this way with no reachable
	/// ALPN info defaults to HTTP/1.1 (see `Socket::negotiated_alpn`).
	pub dial_tls: Option<Arc<dyn DialTls>>,
	/// Overrides just the TLS handshake given an already-dialled plain
	/// socket (SOCKS5/CONNECT tunnels and direct TCP dials alike). Ignored
	/// when `dial_tls` is set, since that hook already returns a
	/// TLS-terminated socket.
	pub tls_handshake: Option<Arc<dyn TlsHandshake>>,

	// HTTP/2 parameters
	pub h2: Http2Options,
}

/// HTTP/2-specific tuning, applied to the `h2` client builder when a
/// connection is promoted (ALPN) or forced to HTTP/2.
#[derive(Debug, Clone)]
pub struct Http2Options {
	pub initial_window_size: Option<u32>,
	pub initial_connection_window_size: Option<u32>,
	pub max_frame_size: Option<u32>,
	pub max_header_list_size: Option<u32>,
	pub max_concurrent_streams: Option<u32>,
	pub strict_max_concurrent_streams: bool,
	pub read_idle_timeout: Option<Duration>,
	pub ping_timeout: Duration,
	pub max_send_buffer_size: usize,
}

impl Default for Http2Options {
	fn default() -> Self {
		Http2Options {
			initial_window_size: None,
			initial_connection_window_size: None,
			max_frame_size: None,
			max_header_list_size: Some(16 * 1024),
			max_concurrent_streams: None,
			strict_max_concurrent_streams: false,
			read_idle_timeout: None,
			ping_timeout: Duration::from_secs(15),
			max_send_buffer_size: 1024 * 1024,
		}
	}
}

impl Default for TransportOptions {
	fn default() -> Self {
		TransportOptions {
			tls_handshake_timeout: Duration::from_secs(10),
			response_header_timeout: None,
			expect_continue_timeout: Duration::from_secs(1),
			idle_conn_timeout: Duration::from_secs(90),

			max_idle_conns: 100,
			max_idle_conns_per_host: 2,
			max_conns_per_host: 0,

			read_buffer_size: 4096,
			write_buffer_size: 4096,

			disable_keep_alives: false,
			disable_compression: false,
			force_protocol: ForceProtocol::None,
			enable_h2c: false,
			disable_auto_decode: false,

			max_response_header_bytes: 10 * 1024 * 1024,

			proxy_resolver: Arc::new(NoProxy),
			proxy_connect_headers: None,
			debug_log: None,
			response_tee_sinks: Vec::new(),
			dial: None,
			dial_tls: None,
			tls_handshake: None,

			h2: Http2Options::default(),
		}
	}
}

impl fmt::Debug for TransportOptions {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TransportOptions")
			.field("tls_handshake_timeout", &self.tls_handshake_timeout)
			.field("response_header_timeout", &self.response_header_timeout)
			.field("expect_continue_timeout", &self.expect_continue_timeout)
			.field("idle_conn_timeout", &self.idle_conn_timeout)
			.field("max_idle_conns", &self.max_idle_conns)
			.field("max_idle_conns_per_host", &self.max_idle_conns_per_host)
			.field("max_conns_per_host", &self.max_conns_per_host)
			.field("read_buffer_size", &self.read_buffer_size)
			.field("write_buffer_size", &self.write_buffer_size)
			.field("disable_keep_alives", &self.disable_keep_alives)
			.field("disable_compression", &self.disable_compression)
			.field("force_protocol", &self.force_protocol)
			.field("enable_h2c", &self.enable_h2c)
			.field("disable_auto_decode", &self.disable_auto_decode)
			.field("max_response_header_bytes", &self.max_response_header_bytes)
			.field("response_tee_sinks", &self.response_tee_sinks.len())
			.field("h2", &self.h2)
			.finish_non_exhaustive()
	}
}

impl TransportOptions {
	pub fn resolve_proxy(&self, uri: &Uri) -> Option<Uri> {
		self.proxy_resolver.resolve(uri)
	}
}

type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Hooks for overriding the dial/TLS pipeline. Left unimplemented by
/// default: the transport's own dialler (`dial::default_dial`,
/// `dial::tls::default_handshake`) is used unless the caller supplies one.
/// Modeled as a trait returning a boxed future (rather than a native async
/// fn) so the hook can be stored as `Arc<dyn Dial>`.
pub trait Dial: Send + Sync {
	fn dial<'a>(&'a self, addr: &'a str) -> BoxFuture<'a, Result<Box<dyn crate::socket::DuplexIo>>>;
}

pub trait DialTls: Send + Sync {
	fn dial_tls<'a>(
		&'a self,
		addr: &'a str,
	) -> BoxFuture<'a, Result<Box<dyn crate::socket::DuplexIo>>>;
}

/// Overrides just the TLS handshake step (§6: "tls_handshake(ctx, addr,
/// plain_conn) -> (conn, tls_state)"), given a socket the dial pipeline
/// already produced (a direct TCP dial, or the tail of a SOCKS5/CONNECT
/// tunnel). Distinct from `DialTls`, which replaces the dial *and* the
/// handshake together.
pub trait TlsHandshake: Send + Sync {
	fn handshake<'a>(
		&'a self,
		addr: &'a str,
		plain: Box<dyn crate::socket::DuplexIo>,
	) -> BoxFuture<'a, Result<Box<dyn crate::socket::DuplexIo>>>;
}
