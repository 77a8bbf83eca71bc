//! Connection-key model (component A of the design).

use std::fmt;

use http::Uri;

use crate::error::{Error, Result};

/// Scheme of the origin a `ConnectionKey` addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
	Http,
	Https,
}

impl Scheme {
	fn from_uri(uri: &Uri) -> Result<Scheme> {
		match uri.scheme_str() {
			Some("http") => Ok(Scheme::Http),
			Some("https") => Ok(Scheme::Https),
			_ => Err(Error::MissingHost),
		}
	}

	fn default_port(self) -> u16 {
		match self {
			Scheme::Http => 80,
			Scheme::Https => 443,
		}
	}
}

impl fmt::Display for Scheme {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Scheme::Http => "http",
			Scheme::Https => "https",
		})
	}
}

/// Equatable, hashable key identifying a pool of interchangeable
/// connections: `(proxy, scheme, target-host:port, force-h1)`.
///
/// If the proxy is HTTP(S) and the target scheme is plain HTTP, `addr` is
/// cleared: such connections proxy arbitrary origins over the same tunnel
/// and so are reusable across different targets behind that proxy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
	pub proxy: Option<String>,
	pub scheme: Scheme,
	pub addr: Option<String>,
	pub force_h1: bool,
}

impl ConnectionKey {
	/// Derive a key from a request's target URL, a resolved proxy URL (if
	/// any), and whether the request requires HTTP/1-only semantics
	/// (`Connection: Upgrade`, `Upgrade: websocket`, or an explicit force).
	pub fn derive(uri: &Uri, proxy: Option<&Uri>, force_h1: bool) -> Result<ConnectionKey> {
		let scheme = Scheme::from_uri(uri)?;
		let addr = target_addr(uri)?;

		let proxy_str = proxy.map(|p| p.to_string());
		let proxy_is_http_like = proxy
			.and_then(|p| p.scheme_str())
			.map(|s| s == "http" || s == "https")
			.unwrap_or(false);

		let addr = if proxy_is_http_like && scheme == Scheme::Http {
			None
		} else {
			Some(addr)
		};

		Ok(ConnectionKey {
			proxy: proxy_str,
			scheme,
			addr,
			force_h1,
		})
	}

	pub fn is_proxy(&self) -> bool {
		self.proxy.is_some()
	}
}

impl fmt::Display for ConnectionKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"{}|{}|{}|h1={}",
			self.proxy.as_deref().unwrap_or("-"),
			self.scheme,
			self.addr.as_deref().unwrap_or("-"),
			self.force_h1
		)
	}
}

/// IPv6 zone identifiers (`fe80::1%eth0`) are not valid in a `Host` header;
/// the zone is stripped when building the dial address / Host header.
fn strip_zone(host: &str) -> &str {
	host.split('%').next().unwrap_or(host)
}

/// The literal `host:port` to dial for `uri`, independent of any
/// `ConnectionKey` derived from it. `ConnectionKey::derive` clears `addr`
/// for HTTP-proxy-to-HTTP-target keys since such connections are reusable
/// across different targets behind the same proxy tunnel -- but the real
/// per-request target is still needed to actually reach the origin, so
/// callers that need to dial (rather than just pool-key) a request use this
/// directly instead of unwrapping `key.addr`.
pub fn target_addr(uri: &Uri) -> Result<String> {
	let scheme = Scheme::from_uri(uri)?;
	let host = uri.host().ok_or(Error::MissingHost)?;
	let port = uri.port_u16().unwrap_or(scheme.default_port());
	Ok(format!("{}:{}", strip_zone(host), port))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn uri(s: &str) -> Uri {
		s.parse().unwrap()
	}

	#[test]
	fn derives_default_ports() {
		let k = ConnectionKey::derive(&uri("http://example.test/"), None, false).unwrap();
		assert_eq!(k.addr.as_deref(), Some("example.test:80"));
		let k = ConnectionKey::derive(&uri("https://example.test/"), None, false).unwrap();
		assert_eq!(k.addr.as_deref(), Some("example.test:443"));
	}

	#[test]
	fn http_proxy_to_http_target_clears_addr() {
		let proxy = uri("http://proxy.test:8080/");
		let k = ConnectionKey::derive(&uri("http://example.test/"), Some(&proxy), false).unwrap();
		assert!(k.addr.is_none());
		assert_eq!(k.proxy.as_deref(), Some("http://proxy.test:8080/"));
	}

	#[test]
	fn http_proxy_to_https_target_keeps_addr() {
		let proxy = uri("http://proxy.test:8080/");
		let k = ConnectionKey::derive(&uri("https://example.test/"), Some(&proxy), false).unwrap();
		assert!(k.addr.is_some());
	}

	#[test]
	fn strips_ipv6_zone() {
		assert_eq!(strip_zone("fe80::1%eth0"), "fe80::1");
		assert_eq!(strip_zone("fe80::1"), "fe80::1");

		let k = ConnectionKey::derive(&uri("http://[fe80::1%25eth0]/"), None, false).unwrap();
		let addr = k.addr.unwrap();
		assert!(!addr.contains('%'), "zone id leaked into dial address: {addr}");
	}

	#[test]
	fn missing_host_errors() {
		let bad: Uri = "/just/a/path".parse().unwrap();
		assert!(matches!(
			ConnectionKey::derive(&bad, None, false),
			Err(Error::MissingHost)
		));
	}
}
