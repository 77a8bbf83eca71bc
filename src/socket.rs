//! Socket abstraction unifying plain TCP, TLS, and proxied streams behind a
//! single `AsyncRead + AsyncWrite` type.
//!
//! Grounded in `crates/agentgateway/src/transport/stream.rs`'s
//! `Socket`/`SocketType` enum: the dial pipeline (4.B) returns one of these
//! so the HTTP/1.1 engine (4.C) is generic over "any duplex byte stream"
//! exactly once, instead of re-implementing the read/write loops per
//! transport kind.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// Object-safe marker for anything a custom `Dial`/`DialTls` hook may hand
/// back: a duplex byte stream usable as the transport for HTTP/1.1 or as the
/// TLS inner stream.
pub trait DuplexIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> DuplexIo for T {}

/// The ALPN token negotiated during a TLS handshake, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alpn {
	Http11,
	H2,
	Other,
}

impl From<&[u8]> for Alpn {
	fn from(value: &[u8]) -> Self {
		if value == b"h2" {
			Alpn::H2
		} else if value == b"http/1.1" {
			Alpn::Http11
		} else {
			Alpn::Other
		}
	}
}

/// A dialled, possibly-TLS, possibly-proxied duplex byte stream.
///
/// `Proxied` wraps another `Socket` so a SOCKS5 or CONNECT tunnel composes
/// transparently with the TLS layered on top of it: `Tls(Proxied(Plain))`.
pub enum Socket {
	Plain(TcpStream),
	Tls(Box<TlsStream<TcpStream>>),
	Proxied(Box<Socket>),
	/// A stream handed back by a caller-supplied `Dial`/`DialTls` hook; opaque
	/// to this crate beyond being a duplex byte stream.
	Custom(Box<dyn DuplexIo>),
}

impl Socket {
	/// The ALPN protocol negotiated on this socket's TLS layer, if any.
	/// `None` both when the socket never did TLS, and when a custom TLS
	/// dial hook returned a socket with no reachable `ConnectionState` --
	/// this resolves to "no ALPN info available", and the dispatcher
	/// defaults to HTTP/1.1.
	pub fn negotiated_alpn(&self) -> Option<Alpn> {
		match self {
			Socket::Tls(s) => s
				.get_ref()
				.1
				.alpn_protocol()
				.map(Alpn::from),
			Socket::Proxied(inner) => inner.negotiated_alpn(),
			Socket::Plain(_) | Socket::Custom(_) => None,
		}
	}

	pub fn is_tls(&self) -> bool {
		match self {
			Socket::Tls(_) => true,
			Socket::Proxied(inner) => inner.is_tls(),
			Socket::Plain(_) | Socket::Custom(_) => false,
		}
	}
}

impl AsyncRead for Socket {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		match self.get_mut() {
			Socket::Plain(s) => Pin::new(s).poll_read(cx, buf),
			Socket::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
			Socket::Proxied(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
			Socket::Custom(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
		}
	}
}

impl AsyncWrite for Socket {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<io::Result<usize>> {
		match self.get_mut() {
			Socket::Plain(s) => Pin::new(s).poll_write(cx, buf),
			Socket::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
			Socket::Proxied(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
			Socket::Custom(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		match self.get_mut() {
			Socket::Plain(s) => Pin::new(s).poll_flush(cx),
			Socket::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
			Socket::Proxied(s) => Pin::new(s.as_mut()).poll_flush(cx),
			Socket::Custom(s) => Pin::new(s.as_mut()).poll_flush(cx),
		}
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		match self.get_mut() {
			Socket::Plain(s) => Pin::new(s).poll_shutdown(cx),
			Socket::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
			Socket::Proxied(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
			Socket::Custom(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
		}
	}
}
