//! Connection pooling, dialing, and HTTP/1.1 wire engine underlying a
//! general-purpose HTTP client.
//!
//! This crate is the CORE of an HTTP client library: it carries a prepared
//! `http::Request` to an origin server and returns an `http::Response`. It
//! does not do body marshalling, retry scheduling above the connection
//! layer, cookie jars, redirects, request dumping, or provide a fluent
//! builder API -- those are an outer library's job, built on top of
//! [`Transport::round_trip`].
//!
//! See `DESIGN.md` in the crate root for the grounding ledger and notes on
//! a handful of deliberate design decisions.

pub mod admission;
pub mod altsvc;
pub mod body;
pub mod config;
pub mod conn;
pub mod decode;
pub mod dial;
pub mod dispatch;
pub mod error;
pub mod h2conn;
pub mod key;
pub mod pool;
pub mod socket;
pub mod waiter;

pub use config::{
	Dial, DialTls, ForceProtocol, Http2Options, NoProxy, ProxyConnectHeaders, ProxyResolver,
	TlsHandshake, TransportOptions,
};
pub use conn::ReqBody;
pub use dispatch::{RequestContext, RespBody, Transport};
pub use error::{Error, Result};
pub use key::ConnectionKey;
