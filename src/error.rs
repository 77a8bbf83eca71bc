//! Error namespace for the transport core.
//!
//! Every distinct failure mode the transport pipeline can produce gets its
//! own variant so callers can `matches!(err, Error::ServerClosedIdle)`
//! instead of string-sniffing.

/// The single error type returned by every fallible operation in this crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("cannot rewind request body after connection loss")]
	CannotRewindBody,

	#[error("keep-alives are disabled for this transport")]
	KeepAlivesDisabled,

	#[error("use of closed network connection")]
	ConnBroken,

	#[error("idle connection closed by CloseIdleConnections")]
	CloseIdle,

	#[error("too many idle connections")]
	TooManyIdle,

	#[error("too many idle connections for host")]
	TooManyIdlePerHost,

	#[error("idle connection timeout")]
	IdleConnTimeout,

	#[error("server closed idle connection")]
	ServerClosedIdle,

	#[error("request canceled")]
	RequestCanceled,

	#[error("TLS handshake timed out")]
	TlsHandshakeTimeout,

	#[error("timeout awaiting response headers")]
	ResponseHeaderTimeout,

	#[error("proxyconnect: {0}")]
	ProxyConnectFailed(String),

	#[error("invalid header {field}: {reason}")]
	InvalidHeader { field: String, reason: String },

	#[error("no Host in request URL")]
	MissingHost,

	#[error("HTTP/2 was not negotiated by the server")]
	Http2NotSupported,

	#[error("server response headers exceeded {limit} bytes")]
	HeaderListTooLong { limit: usize },

	#[error("too many 1xx informational responses")]
	TooManyInformationalResponses,

	#[error("malformed HTTP response: {0}")]
	MalformedResponse(String),

	#[error("no cached connection is available for this protocol")]
	NoCachedConn,

	#[error("dial failed: {0}")]
	Dial(String),

	#[error("SOCKS5 proxy error: {0}")]
	Socks(String),

	#[error("HTTP/2 error: {0}")]
	H2(String),

	#[error(transparent)]
	Io(#[from] std::io::Error),

	/// Zero bytes of the request were written to the wire before the error
	/// occurred. Wraps the underlying cause so the dispatcher can tell,
	/// without re-deriving it, that replay on a fresh connection is always
	/// safe regardless of request idempotency.
	#[error("nothing written: {0}")]
	NothingWritten(Box<Error>),
}

impl Error {
	/// True for the errors the replay predicate in the dispatcher is allowed
	/// to consider when deciding whether a reused connection's failure is
	/// safe to retry on a fresh one.
	pub fn is_replayable_cause(&self) -> bool {
		matches!(
			self,
			Error::NoCachedConn | Error::ServerClosedIdle | Error::NothingWritten(_)
		) || self.is_first_byte_read_failure()
	}

	fn is_first_byte_read_failure(&self) -> bool {
		// "read from server" failing on the very first peek byte is modeled
		// as an Io error surfaced from the read loop before any response was
		// observed; callers set this via `Error::read_from_server`.
		matches!(self, Error::MalformedResponse(m) if m == "EOF")
	}

	pub fn read_from_server(e: std::io::Error) -> Error {
		if e.kind() == std::io::ErrorKind::UnexpectedEof {
			Error::MalformedResponse("EOF".to_string())
		} else {
			Error::Io(e)
		}
	}

	pub fn nothing_written(self) -> Error {
		Error::NothingWritten(Box::new(self))
	}
}

pub type Result<T> = std::result::Result<T, Error>;
