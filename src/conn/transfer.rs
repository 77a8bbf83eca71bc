//! Body transfer framing: selecting identity/chunked/content-length framing
//! from the body and method, and the chunked codec used to write and read
//! it. Hand-written (this layer needs exact control over framing selection
//! that higher-level HTTP libraries, including `hyper`, do not expose at
//! this layer) but modeled on the split read/write-half shape of
//! `crates/hbone/src/client.rs`'s `H2StreamReadHalf`/`H2StreamWriteHalf`
//! pair, even though the wire format here is HTTP/1.1, not HTTP/2 framing.

use bytes::{Bytes, BytesMut};
use http::Method;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// How the body of an outgoing request (or an incoming response) is framed
/// on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
	/// No body at all (e.g. `HEAD` responses, `204`/`304`).
	None,
	/// `Content-Length: N`; exactly N bytes follow.
	ContentLength(u64),
	/// `Transfer-Encoding: chunked`.
	Chunked,
	/// No `Content-Length` and not chunked: body runs to connection close.
	/// Valid for responses; a request body must pick one of the other two.
	UntilClose,
}

/// Choose the wire framing for a request body given its known length (if
/// any) and the method. `CONNECT`/`TRACE`/`GET`/`HEAD` with no body use
/// `None`; a body with a known length uses `Content-Length`; an unsized
/// streaming body uses chunked.
pub fn choose_request_framing(method: &Method, known_len: Option<u64>) -> Framing {
	match known_len {
		Some(0) if matches!(*method, Method::GET | Method::HEAD | Method::CONNECT | Method::TRACE) => {
			Framing::None
		},
		Some(n) => Framing::ContentLength(n),
		None => Framing::Chunked,
	}
}

/// Write one chunk of a chunked-encoded body (the size line, CRLF, data,
/// CRLF).
pub async fn write_chunk<W: AsyncWrite + Unpin>(w: &mut W, data: &[u8]) -> Result<()> {
	if data.is_empty() {
		return Ok(());
	}
	let header = format!("{:x}\r\n", data.len());
	w.write_all(header.as_bytes()).await?;
	w.write_all(data).await?;
	w.write_all(b"\r\n").await?;
	Ok(())
}

/// Write the terminating `0\r\n\r\n` chunk of a chunked body (no trailers
/// supported at this layer; trailers are an outer-library concern).
pub async fn write_final_chunk<W: AsyncWrite + Unpin>(w: &mut W) -> Result<()> {
	w.write_all(b"0\r\n\r\n").await?;
	Ok(())
}

/// Reads exactly `len` bytes as a single content-length-framed body.
pub async fn read_content_length<R: AsyncRead + Unpin>(r: &mut R, len: u64) -> Result<Bytes> {
	let mut buf = vec![0u8; len as usize];
	r.read_exact(&mut buf).await?;
	Ok(Bytes::from(buf))
}

/// Reads one chunked-encoded body to completion. A full implementation
/// would stream chunk-by-chunk into the body channel as each is parsed;
/// this drives the same state machine but collects into one buffer, which
/// the read loop (`conn::read`) turns into a stream of frames for its
/// `IncomingBody`.
pub async fn read_chunked_body<R: AsyncRead + Unpin>(r: &mut R) -> Result<Bytes> {
	let mut out = BytesMut::new();
	loop {
		let size = read_chunk_size_line(r).await?;
		if size == 0 {
			// Trailers, then the empty line that terminates the message.
			loop {
				let line = read_line(r).await?;
				if line.is_empty() {
					break;
				}
			}
			break;
		}
		let mut chunk = vec![0u8; size as usize];
		r.read_exact(&mut chunk).await?;
		out.extend_from_slice(&chunk);
		// Trailing CRLF after the chunk data.
		let mut crlf = [0u8; 2];
		r.read_exact(&mut crlf).await?;
		if &crlf != b"\r\n" {
			return Err(Error::MalformedResponse(
				"chunk not terminated by CRLF".into(),
			));
		}
	}
	Ok(out.freeze())
}

async fn read_chunk_size_line<R: AsyncRead + Unpin>(r: &mut R) -> Result<u64> {
	let line = read_line(r).await?;
	// Strip chunk extensions (`;name=value`).
	let size_str = line.split(';').next().unwrap_or("").trim();
	u64::from_str_radix(size_str, 16)
		.map_err(|_| Error::MalformedResponse(format!("invalid chunk size: {size_str:?}")))
}

async fn read_line<R: AsyncRead + Unpin>(r: &mut R) -> Result<String> {
	let mut line = Vec::new();
	let mut byte = [0u8; 1];
	loop {
		let n = r.read(&mut byte).await?;
		if n == 0 {
			return Err(Error::read_from_server(std::io::Error::new(
				std::io::ErrorKind::UnexpectedEof,
				"eof reading chunk line",
			)));
		}
		if byte[0] == b'\n' {
			if line.last() == Some(&b'\r') {
				line.pop();
			}
			break;
		}
		line.push(byte[0]);
	}
	String::from_utf8(line).map_err(|_| Error::MalformedResponse("non-utf8 chunk line".into()))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn framing_choice() {
		assert_eq!(
			choose_request_framing(&Method::GET, Some(0)),
			Framing::None
		);
		assert_eq!(
			choose_request_framing(&Method::POST, Some(10)),
			Framing::ContentLength(10)
		);
		assert_eq!(
			choose_request_framing(&Method::POST, None),
			Framing::Chunked
		);
	}

	#[tokio::test]
	async fn round_trips_chunked_body() {
		let mut wire = Vec::new();
		write_chunk(&mut wire, b"hello").await.unwrap();
		write_chunk(&mut wire, b" world").await.unwrap();
		write_final_chunk(&mut wire).await.unwrap();

		let mut cursor = std::io::Cursor::new(wire);
		let body = read_chunked_body(&mut cursor).await.unwrap();
		assert_eq!(&body[..], b"hello world");
	}
}
