//! Shared HTTP/1.1 wire helpers
//!
//! Request/response head parsing and body framing used by the front door,
//! the MITM inner read and the origin dialer.

use crate::errors::{Error, Result};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum request/status line length (8 KB).
const MAX_LINE: u64 = 8 * 1024;
/// Maximum accumulated header bytes (64 KB).
const MAX_HEADERS: usize = 64 * 1024;

const CR_LF: &[u8] = b"\r\n";

/// Parsed request line plus headers.
#[derive(Debug)]
pub(crate) struct RequestHead {
  pub method: Method,
  pub target: String,
  pub version: Version,
  pub headers: HeaderMap,
}

/// Parsed status line plus headers.
#[derive(Debug)]
pub(crate) struct ResponseHead {
  pub version: Version,
  pub status: StatusCode,
  pub headers: HeaderMap,
}

/// Read one line, bounded. A line that hits the limit without a newline is
/// rejected rather than buffered without end.
async fn read_line_limited<R>(reader: &mut R, buf: &mut Vec<u8>) -> Result<usize>
where
  R: AsyncBufRead + Unpin,
{
  let mut limited = reader.take(MAX_LINE);
  let n = limited.read_until(b'\n', buf).await?;
  if n as u64 == MAX_LINE && buf.last() != Some(&b'\n') {
    return Err(Error::invalid_request("line exceeds maximum allowed length"));
  }
  Ok(n)
}

/// Read the request line and headers of one HTTP/1.1 request.
pub(crate) async fn read_request_head<R>(reader: &mut R) -> Result<RequestHead>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = Vec::new();
  let n = read_line_limited(reader, &mut line).await?;
  if n == 0 {
    return Err(Error::invalid_request("connection closed before request line"));
  }

  let line_str = String::from_utf8_lossy(&line);
  let mut parts = line_str.split_whitespace();
  let method = parts
    .next()
    .ok_or_else(|| Error::invalid_request("empty request line"))?;
  let target = parts
    .next()
    .ok_or_else(|| Error::invalid_request("request line missing target"))?
    .to_string();
  let version = parse_version(parts.next().unwrap_or("HTTP/1.1"))?;

  let method = Method::from_bytes(method.as_bytes())
    .map_err(|_| Error::invalid_request(format!("invalid method: {}", method)))?;
  let headers = read_headers(reader).await?;

  Ok(RequestHead {
    method,
    target,
    version,
    headers,
  })
}

/// Read the status line and headers of one HTTP/1.1 response.
pub(crate) async fn read_response_head<R>(reader: &mut R) -> Result<ResponseHead>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = Vec::new();
  let n = read_line_limited(reader, &mut line).await?;
  if n == 0 {
    return Err(Error::upstream("connection closed before status line"));
  }

  let stripped = line.strip_suffix(CR_LF).unwrap_or(&line);
  let mut version = None;
  let mut status = None;
  for (index, part) in stripped.splitn(3, |b| *b == b' ').enumerate() {
    match index {
      0 => version = Some(parse_version(&String::from_utf8_lossy(part))?),
      1 => {
        status = Some(
          StatusCode::from_bytes(part)
            .map_err(|_| Error::upstream("invalid status code in response"))?,
        )
      }
      _ => {}
    }
  }
  let (version, status) = match (version, status) {
    (Some(v), Some(s)) => (v, s),
    _ => return Err(Error::upstream("invalid status line")),
  };

  let headers = read_headers(reader).await?;
  Ok(ResponseHead {
    version,
    status,
    headers,
  })
}

/// Read header lines until the blank line, bounded by [`MAX_HEADERS`].
/// Unparseable lines are skipped.
pub(crate) async fn read_headers<R>(reader: &mut R) -> Result<HeaderMap>
where
  R: AsyncBufRead + Unpin,
{
  let mut headers = HeaderMap::new();
  let mut total = 0usize;
  let mut line = Vec::new();
  loop {
    line.clear();
    let n = read_line_limited(reader, &mut line).await?;
    if n == 0 || line == b"\r\n" || line == b"\n" {
      break;
    }
    total += n;
    if total > MAX_HEADERS {
      return Err(Error::invalid_request("headers exceed maximum allowed size"));
    }
    if let (Some(name), Some(value)) = parse_header_line(&line) {
      headers.append(name, value);
    }
  }
  Ok(headers)
}

fn parse_header_line(buffer: &[u8]) -> (Option<HeaderName>, Option<HeaderValue>) {
  let mut name = None;
  let mut value = None;
  let buffer = buffer.strip_suffix(CR_LF).unwrap_or(buffer);
  let buffer = buffer.strip_suffix(b"\n").unwrap_or(buffer);
  for (index, part) in buffer.splitn(2, |b| *b == b':').enumerate() {
    match index {
      0 => name = HeaderName::from_bytes(part).ok(),
      1 => {
        let part = part.strip_prefix(b" ").unwrap_or(part);
        value = HeaderValue::from_bytes(part).ok();
      }
      _ => {}
    }
  }
  (name, value)
}

fn parse_version(text: &str) -> Result<Version> {
  match text.trim() {
    "HTTP/0.9" => Ok(Version::HTTP_09),
    "HTTP/1.0" => Ok(Version::HTTP_10),
    "HTTP/1.1" => Ok(Version::HTTP_11),
    other => Err(Error::invalid_request(format!(
      "unsupported HTTP version: {}",
      other
    ))),
  }
}

/// Headers that apply to a single transport hop and are stripped before
/// re-forwarding.
const HOP_BY_HOP_HEADERS: [&str; 9] = [
  "connection",
  "proxy-connection",
  "keep-alive",
  "proxy-authenticate",
  "proxy-authorization",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
];

/// Remove every hop-by-hop header in place.
pub(crate) fn remove_hop_headers(headers: &mut HeaderMap) {
  for name in HOP_BY_HOP_HEADERS {
    headers.remove(name);
  }
}

/// `Content-Length`, when present and parseable.
pub(crate) fn content_length(headers: &HeaderMap) -> Option<u64> {
  headers
    .get(http::header::CONTENT_LENGTH)
    .and_then(|v| v.to_str().ok()?.parse().ok())
}

/// True when the transfer encoding is chunked.
pub(crate) fn is_chunked(headers: &HeaderMap) -> bool {
  headers
    .get(http::header::TRANSFER_ENCODING)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.to_ascii_lowercase().contains("chunked"))
    .unwrap_or(false)
}

/// Write a minimal response with a short plain-text body and close framing.
pub(crate) async fn write_simple_response<W>(
  writer: &mut W,
  status: StatusCode,
  body: &str,
) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  let head = format!(
    "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
    status.as_u16(),
    status.canonical_reason().unwrap_or("Unknown"),
    body.len()
  );
  writer.write_all(head.as_bytes()).await?;
  writer.write_all(body.as_bytes()).await?;
  writer.flush().await?;
  Ok(())
}

/// Serialize a response head: status line plus headers, terminated by the
/// blank line.
pub(crate) fn serialize_response_head(status: StatusCode, headers: &HeaderMap) -> Vec<u8> {
  let mut head = Vec::new();
  head.extend_from_slice(
    format!(
      "HTTP/1.1 {} {}\r\n",
      status.as_u16(),
      status.canonical_reason().unwrap_or("Unknown")
    )
    .as_bytes(),
  );
  for (name, value) in headers.iter() {
    head.extend_from_slice(name.as_str().as_bytes());
    head.extend_from_slice(b": ");
    head.extend_from_slice(value.as_bytes());
    head.extend_from_slice(CR_LF);
  }
  head.extend_from_slice(CR_LF);
  head
}

/// Copy exactly `length` bytes, chunk-wise. Returns the bytes copied.
pub(crate) async fn copy_limited<R, W>(reader: &mut R, writer: &mut W, length: u64) -> Result<u64>
where
  R: AsyncRead + Unpin + ?Sized,
  W: AsyncWrite + Unpin,
{
  let mut remaining = length;
  let mut buffer = [0u8; 8192];
  while remaining > 0 {
    let want = remaining.min(buffer.len() as u64) as usize;
    let n = reader.read(&mut buffer[..want]).await?;
    if n == 0 {
      return Err(Error::upstream("connection closed mid-body"));
    }
    writer.write_all(&buffer[..n]).await?;
    remaining -= n as u64;
  }
  writer.flush().await?;
  Ok(length)
}

/// Copy until the peer closes. Returns the bytes copied.
pub(crate) async fn copy_to_eof<R, W>(reader: &mut R, writer: &mut W) -> Result<u64>
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut total = 0u64;
  let mut buffer = [0u8; 8192];
  loop {
    let n = reader.read(&mut buffer).await?;
    if n == 0 {
      break;
    }
    writer.write_all(&buffer[..n]).await?;
    total += n as u64;
  }
  writer.flush().await?;
  Ok(total)
}

/// Decode a chunked body, streaming the decoded bytes to `writer`.
/// Returns the decoded byte count. Trailers are consumed and dropped.
pub(crate) async fn copy_chunked<R, W>(reader: &mut R, writer: &mut W) -> Result<u64>
where
  R: AsyncBufRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut total = 0u64;
  loop {
    let size = read_chunk_size(reader).await?;
    if size == 0 {
      consume_trailers(reader).await?;
      break;
    }
    copy_limited(reader, writer, size as u64).await?;
    total += size as u64;
    consume_crlf(reader).await?;
  }
  writer.flush().await?;
  Ok(total)
}

/// Decode a chunked body into memory (used for inbound request bodies,
/// which must be re-framed with a Content-Length before forwarding).
pub(crate) async fn read_chunked_body<R>(reader: &mut R) -> Result<Vec<u8>>
where
  R: AsyncBufRead + Unpin,
{
  let mut body = Vec::new();
  loop {
    let size = read_chunk_size(reader).await?;
    if size == 0 {
      consume_trailers(reader).await?;
      break;
    }
    let mut chunk = vec![0u8; size];
    reader.read_exact(&mut chunk).await?;
    body.append(&mut chunk);
    consume_crlf(reader).await?;
  }
  Ok(body)
}

async fn read_chunk_size<R>(reader: &mut R) -> Result<usize>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = Vec::new();
  let n = read_line_limited(reader, &mut line).await?;
  if n == 0 {
    return Err(Error::upstream("connection closed mid-chunk"));
  }
  let text = String::from_utf8_lossy(&line);
  let size_text = text.trim().split(';').next().unwrap_or("").trim();
  usize::from_str_radix(size_text, 16)
    .map_err(|_| Error::upstream(format!("invalid chunk size: {}", size_text)))
}

async fn consume_crlf<R>(reader: &mut R) -> Result<()>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = Vec::new();
  read_line_limited(reader, &mut line).await?;
  Ok(())
}

async fn consume_trailers<R>(reader: &mut R) -> Result<()>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = Vec::new();
  loop {
    line.clear();
    let n = read_line_limited(reader, &mut line).await?;
    if n == 0 || line == b"\r\n" || line == b"\n" {
      break;
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::BufReader;

  #[tokio::test]
  async fn parses_request_head() {
    let raw = b"GET http://example.test/x?a=1 HTTP/1.1\r\nHost: example.test\r\nX-Keep: yes\r\n\r\n";
    let mut reader = BufReader::new(&raw[..]);
    let head = read_request_head(&mut reader).await.unwrap();
    assert_eq!(head.method, Method::GET);
    assert_eq!(head.target, "http://example.test/x?a=1");
    assert_eq!(head.version, Version::HTTP_11);
    assert_eq!(head.headers.get("host").unwrap(), "example.test");
    assert_eq!(head.headers.get("x-keep").unwrap(), "yes");
  }

  #[tokio::test]
  async fn parses_response_head() {
    let raw = b"HTTP/1.1 204 No Content\r\nServer: test\r\n\r\n";
    let mut reader = BufReader::new(&raw[..]);
    let head = read_response_head(&mut reader).await.unwrap();
    assert_eq!(head.status, StatusCode::NO_CONTENT);
    assert_eq!(head.version, Version::HTTP_11);
    assert_eq!(head.headers.get("server").unwrap(), "test");
  }

  #[tokio::test]
  async fn rejects_missing_target() {
    let raw = b"GET\r\n\r\n";
    let mut reader = BufReader::new(&raw[..]);
    assert!(read_request_head(&mut reader).await.is_err());
  }

  #[test]
  fn strips_every_hop_by_hop_header() {
    let mut headers = HeaderMap::new();
    for name in HOP_BY_HOP_HEADERS {
      headers.insert(
        HeaderName::from_bytes(name.as_bytes()).unwrap(),
        HeaderValue::from_static("x"),
      );
    }
    headers.insert("x-keep", HeaderValue::from_static("yes"));
    remove_hop_headers(&mut headers);
    assert_eq!(headers.len(), 1);
    assert!(headers.contains_key("x-keep"));
  }

  #[tokio::test]
  async fn decodes_chunked_body() {
    let raw = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
    let mut reader = BufReader::new(&raw[..]);
    let body = read_chunked_body(&mut reader).await.unwrap();
    assert_eq!(body, b"hello world");
  }

  #[tokio::test]
  async fn chunked_copy_counts_decoded_bytes() {
    let raw = b"3\r\nabc\r\n3\r\ndef\r\n0\r\n\r\n";
    let mut reader = BufReader::new(&raw[..]);
    let mut out = Vec::new();
    let n = copy_chunked(&mut reader, &mut out).await.unwrap();
    assert_eq!(n, 6);
    assert_eq!(out, b"abcdef");
  }
}
