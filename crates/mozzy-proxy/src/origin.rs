//! Origin dialer
//!
//! A minimal HTTP/1.1 client used by both engines to reach the real
//! origin. TLS connections chain-validate against the platform trust
//! store: the proxy is trusted by the client (installed CA), never by the
//! origin, and disabling upstream verification would turn it into a
//! universal stripper.

use crate::errors::{Error, Result};
use crate::http1;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

/// Request-level dispatch timeout: connect, request write and response
/// head. Body relay is chunk-wise and not bounded by it.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IoStream for T {}

type BoxedStream = Box<dyn IoStream>;

/// An outbound request head, already rewritten for the origin.
#[derive(Debug)]
pub struct OutboundRequest {
  pub method: Method,
  pub uri: Uri,
  pub headers: HeaderMap,
}

/// Body source for an outbound request.
pub enum RequestBody<'a> {
  /// No body.
  Empty,
  /// An in-memory body; a `Content-Length` header is added if absent.
  Buffered(Bytes),
  /// A body streamed from the client connection, `length` bytes long.
  Streamed {
    reader: &'a mut (dyn AsyncBufRead + Unpin + Send),
    length: u64,
  },
}

/// Dispatches requests to origins over plain TCP or verified TLS.
pub struct Origin {
  tls: TlsConnector,
}

impl Origin {
  /// Build a dialer whose TLS client validates against the platform roots.
  pub fn new() -> Result<Self> {
    let mut roots = RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
      roots
        .add(cert)
        .map_err(|e| Error::tls(format!("failed to load native root: {}", e)))?;
    }
    let config = ClientConfig::builder()
      .with_root_certificates(roots)
      .with_no_client_auth();
    Ok(Self {
      tls: TlsConnector::from(Arc::new(config)),
    })
  }

  /// Dispatch a request and return the parsed response head with the body
  /// still on the wire. The 30-second timeout covers everything up to and
  /// including the response head.
  pub async fn send(
    &self,
    request: &OutboundRequest,
    body: RequestBody<'_>,
  ) -> Result<UpstreamResponse> {
    match tokio::time::timeout(REQUEST_TIMEOUT, self.dispatch(request, body)).await {
      Ok(result) => result,
      Err(_) => Err(Error::upstream(format!(
        "request to {} timed out",
        request.uri
      ))),
    }
  }

  async fn dispatch(
    &self,
    request: &OutboundRequest,
    body: RequestBody<'_>,
  ) -> Result<UpstreamResponse> {
    let mut stream = self.connect(&request.uri).await?;

    let length = match &body {
      RequestBody::Empty => None,
      RequestBody::Buffered(bytes) => Some(bytes.len() as u64),
      RequestBody::Streamed { length, .. } => Some(*length),
    };
    let head = serialize_request_head(request, length);
    stream.write_all(&head).await?;
    match body {
      RequestBody::Empty => {}
      RequestBody::Buffered(bytes) => stream.write_all(&bytes).await?,
      RequestBody::Streamed { reader, length } => {
        http1::copy_limited(reader, &mut stream, length).await?;
      }
    }
    stream.flush().await?;

    let mut reader = BufReader::new(stream);
    let head = http1::read_response_head(&mut reader).await?;
    Ok(UpstreamResponse {
      version: head.version,
      status: head.status,
      headers: head.headers,
      request_method: request.method.clone(),
      reader,
    })
  }

  async fn connect(&self, uri: &Uri) -> Result<BoxedStream> {
    let https = uri.scheme_str() == Some("https");
    let host = uri
      .host()
      .ok_or_else(|| Error::upstream(format!("no host in target URL: {}", uri)))?
      .to_string();
    let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });

    let tcp = TcpStream::connect((host.as_str(), port))
      .await
      .map_err(|e| Error::upstream(format!("failed to connect to {}:{}: {}", host, port, e)))?;

    if https {
      let server_name = ServerName::try_from(host.clone())
        .map_err(|_| Error::upstream(format!("invalid server name: {}", host)))?;
      let tls = self
        .tls
        .connect(server_name, tcp)
        .await
        .map_err(|e| Error::upstream(format!("TLS handshake with {} failed: {}", host, e)))?;
      Ok(Box::new(tls))
    } else {
      Ok(Box::new(tcp))
    }
  }
}

/// A response head with the body left unread for streaming relay.
pub struct UpstreamResponse {
  pub version: Version,
  pub status: StatusCode,
  pub headers: HeaderMap,
  request_method: Method,
  reader: BufReader<BoxedStream>,
}

impl UpstreamResponse {
  /// True when the response carries a body at all.
  fn has_body(&self) -> bool {
    if self.request_method == Method::HEAD {
      return false;
    }
    let code = self.status.as_u16();
    !(self.status.is_informational() || code == 204 || code == 304)
  }

  /// Stream the body to `writer`, decoding chunked transfer encoding and
  /// honoring an explicit `Content-Length`. Returns the bytes written.
  pub async fn copy_body_to<W>(mut self, writer: &mut W) -> Result<u64>
  where
    W: AsyncWrite + Unpin,
  {
    if !self.has_body() {
      return Ok(0);
    }
    if http1::is_chunked(&self.headers) {
      http1::copy_chunked(&mut self.reader, writer).await
    } else if let Some(length) = http1::content_length(&self.headers) {
      http1::copy_limited(&mut self.reader, writer, length).await
    } else {
      http1::copy_to_eof(&mut self.reader, writer).await
    }
  }
}

fn serialize_request_head(request: &OutboundRequest, body_length: Option<u64>) -> Vec<u8> {
  let mut head = Vec::new();
  head.extend_from_slice(request.method.as_str().as_bytes());
  head.push(b' ');
  head.extend_from_slice(request.uri.path().as_bytes());
  if let Some(query) = request.uri.query() {
    head.push(b'?');
    head.extend_from_slice(query.as_bytes());
  }
  head.extend_from_slice(b" HTTP/1.1\r\n");

  let mut headers = request.headers.clone();
  if headers.get(http::header::HOST).is_none() {
    if let Some(authority) = request.uri.authority() {
      if let Ok(value) = authority.as_str().parse() {
        headers.insert(http::header::HOST, value);
      }
    }
  }
  if let Some(length) = body_length {
    headers
      .entry(http::header::CONTENT_LENGTH)
      .or_insert_with(|| http::HeaderValue::from(length));
  }

  for (name, value) in headers.iter() {
    head.extend_from_slice(name.as_str().as_bytes());
    head.extend_from_slice(b": ");
    head.extend_from_slice(value.as_bytes());
    head.extend_from_slice(b"\r\n");
  }
  head.extend_from_slice(b"\r\n");
  head
}
