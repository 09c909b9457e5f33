//! Proxy front door and plain-HTTP forward engine
//!
//! Accepts HTTP/1.1 on a raw listener and dispatches each request either
//! to the forward path or, for CONNECT, to the interception tunnel. Owning
//! the listener (instead of sitting behind a server framework) is what
//! lets the tunnel take the raw socket without a hijack step.

use crate::ca::CertificateAuthority;
use crate::capture::{CaptureLog, Transaction};
use crate::cert_cache::LeafCache;
use crate::errors::{Error, Result};
use crate::filter::CaptureFilter;
use crate::http1::{self, RequestHead};
use crate::origin::{Origin, OutboundRequest, RequestBody};
use crate::tunnel;
use bytes::Bytes;
use colored::Colorize;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use time::macros::format_description;
use time::OffsetDateTime;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Engine configuration, fixed for the lifetime of the server.
#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
  /// Listen port.
  pub port: u16,
  /// Enable HTTPS interception for CONNECT tunnels.
  pub https: bool,
  /// Print per-step detail while handling requests.
  pub verbose: bool,
  /// Headers set on every forwarded request, overriding client values.
  pub inject_headers: Vec<(HeaderName, HeaderValue)>,
  /// Capture filter; suppresses logging and display only.
  pub filter: CaptureFilter,
}

/// Interception state, present when HTTPS interception is enabled.
pub(crate) struct Interception {
  pub authority: Arc<CertificateAuthority>,
  pub leaves: LeafCache,
}

/// Engine-scoped context shared by every connection handler.
pub(crate) struct Engine {
  pub config: ProxyConfig,
  pub log: Arc<CaptureLog>,
  pub origin: Origin,
  pub interception: Option<Interception>,
}

/// The proxy server.
pub struct ProxyServer {
  engine: Arc<Engine>,
}

impl ProxyServer {
  /// Create a server. When interception is enabled the CA is loaded (or
  /// generated) eagerly so the first CONNECT does not pay for it.
  pub fn new(config: ProxyConfig, log: Arc<CaptureLog>) -> Result<Self> {
    let authority = if config.https {
      Some(Arc::new(CertificateAuthority::load_or_generate()?))
    } else {
      None
    };
    Self::build(config, log, authority)
  }

  /// Create a server around an already-loaded authority.
  pub fn with_authority(
    config: ProxyConfig,
    log: Arc<CaptureLog>,
    authority: Arc<CertificateAuthority>,
  ) -> Result<Self> {
    Self::build(config, log, Some(authority))
  }

  fn build(
    config: ProxyConfig,
    log: Arc<CaptureLog>,
    authority: Option<Arc<CertificateAuthority>>,
  ) -> Result<Self> {
    let origin = Origin::new()?;
    let interception = authority.map(|authority| Interception {
      leaves: LeafCache::new(authority.clone()),
      authority,
    });
    Ok(Self {
      engine: Arc::new(Engine {
        config,
        log,
        origin,
        interception,
      }),
    })
  }

  /// The loaded authority, when interception is enabled.
  pub fn authority(&self) -> Option<&Arc<CertificateAuthority>> {
    self.engine.interception.as_ref().map(|i| &i.authority)
  }

  /// The shared capture log.
  pub fn log(&self) -> &Arc<CaptureLog> {
    &self.engine.log
  }

  /// Bind the configured port on all interfaces, print the banner and
  /// serve until the process ends.
  pub async fn run(&self) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", self.engine.config.port)).await?;
    self.print_banner();
    self.serve(listener).await
  }

  /// Serve connections from an already-bound listener.
  pub async fn serve(&self, listener: TcpListener) -> Result<()> {
    loop {
      match listener.accept().await {
        Ok((stream, peer_addr)) => {
          let engine = self.engine.clone();
          tokio::spawn(async move {
            if let Err(e) = handle_connection(engine, stream, peer_addr).await {
              tracing::debug!("connection from {} ended: {}", peer_addr, e);
            }
          });
        }
        Err(e) => {
          tracing::error!("failed to accept connection: {}", e);
        }
      }
    }
  }

  fn print_banner(&self) {
    let config = &self.engine.config;
    let ip = local_ip();
    println!();
    println!(
      "{}",
      "╔════════════════════════════════════════════════════════════════════".cyan()
    );
    if config.https {
      println!("{}", "║ 🔐 Mozzy HTTPS Proxy Server".cyan());
    } else {
      println!("{}", "║ 🔄 Mozzy HTTP Proxy Server".cyan());
    }
    println!(
      "{}",
      "╚════════════════════════════════════════════════════════════════════".cyan()
    );
    println!();
    println!("{}", format!("📡 Listening on:  0.0.0.0:{}", config.port).green());
    println!("{}", format!("🌐 Local IP:      {}:{}", ip, config.port).green());
    println!();
    println!(
      "{}",
      "Configure your browser or app to use this proxy:".bright_black()
    );
    println!(
      "{}",
      format!(
        "  HTTP{} Proxy:  {}:{}",
        if config.https { "S" } else { "" },
        ip,
        config.port
      )
      .bright_black()
    );
    if config.https {
      println!();
      println!(
        "{}",
        "⚠️  HTTPS Mode: You must install the CA certificate".yellow()
      );
      println!(
        "{}",
        "  Run: mozzy proxy --export-cert > mozzy-ca.pem".bright_black()
      );
      println!(
        "{}",
        "  Then install mozzy-ca.pem in your system".bright_black()
      );
    }
    println!();
    println!("{}", "📊 Waiting for connections...".yellow());
    println!();
    println!(
      "{}",
      "────────────────────────────────────────────────────────────────────────".bright_black()
    );
    println!();
  }
}

async fn handle_connection(
  engine: Arc<Engine>,
  stream: TcpStream,
  _peer_addr: SocketAddr,
) -> Result<()> {
  let mut client = BufReader::new(stream);
  let head = http1::read_request_head(&mut client).await?;

  if head.method == Method::CONNECT {
    if engine.interception.is_some() {
      tunnel::intercept(engine, client, head).await
    } else {
      tunnel::blind_tunnel(client, &head.target).await
    }
  } else {
    forward(engine, client, head).await
  }
}

/// The plain-HTTP forward engine.
async fn forward(
  engine: Arc<Engine>,
  mut client: BufReader<TcpStream>,
  head: RequestHead,
) -> Result<()> {
  let id = engine.log.next_id();
  let started_at = OffsetDateTime::now_utc();
  let start = Instant::now();

  if engine.config.verbose {
    println!("{}", format!("→ {} {}", head.method, head.target).cyan());
  }

  let uri: Uri = match resolve_target(&head) {
    Ok(uri) => uri,
    Err(e) => {
      let host = header_str(&head.headers, http::header::HOST);
      let mut transaction =
        error_transaction(id, started_at, &head.method, &head.target, &host, "", &e);
      transaction.headers = head.headers.clone();
      engine.record(transaction);
      http1::write_simple_response(&mut client, StatusCode::BAD_GATEWAY, "Proxy error\n").await?;
      return Ok(());
    }
  };
  let host = uri
    .authority()
    .map(|a| a.as_str().to_string())
    .unwrap_or_default();
  let path = uri.path().to_string();
  let url = uri.to_string();
  let request_size = http1::content_length(&head.headers).unwrap_or(0) as i64;

  let outbound = OutboundRequest {
    method: head.method.clone(),
    uri,
    headers: engine.outbound_headers(&head.headers),
  };

  // Chunked request bodies are buffered and re-framed with a
  // Content-Length; sized bodies stream straight through.
  let response = if http1::is_chunked(&head.headers) {
    let body = http1::read_chunked_body(&mut client).await?;
    engine
      .origin
      .send(&outbound, RequestBody::Buffered(Bytes::from(body)))
      .await
  } else if let Some(length) = http1::content_length(&head.headers) {
    engine
      .origin
      .send(
        &outbound,
        RequestBody::Streamed {
          reader: &mut client,
          length,
        },
      )
      .await
  } else {
    engine.origin.send(&outbound, RequestBody::Empty).await
  };

  let response = match response {
    Ok(response) => response,
    Err(e) => {
      let mut transaction =
        error_transaction(id, started_at, &head.method, &url, &host, &path, &e);
      transaction.duration = start.elapsed();
      transaction.request_size = request_size;
      transaction.headers = head.headers.clone();
      engine.record(transaction);
      http1::write_simple_response(
        &mut client,
        StatusCode::BAD_GATEWAY,
        "Failed to reach target\n",
      )
      .await?;
      return Ok(());
    }
  };

  let duration = start.elapsed();
  let status = response.status;

  // Relay the response head with hop-by-hop headers stripped. Chunked
  // bodies are decoded on the way through, so the connection close is
  // what delimits them for the client.
  let mut response_headers = response.headers.clone();
  http1::remove_hop_headers(&mut response_headers);
  response_headers.insert(http::header::CONNECTION, HeaderValue::from_static("close"));
  client
    .write_all(&http1::serialize_response_head(status, &response_headers))
    .await?;
  let response_size = response.copy_body_to(&mut client).await.unwrap_or(0);
  client.flush().await?;

  engine.record(Transaction {
    id,
    started_at,
    method: head.method.to_string(),
    url,
    host,
    path,
    status: status.as_u16(),
    duration,
    request_size,
    response_size: response_size as i64,
    headers: head.headers,
    error: String::new(),
  });
  Ok(())
}

impl Engine {
  /// Copy headers for the outbound leg: hop-by-hop headers dropped, the
  /// Host synthesized from the target URL, injected headers applied last
  /// so they win over client values. The client's own view is never
  /// mutated.
  pub(crate) fn outbound_headers(&self, source: &HeaderMap) -> HeaderMap {
    let mut headers = source.clone();
    http1::remove_hop_headers(&mut headers);
    headers.remove(http::header::HOST);
    for (name, value) in &self.config.inject_headers {
      headers.insert(name.clone(), value.clone());
    }
    headers
  }

  /// Append to the log and print the terminal line, unless the filter
  /// suppresses this transaction.
  pub(crate) fn record(&self, transaction: Transaction) {
    if self
      .config
      .filter
      .suppresses(&transaction.method, &transaction.host, transaction.status)
    {
      return;
    }
    if transaction.error.is_empty() {
      print_summary(&transaction);
    } else {
      println!(
        "{}",
        format!(
          "✗ {} {} - {}",
          transaction.method, transaction.url, transaction.error
        )
        .red()
      );
    }
    self.log.append(transaction);
  }
}

fn resolve_target(head: &RequestHead) -> Result<Uri> {
  if head.target.starts_with("http://") || head.target.starts_with("https://") {
    head
      .target
      .parse()
      .map_err(|_| Error::invalid_request(format!("invalid target URL: {}", head.target)))
  } else {
    let host = head
      .headers
      .get(http::header::HOST)
      .and_then(|v| v.to_str().ok())
      .ok_or_else(|| Error::invalid_request("no Host header for origin-form request"))?;
    format!("http://{}{}", host, head.target)
      .parse()
      .map_err(|_| Error::invalid_request(format!("invalid target: {}", head.target)))
  }
}

pub(crate) fn error_transaction(
  id: u64,
  started_at: OffsetDateTime,
  method: &Method,
  url: &str,
  host: &str,
  path: &str,
  error: &Error,
) -> Transaction {
  Transaction {
    id,
    started_at,
    method: method.to_string(),
    url: url.to_string(),
    host: host.to_string(),
    path: path.to_string(),
    status: 0,
    duration: std::time::Duration::ZERO,
    request_size: 0,
    response_size: 0,
    headers: HeaderMap::new(),
    error: error.to_string(),
  }
}

fn header_str(headers: &HeaderMap, name: http::header::HeaderName) -> String {
  headers
    .get(name)
    .and_then(|v| v.to_str().ok())
    .unwrap_or_default()
    .to_string()
}

/// Status-tinted one-liner for a finished transaction.
fn print_summary(transaction: &Transaction) {
  let status_text = transaction.status.to_string();
  let status = if transaction.status >= 400 {
    status_text.red()
  } else if transaction.status >= 300 {
    status_text.yellow()
  } else {
    status_text.green()
  };
  let clock = transaction
    .started_at
    .format(format_description!("[hour]:[minute]:[second]"))
    .unwrap_or_default();
  println!(
    "{}  {:<6} {:<50} {} ({}ms)",
    clock.bright_black(),
    transaction.method.cyan(),
    truncate(&transaction.url, 50),
    status,
    transaction.duration.as_millis(),
  );
}

/// First non-loopback IPv4 for display; `localhost` when undeterminable.
fn local_ip() -> String {
  let probe = || -> std::io::Result<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:80")?;
    Ok(socket.local_addr()?.ip().to_string())
  };
  probe().unwrap_or_else(|_| "localhost".to_string())
}

fn truncate(s: &str, length: usize) -> String {
  if s.chars().count() <= length {
    return s.to_string();
  }
  let cut: String = s.chars().take(length.saturating_sub(3)).collect();
  format!("{}...", cut)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn head(method: Method, target: &str, host: Option<&str>) -> RequestHead {
    let mut headers = HeaderMap::new();
    if let Some(host) = host {
      headers.insert(http::header::HOST, host.parse().unwrap());
    }
    RequestHead {
      method,
      target: target.to_string(),
      version: http::Version::HTTP_11,
      headers,
    }
  }

  #[test]
  fn resolves_absolute_form() {
    let head = head(Method::GET, "http://example.test/x?q=1", None);
    let uri = resolve_target(&head).unwrap();
    assert_eq!(uri.to_string(), "http://example.test/x?q=1");
  }

  #[test]
  fn synthesizes_origin_form_from_host() {
    let head = head(Method::GET, "/x?q=1", Some("example.test:8080"));
    let uri = resolve_target(&head).unwrap();
    assert_eq!(uri.to_string(), "http://example.test:8080/x?q=1");
  }

  #[test]
  fn origin_form_without_host_fails() {
    let head = head(Method::GET, "/x", None);
    assert!(resolve_target(&head).is_err());
  }

  #[test]
  fn truncate_keeps_short_strings() {
    assert_eq!(truncate("short", 50), "short");
    let long = "x".repeat(60);
    let cut = truncate(&long, 50);
    assert_eq!(cut.chars().count(), 50);
    assert!(cut.ends_with("..."));
  }
}
