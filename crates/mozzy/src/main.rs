//! mozzy — terminal HTTP/HTTPS intercepting proxy

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use http::{HeaderName, HeaderValue};
use mozzy_proxy::{
  export_har, CaptureFilter, CaptureLog, CertificateAuthority, ProxyConfig, ProxyServer, Result,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mozzy", version, about = "Terminal HTTP/HTTPS intercepting proxy")]
struct Cli {
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Start an HTTP/HTTPS proxy server to intercept and inspect traffic
  ///
  /// Configure your browser or app to use the proxy address. For HTTPS
  /// mode you must install the CA certificate:
  ///
  ///   mozzy proxy --export-cert > mozzy-ca.pem
  ///
  /// Then install mozzy-ca.pem in your system's trusted certificates.
  Proxy(ProxyArgs),
}

#[derive(Args)]
struct ProxyArgs {
  /// Port to listen on
  #[arg(default_value_t = 8888)]
  port: u16,

  /// Enable HTTPS interception (requires CA certificate installation)
  #[arg(long)]
  https: bool,

  /// Show detailed request/response information
  #[arg(short, long)]
  verbose: bool,

  /// Record all traffic to a HAR file, written on exit
  #[arg(short, long, value_name = "FILE")]
  record: Option<PathBuf>,

  /// Inject a header into every request (repeatable, "Key: Value")
  #[arg(short = 'H', long = "inject-header", value_name = "HEADER")]
  inject_headers: Vec<String>,

  /// Only log requests matching domain (substring match)
  #[arg(long, value_name = "DOMAIN")]
  filter_domain: Option<String>,

  /// Only log specific methods (comma-separated: GET,POST)
  #[arg(long, value_name = "METHODS")]
  filter_methods: Option<String>,

  /// Only log requests with 4xx/5xx status codes
  #[arg(long)]
  errors_only: bool,

  /// Export the CA certificate in PEM format and exit
  #[arg(long)]
  export_cert: bool,

  /// Show CA certificate information and exit
  #[arg(long)]
  cert_info: bool,
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
    .init();

  let cli = Cli::parse();
  let result = match cli.command {
    Command::Proxy(args) => run_proxy(args).await,
  };
  if let Err(e) = result {
    eprintln!("{}", format!("Error: {}", e).red());
    std::process::exit(1);
  }
}

async fn run_proxy(args: ProxyArgs) -> Result<()> {
  if args.export_cert {
    let ca = CertificateAuthority::load_or_generate()?;
    print!("{}", ca.export_pem()?);
    return Ok(());
  }
  if args.cert_info {
    let ca = CertificateAuthority::load_or_generate()?;
    println!("{}", ca.describe()?);
    return Ok(());
  }

  let config = ProxyConfig {
    port: args.port,
    https: args.https,
    verbose: args.verbose,
    inject_headers: parse_inject_headers(&args.inject_headers),
    filter: CaptureFilter {
      domain: args.filter_domain.clone(),
      methods: args
        .filter_methods
        .as_deref()
        .map(split_methods)
        .unwrap_or_default(),
      errors_only: args.errors_only,
    },
  };

  let log = Arc::new(CaptureLog::new());
  let server = ProxyServer::new(config, log.clone())?;

  tokio::select! {
    result = server.run() => result?,
    _ = tokio::signal::ctrl_c() => {
      println!();
      if let Some(path) = &args.record {
        export_har(&log, path)?;
        println!(
          "{}",
          format!("✓ Recorded {} requests to {}", log.len(), path.display()).green()
        );
      }
    }
  }
  Ok(())
}

/// Parse repeated "Key: Value" flags, skipping anything unparseable.
fn parse_inject_headers(raw: &[String]) -> Vec<(HeaderName, HeaderValue)> {
  raw
    .iter()
    .filter_map(|header| {
      let (name, value) = header.split_once(':')?;
      let name = HeaderName::from_bytes(name.trim().as_bytes()).ok()?;
      let value = HeaderValue::from_str(value.trim()).ok()?;
      Some((name, value))
    })
    .collect()
}

/// Split "GET,POST,PUT" into upper-case method names.
fn split_methods(raw: &str) -> Vec<String> {
  raw
    .split(',')
    .map(|m| m.trim().to_ascii_uppercase())
    .filter(|m| !m.is_empty())
    .collect()
}
