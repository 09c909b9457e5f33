//! Intercepting HTTP/HTTPS proxy with an on-the-fly certificate authority
//!
//! This crate is the core of the mozzy proxy: a dual-mode engine that
//! forwards plain HTTP and, for `CONNECT`, terminates TLS against the
//! client with a per-host leaf certificate minted by a persisted local CA,
//! re-establishes verified TLS to the origin, and records every
//! transaction in a bounded capture log exportable as HAR 1.2.
//!
//! # Example
//!
//! ```no_run
//! use mozzy_proxy::{CaptureLog, ProxyConfig, ProxyServer};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let config = ProxyConfig {
//!     port: 8888,
//!     https: true,
//!     ..Default::default()
//!   };
//!   let log = Arc::new(CaptureLog::new());
//!   let server = ProxyServer::new(config, log)?;
//!   server.run().await?;
//!   Ok(())
//! }
//! ```

mod ca;
mod capture;
mod cert_cache;
mod errors;
mod filter;
mod har;
mod http1;
mod origin;
mod server;
mod tunnel;

pub use ca::{CertificateAuthority, MintedLeaf};
pub use capture::{CaptureLog, Transaction, CAPTURE_CAPACITY};
pub use cert_cache::{LeafCache, ServerLeaf};
pub use errors::{Error, Result};
pub use filter::CaptureFilter;
pub use har::{build_har, export_har, status_text, Har};
pub use origin::{Origin, OutboundRequest, RequestBody, UpstreamResponse};
pub use server::{ProxyConfig, ProxyServer};
