#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! JSON-over-HTTP client for `ModKit` with settings that can be tuned at runtime
//!
//! This crate provides [`ApiClient`], a long-lived client with:
//! - JSON request/response helpers (`Content-Type`/`Accept: application/json`)
//! - Base-URL joining or full-URL targets (`http://` assumed when no scheme is given)
//! - Runtime setters for timeouts, proxy, TLS verification, keep-alive and compression
//! - Automatic cookie handling through a replaceable [`CookieStore`]
//! - Status validation: anything outside `[200, 300)` becomes [`HttpError::BadResponse`]
//!
//! Every call is a single attempt; nothing is retried.
//!
//! # Certificate verification
//!
//! Server certificates are **not** verified unless `https_verify` is enabled
//! in [`ClientConfig`] or via [`ApiClient::set_https_verify`]. A warning is
//! logged whenever a client runs without verification.
//!
//! # Example
//!
//! ```ignore
//! use modkit_requests::ApiClient;
//! use std::time::Duration;
//!
//! let client = ApiClient::builder()
//!     .base_url("https://api.example.com/v1")
//!     .token("secret")
//!     .https_verify(true)
//!     .build()?;
//!
//! client.set_timeout(Duration::from_secs(5))?;
//! client.set_gzip(false);
//!
//! let (status, items): (_, Vec<Item>) = client.get("/items").await?;
//! ```

mod client;
mod config;
mod cookie;
mod error;
pub mod proxy;
mod request;
mod response;
pub mod tls;
pub mod transport;

pub use client::{ApiClient, ApiClientBuilder, ClientOptions};
pub use config::{
    ClientConfig, DEFAULT_TIMEOUT, DEFAULT_USER_AGENT, DialerConfig, MIME_JSON,
    STANDALONE_TIMEOUT, TOKEN_HEADER, ValidationMode,
};
pub use cookie::{CookieStore, Jar};
pub use error::{HttpError, InvalidUriKind};
pub use proxy::{ProxyChooser, ProxyEndpoint, ProxyError};
pub use request::{
    RequestBuilder, RequestDescriptor, encode_json, normalize_method, normalize_target, url_join,
};
pub use response::{RawResponse, decode, is_bad_response};
pub use transport::{HyperTransport, ResponseBody, Transport, TransportConfig};
