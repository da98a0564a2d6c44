//! Transport configuration and the pluggable transport seam.

mod connector;
mod hyper_client;

pub use self::connector::{ProxiedStream, ProxyConnector};
pub use self::hyper_client::HyperTransport;

use crate::error::HttpError;
use crate::proxy::ProxyChooser;
use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::Full;
use std::time::Duration;

/// Type-erased response body; may be a raw or a decompressed stream.
pub type ResponseBody =
    http_body_util::combinators::BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;

/// Connection-level settings of one client.
///
/// Created once per client with the defaults below and then changed field by
/// field through the client's setters. Zero durations mean "no limit".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub proxy: ProxyChooser,

    /// Verify server certificates against the OS trust store
    pub tls_verify: bool,

    /// Deadline for establishing a connection (TCP, proxy tunnel and TLS)
    pub tls_handshake_timeout: Duration,

    /// Advertise `Accept-Encoding` and transparently decompress responses
    pub compression: bool,

    /// Reuse connections; when off every request carries `Connection: close`
    pub keep_alive: bool,

    pub max_idle_connections: usize,

    pub idle_connection_timeout: Duration,

    /// Deadline for receiving the response head after the request was sent
    pub response_header_timeout: Duration,

    /// Retained for configuration parity; HTTP/1 requests are sent without
    /// waiting for `100 Continue`.
    pub expect_continue_timeout: Duration,
}

impl TransportConfig {
    /// Defaults with the given proxy strategy.
    #[must_use]
    pub fn with_proxy(proxy: ProxyChooser) -> Self {
        Self {
            proxy,
            tls_verify: false,
            tls_handshake_timeout: Duration::from_secs(10),
            compression: true,
            keep_alive: true,
            max_idle_connections: 100,
            idle_connection_timeout: Duration::from_secs(90),
            response_header_timeout: Duration::from_secs(10),
            expect_continue_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::with_proxy(ProxyChooser::Environment)
    }
}

/// Sends one fully built request.
///
/// Implementations must not retry; the response is returned for every status.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        request: Request<Full<Bytes>>,
        config: &TransportConfig,
    ) -> Result<Response<ResponseBody>, HttpError>;
}
