//! Connection establishment: local address choice, proxy routing and the
//! overall connect deadline.

use http::{HeaderValue, Uri};
use hyper_util::client::legacy::connect::{Connected, Connection, HttpConnector};
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tower::{Service, ServiceExt};

use crate::config::DialerConfig;
use crate::proxy::ProxyChooser;

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T, BoxError>> + Send>>;

const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);
const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

/// Connection setup failures raised by this crate's connectors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConnectError {
    #[error("destination '{0}' has no host")]
    MissingHost(Uri),

    #[error("proxy refused CONNECT to {target}: {status_line}")]
    TunnelRejected { target: String, status_line: String },

    #[error("proxy closed the connection during CONNECT to {0}")]
    TunnelClosed(String),

    #[error("proxy CONNECT response exceeds 8 KiB")]
    TunnelResponseTooLarge,

    #[error("connection not established within {0:?}")]
    HandshakeTimeout(Duration),
}

/// TCP connector that routes through the proxy picked by a [`ProxyChooser`].
///
/// Plain `http` destinations behind a proxy are sent in absolute form over the
/// proxy connection; `https` destinations get a `CONNECT` tunnel that the TLS
/// layer then runs over.
#[derive(Clone)]
pub struct ProxyConnector {
    http: HttpConnector,
    chooser: ProxyChooser,
    dialer: Arc<DialerConfig>,
}

impl ProxyConnector {
    #[must_use]
    pub fn new(chooser: ProxyChooser, dialer: Arc<DialerConfig>) -> Self {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(Some(DIAL_TIMEOUT));
        http.set_keepalive(Some(TCP_KEEPALIVE));
        http.set_nodelay(true);
        Self {
            http,
            chooser,
            dialer,
        }
    }
}

impl std::fmt::Debug for ProxyConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConnector")
            .field("chooser", &self.chooser)
            .field("dialer", &self.dialer)
            .finish_non_exhaustive()
    }
}

impl Service<Uri> for ProxyConnector {
    type Response = ProxiedStream;
    type Error = BoxError;
    type Future = BoxFuture<ProxiedStream>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let mut tcp_connector = self.http.clone();
        if let Some(local) = self.dialer.pick_local_addr() {
            tcp_connector.set_local_address(Some(local));
        }
        let proxy = self.chooser.choose(&dst);

        Box::pin(async move {
            let Some(proxy) = proxy else {
                let io = tcp_connector.oneshot(dst).await?;
                return Ok(ProxiedStream::direct(io));
            };

            tracing::debug!(destination = %dst, proxy = %proxy.uri, "connecting via proxy");
            let io = tcp_connector.oneshot(proxy.uri).await?;

            if dst.scheme() == Some(&http::uri::Scheme::HTTPS) {
                let mut tcp = io.into_inner();
                establish_tunnel(&mut tcp, &dst, proxy.authorization.as_ref()).await?;
                Ok(ProxiedStream::direct(TokioIo::new(tcp)))
            } else {
                Ok(ProxiedStream::forwarding(io))
            }
        })
    }
}

/// Issue `CONNECT host:port` on `stream` and wait for a 2xx answer.
pub(crate) async fn establish_tunnel<S>(
    stream: &mut S,
    dst: &Uri,
    authorization: Option<&HeaderValue>,
) -> Result<(), ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let host = dst
        .host()
        .ok_or_else(|| ConnectError::MissingHost(dst.clone()))?;
    let port = dst.port_u16().unwrap_or(443);
    let target = format!("{host}:{port}");

    let mut head = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some(auth) = authorization.and_then(|v| v.to_str().ok()) {
        head.push_str("Proxy-Authorization: ");
        head.push_str(auth);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");

    let closed = |_: std::io::Error| ConnectError::TunnelClosed(target.clone());
    stream.write_all(head.as_bytes()).await.map_err(closed)?;
    stream.flush().await.map_err(closed)?;

    let mut response = Vec::with_capacity(256);
    let mut chunk = [0u8; 512];
    while !response.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await.map_err(closed)?;
        if n == 0 {
            return Err(ConnectError::TunnelClosed(target));
        }
        response.extend_from_slice(&chunk[..n]);
        if response.len() > MAX_CONNECT_RESPONSE {
            return Err(ConnectError::TunnelResponseTooLarge);
        }
    }

    let text = String::from_utf8_lossy(&response);
    let status_line = text.lines().next().unwrap_or_default().trim().to_owned();
    let accepted = status_line
        .split_whitespace()
        .nth(1)
        .is_some_and(|code| code.len() == 3 && code.starts_with('2'));
    if !accepted {
        return Err(ConnectError::TunnelRejected {
            target,
            status_line,
        });
    }
    Ok(())
}

/// TCP stream that remembers whether requests on it must use absolute form.
#[derive(Debug)]
pub struct ProxiedStream {
    inner: TokioIo<TcpStream>,
    forwarding: bool,
}

impl ProxiedStream {
    fn direct(inner: TokioIo<TcpStream>) -> Self {
        Self {
            inner,
            forwarding: false,
        }
    }

    fn forwarding(inner: TokioIo<TcpStream>) -> Self {
        Self {
            inner,
            forwarding: true,
        }
    }
}

impl Connection for ProxiedStream {
    fn connected(&self) -> Connected {
        let connected = self.inner.connected();
        if self.forwarding {
            connected.proxy(true)
        } else {
            connected
        }
    }
}

impl hyper::rt::Read for ProxiedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<std::io::Result<()>> {
        hyper::rt::Read::poll_read(Pin::new(&mut self.inner), cx, buf)
    }
}

impl hyper::rt::Write for ProxiedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        hyper::rt::Write::poll_write(Pin::new(&mut self.inner), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        hyper::rt::Write::poll_flush(Pin::new(&mut self.inner), cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        hyper::rt::Write::poll_shutdown(Pin::new(&mut self.inner), cx)
    }
}

/// Bounds the whole connection setup (dial, tunnel and TLS) of the wrapped
/// connector. A zero deadline disables the bound.
#[derive(Debug, Clone)]
pub struct HandshakeTimeout<C> {
    inner: C,
    timeout: Duration,
}

impl<C> HandshakeTimeout<C> {
    pub fn new(inner: C, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

impl<C> Service<Uri> for HandshakeTimeout<C>
where
    C: Service<Uri> + Send,
    C::Response: Send + 'static,
    C::Error: Into<BoxError>,
    C::Future: Send + 'static,
{
    type Response = C::Response;
    type Error = BoxError;
    type Future = BoxFuture<C::Response>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let connecting = self.inner.call(dst);
        let timeout = self.timeout;
        Box::pin(async move {
            if timeout.is_zero() {
                return connecting.await.map_err(Into::into);
            }
            match tokio::time::timeout(timeout, connecting).await {
                Ok(result) => result.map_err(Into::into),
                Err(_) => Err(ConnectError::HandshakeTimeout(timeout).into()),
            }
        })
    }
}
