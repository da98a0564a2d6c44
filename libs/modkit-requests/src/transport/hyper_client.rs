use bytes::Bytes;
use http::header::{CONNECTION, PROXY_AUTHORIZATION};
use http::{HeaderValue, Request, Response};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tower::util::BoxCloneService;
use tower::{ServiceBuilder, ServiceExt};
use tower_http::decompression::DecompressionLayer;
use tower_http::follow_redirect::FollowRedirectLayer;

use super::connector::{HandshakeTimeout, ProxyConnector};
use super::{ResponseBody, Transport, TransportConfig};
use crate::config::DialerConfig;
use crate::error::HttpError;
use crate::proxy::ProxyChooser;
use crate::tls;

type InnerService = BoxCloneService<Request<Full<Bytes>>, Response<ResponseBody>, HttpError>;

/// The subset of [`TransportConfig`] baked into a built hyper client.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ConnectionSettings {
    proxy: ProxyChooser,
    tls_verify: bool,
    tls_handshake_timeout: Duration,
    keep_alive: bool,
    max_idle_connections: usize,
    idle_connection_timeout: Duration,
}

impl From<&TransportConfig> for ConnectionSettings {
    fn from(config: &TransportConfig) -> Self {
        Self {
            proxy: config.proxy.clone(),
            tls_verify: config.tls_verify,
            tls_handshake_timeout: config.tls_handshake_timeout,
            keep_alive: config.keep_alive,
            max_idle_connections: config.max_idle_connections,
            idle_connection_timeout: config.idle_connection_timeout,
        }
    }
}

struct Stack {
    settings: ConnectionSettings,
    decompressing: InnerService,
    plain: InnerService,
}

/// Default [`Transport`]: a pooled hyper client over rustls.
///
/// The client and its pool are built on first use and rebuilt only when a
/// connection-affecting setting changes; toggling compression switches
/// between two stacks sharing one pool.
pub struct HyperTransport {
    dialer: Arc<DialerConfig>,
    stack: Mutex<Option<Stack>>,
}

impl HyperTransport {
    #[must_use]
    pub fn new(dialer: Arc<DialerConfig>) -> Self {
        Self {
            dialer,
            stack: Mutex::new(None),
        }
    }

    fn service_for(&self, config: &TransportConfig) -> Result<InnerService, HttpError> {
        let settings = ConnectionSettings::from(config);
        let mut slot = self.stack.lock();

        let stack = match slot.take() {
            Some(stack) if stack.settings == settings => stack,
            previous => {
                if previous.is_some() {
                    tracing::debug!("connection settings changed; rebuilding HTTP client");
                }
                build_stack(settings, &self.dialer)?
            }
        };

        let service = if config.compression {
            stack.decompressing.clone()
        } else {
            stack.plain.clone()
        };
        *slot = Some(stack);
        Ok(service)
    }
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperTransport")
            .field("dialer", &self.dialer)
            .field("built", &self.stack.lock().is_some())
            .finish()
    }
}

fn build_stack(settings: ConnectionSettings, dialer: &Arc<DialerConfig>) -> Result<Stack, HttpError> {
    let tls_config = tls::client_config(settings.tls_verify)?;
    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http()
        .enable_http1()
        .wrap_connector(ProxyConnector::new(settings.proxy.clone(), Arc::clone(dialer)));
    let connector = HandshakeTimeout::new(https, settings.tls_handshake_timeout);

    let mut client_builder = Client::builder(TokioExecutor::new());

    // pool_timer is required for pool_idle_timeout to take effect
    client_builder.pool_timer(TokioTimer::new()).pool_max_idle_per_host(
        if settings.keep_alive {
            settings.max_idle_connections
        } else {
            0
        },
    );
    if !settings.idle_connection_timeout.is_zero() {
        client_builder.pool_idle_timeout(settings.idle_connection_timeout);
    }

    let hyper_client = client_builder.build::<_, Full<Bytes>>(connector);

    let decompressing = ServiceBuilder::new()
        .layer(DecompressionLayer::new())
        .layer(FollowRedirectLayer::new())
        .service(hyper_client.clone())
        .map_response(box_response)
        .map_err(classify_client_error)
        .boxed_clone();

    let plain = ServiceBuilder::new()
        .layer(FollowRedirectLayer::new())
        .service(hyper_client)
        .map_response(box_response)
        .map_err(classify_client_error)
        .boxed_clone();

    Ok(Stack {
        settings,
        decompressing,
        plain,
    })
}

/// Box the (possibly decompressing) body into [`ResponseBody`].
fn box_response<B>(response: Response<B>) -> Response<ResponseBody>
where
    B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (parts, body) = response.into_parts();
    let boxed_body: ResponseBody = body.map_err(Into::into).boxed();
    Response::from_parts(parts, boxed_body)
}

/// Split hyper client failures into TLS and other transport errors.
fn classify_client_error(err: hyper_util::client::legacy::Error) -> HttpError {
    if caused_by_tls(&err) {
        HttpError::Tls(Box::new(err))
    } else {
        HttpError::from(err)
    }
}

/// Walk the cause chain looking for a `rustls::Error`.
///
/// hyper-rustls nests io errors inside io errors, and `io::Error::source`
/// skips the wrapped error, so io links are followed through `get_ref`.
fn caused_by_tls(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.is::<rustls::Error>() {
            return true;
        }
        current = match e.downcast_ref::<std::io::Error>() {
            Some(io) => io
                .get_ref()
                .map(|inner| inner as &(dyn std::error::Error + 'static)),
            None => e.source(),
        };
    }
    false
}

#[async_trait::async_trait]
impl Transport for HyperTransport {
    async fn send(
        &self,
        mut request: Request<Full<Bytes>>,
        config: &TransportConfig,
    ) -> Result<Response<ResponseBody>, HttpError> {
        if !config.keep_alive {
            request
                .headers_mut()
                .insert(CONNECTION, HeaderValue::from_static("close"));
        }

        // Forwarded plain-http requests carry proxy credentials themselves;
        // tunnels send them on CONNECT.
        if request.uri().scheme() == Some(&http::uri::Scheme::HTTP)
            && !request.headers().contains_key(PROXY_AUTHORIZATION)
            && let Some(auth) = config
                .proxy
                .choose(request.uri())
                .and_then(|target| target.authorization)
        {
            request.headers_mut().insert(PROXY_AUTHORIZATION, auth);
        }

        let service = self.service_for(config)?;
        let call = service.oneshot(request);

        let limit = config.response_header_timeout;
        if limit.is_zero() {
            return call.await;
        }
        tokio::time::timeout(limit, call)
            .await
            .map_err(|_| HttpError::ResponseHeaderTimeout(limit))?
    }
}
