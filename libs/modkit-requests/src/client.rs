use crate::config::{ClientConfig, DialerConfig, MIME_JSON, TOKEN_HEADER, ValidationMode};
use crate::cookie::{CookieStore, Jar};
use crate::error::HttpError;
use crate::proxy::{self, ProxyChooser};
use crate::request::{RequestBuilder, RequestDescriptor, normalize_target};
use crate::response::{RawResponse, is_bad_response, read_body};
use crate::transport::{HyperTransport, Transport, TransportConfig};
use arc_swap::{ArcSwap, ArcSwapOption};
use http::header::{ACCEPT, CONTENT_TYPE, COOKIE, HeaderName, HeaderValue, SET_COOKIE, USER_AGENT};
use http::{Request, StatusCode};
use http_body_util::Full;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// Per-request options, published as one snapshot.
#[derive(Clone)]
pub struct ClientOptions {
    /// `None` sends no User-Agent header
    pub user_agent: Option<String>,
    /// `None` sends no `x-token` header
    pub token: Option<String>,
    /// Whole-request deadline; zero means no limit
    pub timeout: Duration,
    pub cookie_jar: Arc<dyn CookieStore>,
}

impl std::fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientOptions")
            .field("user_agent", &self.user_agent)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// JSON-over-HTTP client whose settings can be changed while in use.
///
/// Setters serialize on one per-client lock and publish copy-on-write
/// snapshots; requests read the latest snapshots without locking. A request
/// racing with a setter sees either the old or the new value of each field.
///
/// The transport configuration is created on first use (first request or
/// first transport setter) and is never re-derived from defaults afterwards.
///
/// # Example
///
/// ```ignore
/// let client = ApiClient::builder()
///     .base_url("https://api.example.com/v1")
///     .token("secret")
///     .build()?;
///
/// client.set_timeout(Duration::from_secs(5))?;
/// let (status, items): (_, Vec<Item>) = client.get("/items").await?;
/// ```
pub struct ApiClient {
    base_url: Option<String>,
    validation: ValidationMode,
    dialer: Arc<DialerConfig>,
    initial_tls_verify: bool,
    transport: Arc<dyn Transport>,
    lock: Mutex<()>,
    options: ArcSwap<ClientOptions>,
    transport_config: ArcSwapOption<TransportConfig>,
}

impl ApiClient {
    /// Build a client with the hyper transport.
    ///
    /// # Errors
    ///
    /// Same as [`ApiClientBuilder::build`].
    pub fn new(config: ClientConfig) -> Result<Self, HttpError> {
        ApiClientBuilder::with_config(config).build()
    }

    #[must_use]
    pub fn builder() -> ApiClientBuilder {
        ApiClientBuilder::new()
    }

    #[must_use]
    pub fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }

    #[must_use]
    pub fn validation(&self) -> ValidationMode {
        self.validation
    }

    /// Current per-request options.
    #[must_use]
    pub fn options(&self) -> Arc<ClientOptions> {
        self.options.load_full()
    }

    /// Current transport configuration, creating it if needed.
    #[must_use]
    pub fn transport_config(&self) -> Arc<TransportConfig> {
        if let Some(config) = self.transport_config.load_full() {
            return config;
        }
        let _guard = self.lock.lock();
        self.init_transport_locked()
    }

    #[cfg(test)]
    pub(crate) fn is_transport_initialized(&self) -> bool {
        self.transport_config.load().is_some()
    }

    /// Must be called with `self.lock` held.
    fn init_transport_locked(&self) -> Arc<TransportConfig> {
        if let Some(config) = self.transport_config.load_full() {
            return config;
        }
        let proxy = match &self.dialer.proxy_addr {
            Some(addr) => ProxyChooser::Configured(addr.clone()),
            None => ProxyChooser::Environment,
        };
        let mut config = TransportConfig::with_proxy(proxy);
        config.tls_verify = self.initial_tls_verify;
        let config = Arc::new(config);
        self.transport_config.store(Some(Arc::clone(&config)));
        tracing::debug!(tls_verify = config.tls_verify, "transport configuration initialized");
        config
    }

    fn update_transport(&self, change: impl FnOnce(&mut TransportConfig)) {
        let _guard = self.lock.lock();
        let mut next = (*self.init_transport_locked()).clone();
        change(&mut next);
        self.transport_config.store(Some(Arc::new(next)));
    }

    fn update_options(&self, change: impl FnOnce(&mut ClientOptions)) {
        let _guard = self.lock.lock();
        let mut next = (**self.options.load()).clone();
        change(&mut next);
        self.options.store(Arc::new(next));
    }

    fn check_timeout(&self, setting: &'static str, value: Duration) -> Result<(), HttpError> {
        if value.is_zero() && self.validation.is_strict() {
            return Err(HttpError::InvalidConfiguration {
                setting,
                reason: "must be greater than zero".to_owned(),
            });
        }
        Ok(())
    }

    /// Empty string disables the header.
    pub fn set_user_agent(&self, user_agent: impl Into<String>) {
        let user_agent = Some(user_agent.into()).filter(|ua| !ua.is_empty());
        self.update_options(|o| o.user_agent = user_agent);
    }

    /// Empty string disables the header.
    pub fn set_token(&self, token: impl Into<String>) {
        let token = Some(token.into()).filter(|t| !t.is_empty());
        self.update_options(|o| o.token = token);
    }

    /// Route requests through `addr` (`host:port` or URL).
    ///
    /// An empty or unparsable address is not an error: the environment proxy
    /// settings are used instead and a warning is logged.
    pub fn set_proxy(&self, addr: &str) {
        let chooser = match proxy::resolve(addr) {
            Ok(endpoint) => ProxyChooser::Fixed(endpoint),
            Err(err) => {
                tracing::warn!(proxy = %addr, error = %err, "unusable proxy address; using environment proxy settings");
                ProxyChooser::Environment
            }
        };
        self.update_transport(|t| t.proxy = chooser);
    }

    pub fn set_cookie_jar(&self, jar: Arc<dyn CookieStore>) {
        self.update_options(|o| o.cookie_jar = jar);
    }

    /// Replace the cookie jar with a new empty [`Jar`].
    pub fn reset_cookie_jar(&self) {
        self.set_cookie_jar(Arc::new(Jar::new()));
    }

    /// `true` trusts the OS root store; `false` accepts any certificate.
    pub fn set_https_verify(&self, verify: bool) {
        if !verify {
            tracing::warn!("HTTPS certificate verification disabled for this client");
        }
        self.update_transport(|t| t.tls_verify = verify);
    }

    pub fn set_keep_alive(&self, keep_alive: bool) {
        self.update_transport(|t| t.keep_alive = keep_alive);
    }

    pub fn set_gzip(&self, gzip: bool) {
        self.update_transport(|t| t.compression = gzip);
    }

    /// # Errors
    ///
    /// Zero is rejected in strict mode.
    pub fn set_response_header_timeout(&self, timeout: Duration) -> Result<(), HttpError> {
        self.check_timeout("response_header_timeout", timeout)?;
        self.update_transport(|t| t.response_header_timeout = timeout);
        Ok(())
    }

    /// # Errors
    ///
    /// Zero is rejected in strict mode.
    pub fn set_tls_handshake_timeout(&self, timeout: Duration) -> Result<(), HttpError> {
        self.check_timeout("tls_handshake_timeout", timeout)?;
        self.update_transport(|t| t.tls_handshake_timeout = timeout);
        Ok(())
    }

    /// # Errors
    ///
    /// Zero is rejected in strict mode.
    pub fn set_timeout(&self, timeout: Duration) -> Result<(), HttpError> {
        self.check_timeout("timeout", timeout)?;
        self.update_options(|o| o.timeout = timeout);
        Ok(())
    }

    /// Start a fluent request.
    #[must_use]
    pub fn request_builder(&self, method: &str, path: &str) -> RequestBuilder<'_> {
        RequestBuilder::new(self, method, path)
    }

    /// Validate and encode a request without sending it.
    ///
    /// # Errors
    ///
    /// See [`RequestDescriptor::build`].
    pub fn build_request<B: Serialize + ?Sized>(
        &self,
        method: &str,
        path: &str,
        body: Option<&B>,
    ) -> Result<RequestDescriptor, HttpError> {
        RequestDescriptor::build(method, self.base_url(), path, body, self.validation)
    }

    /// Send `body` as JSON and decode the JSON response into `T`.
    ///
    /// # Errors
    ///
    /// Validation, encoding, transport, `BadResponse` and `JsonDecoding` errors.
    pub async fn request<B, T>(
        &self,
        method: &str,
        path: &str,
        body: Option<&B>,
    ) -> Result<(StatusCode, T), HttpError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let descriptor = self.build_request(method, path, body)?;
        let response = self.execute(descriptor).await?;
        let value = response.json()?;
        Ok((response.status, value))
    }

    /// Like [`request`](ApiClient::request) but ignores the response body.
    ///
    /// # Errors
    ///
    /// Validation, encoding, transport and `BadResponse` errors.
    pub async fn request_status<B>(
        &self,
        method: &str,
        path: &str,
        body: Option<&B>,
    ) -> Result<StatusCode, HttpError>
    where
        B: Serialize + ?Sized,
    {
        let descriptor = self.build_request(method, path, body)?;
        Ok(self.execute(descriptor).await?.status)
    }

    /// # Errors
    ///
    /// See [`request`](ApiClient::request).
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<(StatusCode, T), HttpError> {
        self.request::<(), T>("GET", path, None).await
    }

    /// # Errors
    ///
    /// See [`request`](ApiClient::request).
    pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<(StatusCode, T), HttpError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.request("POST", path, Some(body)).await
    }

    /// # Errors
    ///
    /// See [`request`](ApiClient::request).
    pub async fn put<B, T>(&self, path: &str, body: &B) -> Result<(StatusCode, T), HttpError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.request("PUT", path, Some(body)).await
    }

    /// # Errors
    ///
    /// See [`request_status`](ApiClient::request_status).
    pub async fn delete(&self, path: &str) -> Result<StatusCode, HttpError> {
        self.request_status::<()>("DELETE", path, None).await
    }

    /// Send one request and read the whole response.
    ///
    /// Standard headers, cookies and the timeout come from the configuration
    /// current at the moment of the call. Nothing is retried.
    ///
    /// # Errors
    ///
    /// - transport failures (`Transport`, `Tls`, `Timeout`, `ResponseHeaderTimeout`)
    /// - `BodyRead` when the body stream breaks after the status arrived
    /// - `BadResponse` for statuses outside `[200, 300)`
    pub async fn execute(&self, descriptor: RequestDescriptor) -> Result<RawResponse, HttpError> {
        let transport_config = self.transport_config();
        let options = self.options.load_full();

        let body_text = descriptor.body_text();
        let RequestDescriptor {
            method,
            url,
            path,
            body,
            headers,
        } = descriptor;

        let mut request = Request::builder()
            .method(method.clone())
            .uri(url.clone())
            .body(Full::new(body.unwrap_or_default()))?;

        let request_headers = request.headers_mut();
        request_headers.insert(CONTENT_TYPE, HeaderValue::from_static(MIME_JSON));
        request_headers.insert(ACCEPT, HeaderValue::from_static(MIME_JSON));
        if let Some(user_agent) = &options.user_agent {
            request_headers.insert(USER_AGENT, HeaderValue::from_str(user_agent)?);
        }
        if let Some(token) = &options.token {
            request_headers.insert(
                HeaderName::from_static(TOKEN_HEADER),
                HeaderValue::from_str(token)?,
            );
        }
        if let Some(cookies) = options.cookie_jar.cookies(&url) {
            request_headers.insert(COOKIE, cookies);
        }
        request_headers.extend(headers);

        tracing::debug!(method = %method, url = %url, "sending request");

        let exchange = async {
            let response = self.transport.send(request, &transport_config).await?;
            let (parts, body) = response.into_parts();
            let bytes = read_body(parts.status, body).await?;
            Ok::<_, HttpError>((parts, bytes))
        };
        let (parts, bytes) = if options.timeout.is_zero() {
            exchange.await?
        } else {
            tokio::time::timeout(options.timeout, exchange)
                .await
                .map_err(|_| HttpError::Timeout(options.timeout))??
        };

        options
            .cookie_jar
            .set_cookies(&mut parts.headers.get_all(SET_COOKIE).iter(), &url);

        let status = parts.status;
        tracing::debug!(method = %method, url = %url, status = status.as_u16(), "received response");

        if is_bad_response(status.as_u16()) {
            return Err(HttpError::BadResponse {
                method,
                path,
                body: body_text,
                status_text: status.canonical_reason().unwrap_or("Unknown").to_owned(),
                status,
                response_body: bytes,
            });
        }

        Ok(RawResponse {
            status,
            headers: parts.headers,
            body: bytes,
        })
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .field("validation", &self.validation)
            .field("options", &self.options.load_full())
            .field("transport_config", &self.transport_config.load_full())
            .finish_non_exhaustive()
    }
}

/// Builder for [`ApiClient`].
#[must_use]
pub struct ApiClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    cookie_jar: Option<Arc<dyn CookieStore>>,
}

impl ApiClientBuilder {
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            config,
            transport: None,
            cookie_jar: None,
        }
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.config.base_url = Some(base_url.into());
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.token = Some(token.into());
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    pub fn https_verify(mut self, verify: bool) -> Self {
        self.config.https_verify = verify;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn validation(mut self, mode: ValidationMode) -> Self {
        self.config.validation = mode;
        self
    }

    /// Proxy address resolved for every new connection.
    pub fn proxy(mut self, addr: impl Into<String>) -> Self {
        self.config.dialer.proxy_addr = Some(addr.into());
        self
    }

    pub fn local_addrs(mut self, addrs: Vec<IpAddr>) -> Self {
        self.config.dialer.local_addrs = addrs;
        self
    }

    pub fn cookie_jar(mut self, jar: Arc<dyn CookieStore>) -> Self {
        self.cookie_jar = Some(jar);
        self
    }

    /// Replace the hyper transport (in-memory transports for tests).
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// # Errors
    ///
    /// - `InvalidConfiguration` for a zero timeout in strict mode
    /// - `UnsupportedProtocol`/`InvalidUri` for an unusable base URL
    pub fn build(self) -> Result<ApiClient, HttpError> {
        let config = self.config;

        if config.timeout.is_zero() && config.validation.is_strict() {
            return Err(HttpError::InvalidConfiguration {
                setting: "timeout",
                reason: "must be greater than zero".to_owned(),
            });
        }
        if let Some(base) = &config.base_url {
            normalize_target(base)?;
        }
        if !config.https_verify {
            tracing::warn!("HTTPS certificate verification disabled (default); enable https_verify to trust only valid certificates");
        }

        let dialer = Arc::new(config.dialer);
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(HyperTransport::new(Arc::clone(&dialer))));
        let options = ClientOptions {
            user_agent: Some(config.user_agent).filter(|ua| !ua.is_empty()),
            token: config.token.filter(|t| !t.is_empty()),
            timeout: config.timeout,
            cookie_jar: self.cookie_jar.unwrap_or_else(|| Arc::new(Jar::new())),
        };

        Ok(ApiClient {
            base_url: config.base_url,
            validation: config.validation,
            dialer,
            initial_tls_verify: config.https_verify,
            transport,
            lock: Mutex::new(()),
            options: ArcSwap::from_pointee(options),
            transport_config: ArcSwapOption::empty(),
        })
    }
}

impl Default for ApiClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
