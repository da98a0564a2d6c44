//! Proxy address resolution and per-request proxy selection.
//!
//! [`resolve`] turns a configured address (`host:port` or a full URL) into a
//! [`ProxyEndpoint`]. [`ProxyChooser`] is consulted by the connector for every
//! new connection; whenever the configured address is unusable it defers to the
//! environment (`HTTP_PROXY`, `HTTPS_PROXY`, `NO_PROXY`) instead of failing the
//! request.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use http::{HeaderValue, Uri};
use std::net::IpAddr;
use std::sync::OnceLock;
use thiserror::Error;

/// Proxy resolution failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProxyError {
    /// The address string was empty
    #[error("proxy addr is empty")]
    EmptyAddress,

    /// The address is neither `host:port` nor a valid URL
    #[error("invalid proxy addr '{addr}': {source}")]
    Parse {
        addr: String,
        #[source]
        source: url::ParseError,
    },

    /// The address parsed as a URL but has no host to connect to
    #[error("proxy addr '{0}' has no host")]
    MissingHost(String),

    /// Only plain `http://` proxies can be dialed
    #[error("proxy scheme '{0}' is not supported")]
    UnsupportedScheme(String),
}

/// A resolved proxy address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyEndpoint {
    /// Bare `host:port`, dialed as an HTTP proxy
    HostPort { host: String, port: u16 },
    /// Fully parsed URL, possibly carrying credentials
    Url(url::Url),
}

/// Where the connector should send a connection, plus the credentials to
/// present to the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub uri: Uri,
    pub authorization: Option<HeaderValue>,
}

/// Resolve a proxy address string.
///
/// # Errors
///
/// - [`ProxyError::EmptyAddress`] for `""`
/// - [`ProxyError::Parse`] when the string is neither `host:port` nor a URL
/// - [`ProxyError::MissingHost`] for URLs without a host
pub fn resolve(addr: &str) -> Result<ProxyEndpoint, ProxyError> {
    if addr.is_empty() {
        return Err(ProxyError::EmptyAddress);
    }

    if let Some((host, port)) = split_host_port(addr) {
        return Ok(ProxyEndpoint::HostPort { host, port });
    }

    let url = url::Url::parse(addr).map_err(|source| ProxyError::Parse {
        addr: addr.to_owned(),
        source,
    })?;
    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(ProxyEndpoint::Url(url)),
        _ => Err(ProxyError::MissingHost(addr.to_owned())),
    }
}

/// Split `host:port` / `[v6]:port`. Anything with a scheme, path or space is
/// left for URL parsing.
fn split_host_port(addr: &str) -> Option<(String, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let port = port.parse::<u16>().ok()?;

    let host = match host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        Some(v6) => {
            v6.parse::<std::net::Ipv6Addr>().ok()?;
            v6
        }
        None if host.contains(':') => return None,
        None => host,
    };

    if host.is_empty() || host.contains(['/', '@', '?', '#']) || host.contains(char::is_whitespace)
    {
        return None;
    }
    Some((host.to_owned(), port))
}

impl ProxyEndpoint {
    /// Convert into the URI the connector dials and the `Proxy-Authorization`
    /// value derived from URL credentials.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::UnsupportedScheme`] for anything but `http`.
    pub fn to_target(&self) -> Result<ProxyTarget, ProxyError> {
        match self {
            ProxyEndpoint::HostPort { host, port } => {
                let authority = if host.contains(':') {
                    format!("[{host}]:{port}")
                } else {
                    format!("{host}:{port}")
                };
                Ok(ProxyTarget {
                    uri: proxy_uri(&authority)?,
                    authorization: None,
                })
            }
            ProxyEndpoint::Url(url) => {
                if url.scheme() != "http" {
                    return Err(ProxyError::UnsupportedScheme(url.scheme().to_owned()));
                }
                let host = url
                    .host_str()
                    .ok_or_else(|| ProxyError::MissingHost(url.to_string()))?;
                let port = url.port_or_known_default().unwrap_or(80);
                let authority = format!("{host}:{port}");
                Ok(ProxyTarget {
                    uri: proxy_uri(&authority)?,
                    authorization: basic_auth(url),
                })
            }
        }
    }
}

fn proxy_uri(authority: &str) -> Result<Uri, ProxyError> {
    format!("http://{authority}")
        .parse::<Uri>()
        .map_err(|_| ProxyError::MissingHost(authority.to_owned()))
}

fn basic_auth(url: &url::Url) -> Option<HeaderValue> {
    if url.username().is_empty() {
        return None;
    }
    let credentials = format!("{}:{}", url.username(), url.password().unwrap_or_default());
    HeaderValue::from_str(&format!("Basic {}", STANDARD.encode(credentials))).ok()
}

/// Per-request proxy selection strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyChooser {
    /// Resolve this address for each connection; fall back to the environment
    /// when it is empty or unusable.
    Configured(String),
    /// Always use the environment-derived settings.
    Environment,
    /// Use a pre-resolved endpoint.
    Fixed(ProxyEndpoint),
}

impl ProxyChooser {
    /// Pick the proxy for `dst`, consulting the process environment on fallback.
    #[must_use]
    pub fn choose(&self, dst: &Uri) -> Option<ProxyTarget> {
        self.choose_with(dst, EnvProxy::global())
    }

    /// Same as [`ProxyChooser::choose`] with an explicit fallback source.
    #[must_use]
    pub fn choose_with(&self, dst: &Uri, env: &EnvProxy) -> Option<ProxyTarget> {
        let resolved = match self {
            ProxyChooser::Environment => return env.for_destination(dst),
            ProxyChooser::Configured(addr) => resolve(addr).and_then(|ep| ep.to_target()),
            ProxyChooser::Fixed(endpoint) => endpoint.to_target(),
        };

        match resolved {
            Ok(target) => Some(target),
            Err(err) => {
                tracing::debug!(error = %err, "proxy unusable; using environment proxy settings");
                env.for_destination(dst)
            }
        }
    }
}

static ENV_PROXY: OnceLock<EnvProxy> = OnceLock::new();

/// Proxy settings read from `HTTP_PROXY`, `HTTPS_PROXY` and `NO_PROXY`
/// (upper case first, then lower case).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvProxy {
    http: Option<ProxyEndpoint>,
    https: Option<ProxyEndpoint>,
    no_proxy: NoProxy,
}

impl EnvProxy {
    /// Process-wide settings, read once on first use.
    pub fn global() -> &'static EnvProxy {
        ENV_PROXY.get_or_init(EnvProxy::from_env)
    }

    /// Read the current process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |upper: &str, lower: &str| {
            lookup(upper)
                .or_else(|| lookup(lower))
                .filter(|v| !v.trim().is_empty())
        };
        let endpoint = |upper: &str, lower: &str| {
            let value = var(upper, lower)?;
            match resolve(value.trim()) {
                Ok(endpoint) => Some(endpoint),
                Err(err) => {
                    tracing::debug!(variable = upper, error = %err, "ignoring unusable proxy variable");
                    None
                }
            }
        };

        Self {
            http: endpoint("HTTP_PROXY", "http_proxy"),
            https: endpoint("HTTPS_PROXY", "https_proxy"),
            no_proxy: NoProxy::parse(&var("NO_PROXY", "no_proxy").unwrap_or_default()),
        }
    }

    /// Proxy for `dst`, or `None` for a direct connection.
    ///
    /// Loopback destinations and `NO_PROXY` matches always go direct.
    #[must_use]
    pub fn for_destination(&self, dst: &Uri) -> Option<ProxyTarget> {
        let host = dst.host()?;
        if is_loopback(host) || self.no_proxy.matches(host) {
            return None;
        }
        let endpoint = if dst.scheme() == Some(&http::uri::Scheme::HTTPS) {
            self.https.as_ref()
        } else {
            self.http.as_ref()
        }?;
        endpoint.to_target().ok()
    }
}

fn is_loopback(host: &str) -> bool {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    bare.eq_ignore_ascii_case("localhost")
        || bare.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}

/// `NO_PROXY` rules: comma separated, `*` matches everything, IP literals
/// match exactly, names match the domain and all of its subdomains.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NoProxy {
    rules: Vec<String>,
}

impl NoProxy {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let rules = raw
            .split(',')
            .map(|rule| rule.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|rule| !rule.is_empty())
            .collect();
        Self { rules }
    }

    #[must_use]
    pub fn matches(&self, host: &str) -> bool {
        let host = host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_ascii_lowercase();
        self.rules.iter().any(|rule| {
            rule == "*"
                || *rule == host
                || (host.len() > rule.len()
                    && host.ends_with(rule.as_str())
                    && host.as_bytes()[host.len() - rule.len() - 1] == b'.')
        })
    }
}
