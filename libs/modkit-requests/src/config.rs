use crate::error::HttpError;
use rand::Rng as _;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Default User-Agent sent when the caller has not configured one
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_13_2) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/63.0.3239.132 Safari/537.36";

/// MIME type used for both `Content-Type` and `Accept`
pub const MIME_JSON: &str = "application/json";

/// Header carrying the configured auth token
pub const TOKEN_HEADER: &str = "x-token";

/// Default whole-request timeout for base-URL clients
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default whole-request timeout for the standalone preset
pub const STANDALONE_TIMEOUT: Duration = Duration::from_secs(20);

/// How strictly inputs are checked before a request is sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    /// Extended method set, zero timeouts and empty header keys rejected
    #[default]
    Strict,
    /// GET/POST/PUT/DELETE only; zero timeouts mean "no limit", empty header
    /// keys are dropped with a warning
    Lenient,
}

impl ValidationMode {
    #[must_use]
    pub fn is_strict(self) -> bool {
        self == ValidationMode::Strict
    }
}

/// Outbound connection settings shared by every request of a client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DialerConfig {
    /// Proxy address (`host:port` or URL). Unusable values fall back to the
    /// environment at request time.
    pub proxy_addr: Option<String>,

    /// Local source addresses; one is picked at random for every new connection.
    pub local_addrs: Vec<IpAddr>,
}

impl DialerConfig {
    /// Pick a local source address, `None` to let the OS decide.
    #[must_use]
    pub fn pick_local_addr(&self) -> Option<IpAddr> {
        match self.local_addrs.len() {
            0 => None,
            1 => self.local_addrs.first().copied(),
            n => self.local_addrs.get(rand::rng().random_range(0..n)).copied(),
        }
    }
}

/// Construction-time configuration of an [`ApiClient`](crate::ApiClient).
///
/// Everything except `base_url`, `validation` and `dialer` can also be changed
/// later through the client's setters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Prefix joined with every request path. `None` means each call passes a
    /// full URL.
    pub base_url: Option<String>,

    /// Value for the `x-token` header
    pub token: Option<String>,

    /// User-Agent header value
    pub user_agent: String,

    /// Verify server certificates against the OS trust store.
    ///
    /// Off by default: certificates are NOT checked unless this is enabled.
    pub https_verify: bool,

    /// Whole-request deadline
    #[serde(with = "humantime_duration")]
    pub timeout: Duration,

    pub validation: ValidationMode,

    pub dialer: DialerConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            token: None,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            https_verify: false,
            timeout: DEFAULT_TIMEOUT,
            validation: ValidationMode::Strict,
            dialer: DialerConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Base-URL client: every call passes a path joined onto `base_url`.
    #[must_use]
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: Some(base_url.into()),
            ..Default::default()
        }
    }

    /// Standalone client: every call passes a full URL, 20s timeout.
    #[must_use]
    pub fn standalone() -> Self {
        Self {
            timeout: STANDALONE_TIMEOUT,
            ..Default::default()
        }
    }

    /// Load configuration by layering defaults, an optional YAML file and
    /// environment variables named `{env_prefix}FIELD` (nested fields use
    /// `__`, e.g. `APP_HTTP_DIALER__PROXY_ADDR`).
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::InvalidConfiguration`] when a source cannot be read
    /// or a value has the wrong shape.
    pub fn load(path: Option<&Path>, env_prefix: &str) -> Result<Self, HttpError> {
        use figment::Figment;
        use figment::providers::{Env, Format, Serialized, Yaml};

        let mut figment = Figment::from(Serialized::defaults(ClientConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment
            .merge(Env::prefixed(env_prefix).split("__"))
            .extract()
            .map_err(|e| HttpError::InvalidConfiguration {
                setting: "client config",
                reason: e.to_string(),
            })
    }
}

/// Durations as humantime strings (`"30s"`, `"1m 30s"`).
mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer, de};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(de::Error::custom)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.user_agent, DEFAULT_USER_AGENT);
        assert!(!config.https_verify);
        assert_eq!(config.validation, ValidationMode::Strict);
        assert!(config.base_url.is_none());
    }

    #[test]
    fn test_standalone_preset() {
        let config = ClientConfig::standalone();
        assert_eq!(config.timeout, Duration::from_secs(20));
        assert!(config.base_url.is_none());
    }

    #[test]
    fn test_serde_uses_humantime() {
        let config = ClientConfig::with_base_url("http://api.local");
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["timeout"], "30s");

        let parsed: ClientConfig = serde_json::from_value(serde_json::json!({
            "timeout": "1m 30s",
            "validation": "lenient"
        }))
        .unwrap();
        assert_eq!(parsed.timeout, Duration::from_secs(90));
        assert_eq!(parsed.validation, ValidationMode::Lenient);
        assert_eq!(parsed.user_agent, DEFAULT_USER_AGENT);
    }

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "base_url: http://api.local/v1\ntoken: abc\ntimeout: 5s\ndialer:\n  proxy_addr: \"127.0.0.1:3128\"\n  local_addrs: [\"127.0.0.1\"]"
        )
        .unwrap();

        let config = ClientConfig::load(Some(file.path()), "MODKIT_REQUESTS_TEST_UNUSED_").unwrap();
        assert_eq!(config.base_url.as_deref(), Some("http://api.local/v1"));
        assert_eq!(config.token.as_deref(), Some("abc"));
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.dialer.proxy_addr.as_deref(), Some("127.0.0.1:3128"));
        assert_eq!(
            config.dialer.pick_local_addr(),
            Some(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST))
        );
    }

    #[test]
    fn test_load_rejects_bad_duration() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "timeout: soon").unwrap();

        let err = ClientConfig::load(Some(file.path()), "MODKIT_REQUESTS_TEST_UNUSED_").unwrap_err();
        assert!(matches!(err, HttpError::InvalidConfiguration { .. }), "{err}");
    }

    #[test]
    fn test_load_without_file_yields_defaults() {
        let config = ClientConfig::load(None, "MODKIT_REQUESTS_TEST_UNUSED_").unwrap();
        assert_eq!(config, ClientConfig::default());
    }

    #[test]
    fn test_pick_local_addr_from_list() {
        let dialer = DialerConfig {
            proxy_addr: None,
            local_addrs: vec![IpAddr::from([10, 0, 0, 1]), IpAddr::from([10, 0, 0, 2])],
        };
        for _ in 0..16 {
            let picked = dialer.pick_local_addr().unwrap();
            assert!(dialer.local_addrs.contains(&picked));
        }
        assert_eq!(DialerConfig::default().pick_local_addr(), None);
    }
}
