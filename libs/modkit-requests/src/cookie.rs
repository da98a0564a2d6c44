//! Cookie storage used by the client between requests.

use http::{HeaderValue, Uri};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, SystemTime};

/// Storage for cookies received in responses and replayed on later requests.
///
/// Implementations must be safe to share between concurrent requests.
pub trait CookieStore: Send + Sync {
    /// Record the `Set-Cookie` headers of a response to `url`.
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Uri);

    /// The `Cookie` header value to send with a request to `url`, if any.
    fn cookies(&self, url: &Uri) -> Option<HeaderValue>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StoredCookie {
    name: String,
    value: String,
    path: String,
    host_only: bool,
    secure: bool,
    expires: Option<SystemTime>,
}

impl StoredCookie {
    fn is_expired(&self, now: SystemTime) -> bool {
        self.expires.is_some_and(|at| at <= now)
    }

    fn matches(&self, domain: &str, host: &str, path: &str, https: bool) -> bool {
        if self.secure && !https {
            return false;
        }
        let domain_ok = if self.host_only {
            host == domain
        } else {
            host == domain || host.ends_with(&format!(".{domain}"))
        };
        domain_ok && path_matches(&self.path, path)
    }
}

fn path_matches(cookie_path: &str, request_path: &str) -> bool {
    request_path == cookie_path
        || (request_path.starts_with(cookie_path)
            && (cookie_path.ends_with('/')
                || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/')))
}

/// Directory of the request path, used when `Set-Cookie` has no `Path`.
fn default_path(url: &Uri) -> String {
    let path = url.path();
    match path.rfind('/') {
        Some(0) | None => "/".to_owned(),
        Some(idx) => path[..idx].to_owned(),
    }
}

/// In-memory cookie jar keyed by domain.
#[derive(Debug, Default)]
pub struct Jar {
    cookies: RwLock<HashMap<String, Vec<StoredCookie>>>,
}

impl Jar {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live cookies across all domains.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = SystemTime::now();
        self.cookies
            .read()
            .values()
            .flatten()
            .filter(|c| !c.is_expired(now))
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn store(&self, raw: &str, url: &Uri) {
        let Some(host) = url.host().map(str::to_ascii_lowercase) else {
            return;
        };
        let Some((cookie, domain)) = parse_set_cookie(raw, &host, url) else {
            tracing::debug!(host = %host, "ignoring malformed Set-Cookie header");
            return;
        };

        let mut cookies = self.cookies.write();
        let entries = cookies.entry(domain).or_default();
        entries.retain(|c| !(c.name == cookie.name && c.path == cookie.path));
        if !cookie.is_expired(SystemTime::now()) {
            entries.push(cookie);
        }
    }
}

impl CookieStore for Jar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Uri) {
        for header in cookie_headers {
            if let Ok(raw) = header.to_str() {
                self.store(raw, url);
            }
        }
    }

    fn cookies(&self, url: &Uri) -> Option<HeaderValue> {
        let host = url.host()?.to_ascii_lowercase();
        let path = url.path();
        let https = url.scheme() == Some(&http::uri::Scheme::HTTPS);
        let now = SystemTime::now();

        let cookies = self.cookies.read();
        let pairs: Vec<String> = cookies
            .iter()
            .flat_map(|(domain, entries)| entries.iter().map(move |c| (domain, c)))
            .filter(|(domain, c)| !c.is_expired(now) && c.matches(domain, &host, path, https))
            .map(|(_, c)| format!("{}={}", c.name, c.value))
            .collect();

        if pairs.is_empty() {
            return None;
        }
        HeaderValue::from_str(&pairs.join("; ")).ok()
    }
}

/// Parse one `Set-Cookie` value into the cookie and the domain it belongs to.
/// A `Domain` attribute that does not cover `host` rejects the cookie.
fn parse_set_cookie(raw: &str, host: &str, url: &Uri) -> Option<(StoredCookie, String)> {
    let mut parts = raw.split(';');
    let (name, value) = parts.next()?.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let mut cookie = StoredCookie {
        name: name.to_owned(),
        value: value.trim().trim_matches('"').to_owned(),
        path: default_path(url),
        host_only: true,
        secure: false,
        expires: None,
    };
    let mut domain = host.to_owned();
    let mut max_age_seen = false;

    for attr in parts {
        let (key, val) = attr.split_once('=').unwrap_or((attr, ""));
        let val = val.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "path" if val.starts_with('/') => cookie.path = val.to_owned(),
            "domain" if !val.is_empty() => {
                let requested = val.trim_start_matches('.').to_ascii_lowercase();
                if host != requested && !host.ends_with(&format!(".{requested}")) {
                    return None;
                }
                domain = requested;
                cookie.host_only = false;
            }
            "secure" => cookie.secure = true,
            "max-age" => {
                if let Ok(secs) = val.parse::<i64>() {
                    max_age_seen = true;
                    cookie.expires = Some(if secs <= 0 {
                        SystemTime::UNIX_EPOCH
                    } else {
                        SystemTime::now() + Duration::from_secs(secs.unsigned_abs())
                    });
                }
            }
            "expires" if !max_age_seen => {
                if let Ok(at) = httpdate::parse_http_date(val) {
                    cookie.expires = Some(at);
                }
            }
            _ => {}
        }
    }

    Some((cookie, domain))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn set(jar: &Jar, url: &str, headers: &[&'static str]) {
        let uri: Uri = url.parse().unwrap();
        let values: Vec<HeaderValue> = headers.iter().map(|h| HeaderValue::from_static(*h)).collect();
        jar.set_cookies(&mut values.iter(), &uri);
    }

    fn get(jar: &Jar, url: &str) -> Option<String> {
        let uri: Uri = url.parse().unwrap();
        jar.cookies(&uri).map(|v| v.to_str().unwrap().to_owned())
    }

    #[test]
    fn test_round_trip_same_host() {
        let jar = Jar::new();
        set(&jar, "http://api.local/login", &["session=abc; Path=/; HttpOnly"]);

        assert_eq!(get(&jar, "http://api.local/items").as_deref(), Some("session=abc"));
        assert_eq!(get(&jar, "http://other.local/items"), None);
        assert_eq!(jar.len(), 1);
    }

    #[test]
    fn test_later_cookie_replaces_earlier() {
        let jar = Jar::new();
        set(&jar, "http://api.local/", &["session=abc; Path=/"]);
        set(&jar, "http://api.local/", &["session=def; Path=/"]);

        assert_eq!(get(&jar, "http://api.local/").as_deref(), Some("session=def"));
    }

    #[test]
    fn test_max_age_zero_deletes() {
        let jar = Jar::new();
        set(&jar, "http://api.local/", &["session=abc; Path=/"]);
        set(&jar, "http://api.local/", &["session=; Path=/; Max-Age=0"]);

        assert_eq!(get(&jar, "http://api.local/"), None);
        assert!(jar.is_empty());
    }

    #[test]
    fn test_past_expires_is_dropped() {
        let jar = Jar::new();
        set(
            &jar,
            "http://api.local/",
            &["old=1; Path=/; Expires=Wed, 21 Oct 2015 07:28:00 GMT"],
        );
        assert_eq!(get(&jar, "http://api.local/"), None);
    }

    #[test]
    fn test_domain_attribute_covers_subdomains() {
        let jar = Jar::new();
        set(&jar, "http://login.example.com/", &["sso=1; Domain=.example.com; Path=/"]);

        assert_eq!(get(&jar, "http://api.example.com/").as_deref(), Some("sso=1"));
        assert_eq!(get(&jar, "http://example.org/"), None);
    }

    #[test]
    fn test_foreign_domain_rejected() {
        let jar = Jar::new();
        set(&jar, "http://api.local/", &["evil=1; Domain=example.com"]);
        assert!(jar.is_empty());
    }

    #[test]
    fn test_path_and_secure_scoping() {
        let jar = Jar::new();
        set(
            &jar,
            "https://api.local/",
            &["admin=1; Path=/admin", "token=2; Path=/; Secure"],
        );

        let admin = get(&jar, "https://api.local/admin/users").unwrap();
        assert!(admin.contains("admin=1") && admin.contains("token=2"), "{admin}");
        assert_eq!(get(&jar, "https://api.local/administrator").as_deref(), Some("token=2"));
        assert_eq!(get(&jar, "http://api.local/"), None);
    }

    #[test]
    fn test_default_path_is_request_directory() {
        let jar = Jar::new();
        set(&jar, "http://api.local/v1/login", &["scoped=1"]);

        assert_eq!(get(&jar, "http://api.local/v1/items").as_deref(), Some("scoped=1"));
        assert_eq!(get(&jar, "http://api.local/v2/items"), None);
    }
}
