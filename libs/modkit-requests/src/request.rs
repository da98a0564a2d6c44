use crate::client::ApiClient;
use crate::config::ValidationMode;
use crate::error::{HttpError, InvalidUriKind};
use crate::response::RawResponse;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode, Uri};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Uppercase `method` and check it against the set accepted in `mode`.
///
/// Lenient mode accepts GET, POST, PUT and DELETE; strict mode adds PATCH and
/// OPTIONS.
///
/// # Errors
///
/// Returns [`HttpError::UnsupportedMethod`] for anything else.
pub fn normalize_method(method: &str, mode: ValidationMode) -> Result<Method, HttpError> {
    let upper = method.trim().to_ascii_uppercase();
    let method = match upper.as_str() {
        "GET" => Method::GET,
        "POST" => Method::POST,
        "PUT" => Method::PUT,
        "DELETE" => Method::DELETE,
        "PATCH" if mode.is_strict() => Method::PATCH,
        "OPTIONS" if mode.is_strict() => Method::OPTIONS,
        _ => return Err(HttpError::UnsupportedMethod(upper)),
    };
    Ok(method)
}

/// Parse a request target, defaulting to `http://` when no scheme is given.
///
/// # Errors
///
/// - [`HttpError::UnsupportedProtocol`] for schemes other than `http`/`https`
/// - [`HttpError::InvalidUri`] when the result is not an absolute URL
pub fn normalize_target(target: &str) -> Result<Uri, HttpError> {
    let url = match target.split_once("://") {
        None => format!("http://{target}"),
        Some((scheme, _)) if scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https") => {
            target.to_owned()
        }
        Some((scheme, _)) => {
            return Err(HttpError::UnsupportedProtocol {
                scheme: scheme.to_owned(),
            });
        }
    };

    let uri: Uri = url.parse().map_err(|e: http::uri::InvalidUri| HttpError::InvalidUri {
        url: url.clone(),
        kind: InvalidUriKind::ParseError,
        reason: e.to_string(),
    })?;

    if uri.host().is_none_or(str::is_empty) {
        return Err(HttpError::InvalidUri {
            url,
            kind: InvalidUriKind::MissingAuthority,
            reason: "missing host/authority".to_owned(),
        });
    }
    Ok(uri)
}

/// Join `base` and `path` with exactly one slash between them.
///
/// One trailing slash is trimmed from `base` and one leading slash from
/// `path`; an empty `path` returns `base` unchanged.
#[must_use]
pub fn url_join(base: &str, path: &str) -> String {
    if path.is_empty() {
        return base.to_owned();
    }
    let base = base.strip_suffix('/').unwrap_or(base);
    let path = path.strip_prefix('/').unwrap_or(path);
    format!("{base}/{path}")
}

/// Serialize a request body to JSON.
///
/// # Errors
///
/// Returns [`HttpError::JsonEncoding`] carrying the value's type name.
pub fn encode_json<B: Serialize + ?Sized>(body: &B) -> Result<Bytes, HttpError> {
    serde_json::to_vec(body)
        .map(Bytes::from)
        .map_err(|source| HttpError::JsonEncoding {
            value_type: std::any::type_name::<B>(),
            source,
        })
}

/// A fully validated request, ready for execution.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: Method,
    /// Absolute URL the request goes to
    pub url: Uri,
    /// Path (or full target) as the caller passed it
    pub path: String,
    /// JSON-encoded body
    pub body: Option<Bytes>,
    /// Per-request headers, applied before the client's standard headers
    pub headers: HeaderMap,
}

impl RequestDescriptor {
    /// Validate method and target and encode `body`.
    ///
    /// With a `base` the target is `base` joined with `path`; without one
    /// `path` must be a full URL (scheme optional).
    ///
    /// # Errors
    ///
    /// `UnsupportedMethod`, `UnsupportedProtocol`, `InvalidUri` or
    /// `JsonEncoding`; nothing has been sent in any of these cases.
    pub fn build<B: Serialize + ?Sized>(
        method: &str,
        base: Option<&str>,
        path: &str,
        body: Option<&B>,
        mode: ValidationMode,
    ) -> Result<Self, HttpError> {
        let mut descriptor = Self::from_encoded(method, base, path, None, mode)?;
        descriptor.body = body.map(encode_json).transpose()?;
        Ok(descriptor)
    }

    pub(crate) fn from_encoded(
        method: &str,
        base: Option<&str>,
        path: &str,
        body: Option<Bytes>,
        mode: ValidationMode,
    ) -> Result<Self, HttpError> {
        let method = normalize_method(method, mode)?;
        let target = match base {
            Some(base) => url_join(base, path),
            None => path.to_owned(),
        };
        let url = normalize_target(&target)?;

        Ok(Self {
            method,
            url,
            path: path.to_owned(),
            body,
            headers: HeaderMap::new(),
        })
    }

    /// Add a per-request header.
    ///
    /// An empty name is rejected in strict mode and skipped with a warning in
    /// lenient mode.
    ///
    /// # Errors
    ///
    /// `InvalidConfiguration` for an empty name in strict mode,
    /// `InvalidHeaderName`/`InvalidHeaderValue` for malformed input.
    pub fn insert_header(
        &mut self,
        name: &str,
        value: &str,
        mode: ValidationMode,
    ) -> Result<(), HttpError> {
        if name.is_empty() {
            if mode.is_strict() {
                return Err(HttpError::InvalidConfiguration {
                    setting: "header",
                    reason: "header key must not be empty".to_owned(),
                });
            }
            tracing::warn!(value = %value, "skipping header with empty key");
            return Ok(());
        }
        let name = HeaderName::try_from(name)?;
        let value = HeaderValue::try_from(value)?;
        self.headers.insert(name, value);
        Ok(())
    }

    /// Request body as text, for error reports.
    #[must_use]
    pub fn body_text(&self) -> Option<String> {
        self.body
            .as_ref()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }
}

/// Fluent request construction on an [`ApiClient`].
///
/// Created by [`ApiClient::request_builder`]. Errors from header and body
/// setters are deferred to [`send()`](RequestBuilder::send).
///
/// ```ignore
/// let (status, item): (_, Item) = client
///     .request_builder("post", "/items")
///     .header("x-request-id", "abc123")
///     .json(&NewItem { name: "widget" })
///     .send_json()
///     .await?;
/// ```
#[must_use = "RequestBuilder does nothing until .send() is called"]
pub struct RequestBuilder<'a> {
    client: &'a ApiClient,
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    body: Option<Bytes>,
    error: Option<HttpError>,
}

impl<'a> RequestBuilder<'a> {
    pub(crate) fn new(client: &'a ApiClient, method: &str, path: &str) -> Self {
        Self {
            client,
            method: method.to_owned(),
            path: path.to_owned(),
            headers: Vec::new(),
            body: None,
            error: None,
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    /// Set the JSON body. Serialization errors surface from `send`.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Self {
        if self.error.is_none() {
            match encode_json(body) {
                Ok(bytes) => self.body = Some(bytes),
                Err(e) => self.error = Some(e),
            }
        }
        self
    }

    /// Validate everything and produce the descriptor without sending it.
    ///
    /// # Errors
    ///
    /// Any deferred builder error, or the validation errors of
    /// [`RequestDescriptor::build`].
    pub fn build(self) -> Result<RequestDescriptor, HttpError> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let mode = self.client.validation();
        let mut descriptor = RequestDescriptor::from_encoded(
            &self.method,
            self.client.base_url(),
            &self.path,
            self.body,
            mode,
        )?;
        for (name, value) in &self.headers {
            descriptor.insert_header(name, value, mode)?;
        }
        Ok(descriptor)
    }

    /// Execute and return the raw response (2xx only).
    ///
    /// # Errors
    ///
    /// Validation, transport and `BadResponse` errors.
    pub async fn send(self) -> Result<RawResponse, HttpError> {
        let client = self.client;
        let descriptor = self.build()?;
        client.execute(descriptor).await
    }

    /// Execute and decode the body into `T`.
    ///
    /// # Errors
    ///
    /// As [`send`](RequestBuilder::send), plus `JsonDecoding`.
    pub async fn send_json<T: DeserializeOwned>(self) -> Result<(StatusCode, T), HttpError> {
        let response = self.send().await?;
        let value = response.json()?;
        Ok((response.status, value))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use serde::ser::Error as _;

    #[test]
    fn test_method_normalization() {
        assert_eq!(normalize_method("get", ValidationMode::Strict).unwrap(), Method::GET);
        assert_eq!(normalize_method("Post", ValidationMode::Lenient).unwrap(), Method::POST);
        assert_eq!(normalize_method("patch", ValidationMode::Strict).unwrap(), Method::PATCH);
        assert_eq!(normalize_method("options", ValidationMode::Strict).unwrap(), Method::OPTIONS);
    }

    #[test]
    fn test_extended_methods_rejected_when_lenient() {
        for method in ["patch", "OPTIONS"] {
            let err = normalize_method(method, ValidationMode::Lenient).unwrap_err();
            assert!(matches!(err, HttpError::UnsupportedMethod(ref m) if *m == method.to_ascii_uppercase()));
        }
    }

    #[test]
    fn test_unknown_method_rejected() {
        for mode in [ValidationMode::Strict, ValidationMode::Lenient] {
            let err = normalize_method("fetch", mode).unwrap_err();
            assert!(matches!(err, HttpError::UnsupportedMethod(ref m) if m == "FETCH"));
        }
    }

    #[test]
    fn test_target_without_scheme_gets_http() {
        let uri = normalize_target("api.local:8080/items").unwrap();
        assert_eq!(uri.scheme_str(), Some("http"));
        assert_eq!(uri.host(), Some("api.local"));
        assert_eq!(uri.path(), "/items");
    }

    #[test]
    fn test_target_keeps_https() {
        let uri = normalize_target("https://api.local/items?page=2").unwrap();
        assert_eq!(uri.scheme_str(), Some("https"));
        assert_eq!(uri.query(), Some("page=2"));
    }

    #[test]
    fn test_target_rejects_other_schemes() {
        let err = normalize_target("ftp://files.local/a").unwrap_err();
        assert!(matches!(err, HttpError::UnsupportedProtocol { ref scheme } if scheme == "ftp"));
    }

    #[test]
    fn test_target_rejects_garbage() {
        let err = normalize_target("not a url").unwrap_err();
        assert!(matches!(
            err,
            HttpError::InvalidUri {
                kind: InvalidUriKind::ParseError,
                ..
            }
        ));
    }

    #[test]
    fn test_url_join() {
        assert_eq!(url_join("http://h/api/", "/items"), "http://h/api/items");
        assert_eq!(url_join("http://h/api", "items"), "http://h/api/items");
        assert_eq!(url_join("http://h/api/", ""), "http://h/api/");
        assert_eq!(url_join("http://h/api", "/items/"), "http://h/api/items/");
    }

    #[test]
    fn test_url_join_idempotent_on_slashes() {
        let expected = "http://h/api/items";
        for (base, path) in [
            ("http://h/api", "items"),
            ("http://h/api/", "items"),
            ("http://h/api", "/items"),
            ("http://h/api/", "/items"),
        ] {
            assert_eq!(url_join(base, path), expected);
        }
    }

    #[test]
    fn test_build_joins_base_and_encodes_body() {
        let body = serde_json::json!({"name": "widget", "count": 3});
        let descriptor = RequestDescriptor::build(
            "post",
            Some("http://api.local/v1/"),
            "/items",
            Some(&body),
            ValidationMode::Strict,
        )
        .unwrap();

        assert_eq!(descriptor.method, Method::POST);
        assert_eq!(descriptor.url, "http://api.local/v1/items");
        assert_eq!(descriptor.path, "/items");
        let decoded: serde_json::Value =
            serde_json::from_slice(descriptor.body.as_ref().unwrap()).unwrap();
        assert_eq!(decoded, body);
        assert!(descriptor.body_text().unwrap().contains("widget"));
    }

    #[test]
    fn test_build_without_body() {
        let descriptor = RequestDescriptor::build::<()>(
            "GET",
            None,
            "api.local/items",
            None,
            ValidationMode::Lenient,
        )
        .unwrap();
        assert!(descriptor.body.is_none());
        assert_eq!(descriptor.url, "http://api.local/items");
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _s: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("cannot encode"))
        }
    }

    #[test]
    fn test_encoding_failure_names_type() {
        let err = RequestDescriptor::build(
            "POST",
            Some("http://api.local"),
            "/items",
            Some(&Unserializable),
            ValidationMode::Strict,
        )
        .unwrap_err();

        match err {
            HttpError::JsonEncoding { value_type, .. } => {
                assert!(value_type.ends_with("Unserializable"), "{value_type}");
            }
            other => panic!("expected JsonEncoding, got {other:?}"),
        }
    }

    #[test]
    fn test_method_checked_before_body_encoding() {
        let err = RequestDescriptor::build(
            "TRACE",
            Some("http://api.local"),
            "/items",
            Some(&Unserializable),
            ValidationMode::Strict,
        )
        .unwrap_err();
        assert!(matches!(err, HttpError::UnsupportedMethod(_)));
    }

    #[test]
    fn test_empty_header_key_by_mode() {
        let mut descriptor = RequestDescriptor::build::<()>(
            "GET",
            Some("http://api.local"),
            "/",
            None,
            ValidationMode::Strict,
        )
        .unwrap();

        let err = descriptor
            .insert_header("", "v", ValidationMode::Strict)
            .unwrap_err();
        assert!(matches!(err, HttpError::InvalidConfiguration { setting: "header", .. }));

        descriptor
            .insert_header("", "v", ValidationMode::Lenient)
            .unwrap();
        assert!(descriptor.headers.is_empty());

        descriptor
            .insert_header("x-request-id", "abc", ValidationMode::Strict)
            .unwrap();
        assert_eq!(descriptor.headers["x-request-id"], "abc");
    }
}
