use crate::error::HttpError;
use crate::transport::ResponseBody;
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode};
use http_body_util::BodyExt;
use serde::de::DeserializeOwned;

/// A response whose body has been read completely.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RawResponse {
    /// Decode the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::JsonDecoding`] with the raw bytes on failure.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HttpError> {
        decode(&self.body)
    }

    /// Body as text, lossily converted from UTF-8.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// True when `status` is outside `[200, 300)`.
#[must_use]
pub fn is_bad_response(status: u16) -> bool {
    !(200..300).contains(&status)
}

/// Deserialize a JSON body into `T`.
///
/// # Errors
///
/// Returns [`HttpError::JsonDecoding`] carrying the raw bytes, the target type
/// name and the parser error.
pub fn decode<T: DeserializeOwned>(raw: &Bytes) -> Result<T, HttpError> {
    serde_json::from_slice(raw).map_err(|source| HttpError::JsonDecoding {
        raw: raw.clone(),
        target: std::any::type_name::<T>(),
        source,
    })
}

/// Read the whole body; it is dropped on every path out of this function.
///
/// A stream failure keeps `status` and whatever arrived before it.
pub(crate) async fn read_body(status: StatusCode, mut body: ResponseBody) -> Result<Bytes, HttpError> {
    let mut received = BytesMut::new();
    while let Some(frame) = body.frame().await {
        match frame {
            Ok(frame) => {
                if let Ok(data) = frame.into_data() {
                    received.extend_from_slice(&data);
                }
            }
            Err(source) => {
                return Err(HttpError::BodyRead {
                    status,
                    partial: received.freeze(),
                    source,
                });
            }
        }
    }
    Ok(received.freeze())
}
