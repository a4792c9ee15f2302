//! Capturing computed output for the store and rebuilding it on a hit.

use axum::http::{HeaderName, HeaderValue, Response, StatusCode};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::error::SnapshotError;

/// The stored form of an artifact: its content and its headers in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedArtifact {
    #[serde(with = "base64_content")]
    pub content: Bytes,
    pub headers: Vec<(String, String)>,
}

impl CachedArtifact {
    pub fn new(content: impl Into<Bytes>) -> Self {
        Self {
            content: content.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn decode(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}

mod base64_content {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(content: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(content))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(D::Error::custom)
    }
}

/// Output that can be cached.
///
/// `snapshot` failing means "do not cache"; the output itself is still delivered.
pub trait Artifact: Sized {
    fn snapshot(&self) -> Result<CachedArtifact, SnapshotError>;

    fn restore(cached: CachedArtifact) -> Result<Self, SnapshotError>;
}

impl Artifact for String {
    fn snapshot(&self) -> Result<CachedArtifact, SnapshotError> {
        Ok(CachedArtifact::new(self.clone()))
    }

    fn restore(cached: CachedArtifact) -> Result<Self, SnapshotError> {
        String::from_utf8(cached.content.to_vec()).map_err(|_| SnapshotError::NoContent)
    }
}

/// `None` has nothing to capture.
impl<A: Artifact> Artifact for Option<A> {
    fn snapshot(&self) -> Result<CachedArtifact, SnapshotError> {
        self.as_ref().ok_or(SnapshotError::NoContent)?.snapshot()
    }

    fn restore(cached: CachedArtifact) -> Result<Self, SnapshotError> {
        A::restore(cached).map(Some)
    }
}

/// Buffered HTTP responses. Only `200 OK` is captured; restored responses are `200 OK`
/// with the stored headers appended in order.
impl Artifact for Response<Bytes> {
    fn snapshot(&self) -> Result<CachedArtifact, SnapshotError> {
        if self.status() != StatusCode::OK {
            return Err(SnapshotError::Status {
                status: self.status().as_u16(),
            });
        }

        let headers = self
            .headers()
            .iter()
            .map(|(name, value)| {
                value
                    .to_str()
                    .map(|value| (name.to_string(), value.to_string()))
                    .map_err(|_| SnapshotError::Header {
                        name: name.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(CachedArtifact {
            content: self.body().clone(),
            headers,
        })
    }

    fn restore(cached: CachedArtifact) -> Result<Self, SnapshotError> {
        let mut response = Response::new(cached.content);
        let headers = response.headers_mut();
        for (name, value) in cached.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| SnapshotError::Header { name: name.clone() })?;
            let header_value =
                HeaderValue::from_str(&value).map_err(|_| SnapshotError::Header { name })?;
            headers.append(header_name, header_value);
        }
        Ok(response)
    }
}
