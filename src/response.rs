use bytes::Bytes;
use http::{HeaderMap, Response, StatusCode, Version};
use http_body::Body;
use http_body_util::{BodyExt, Full};

use crate::error::MemoError;

/// Transport-level response captured by the memoizer.
///
/// The body is collected before storage and is never decoded. A cached
/// response is shared between every caller that reads it, so it is only ever
/// handed out through [`CachedResponse::to_response`], which builds a fresh
/// [`Response`] per caller. `Bytes` is reference counted, so the body itself
/// is not copied.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
}

impl CachedResponse {
    /// Wraps already collected response parts.
    pub fn new(status: StatusCode, version: Version, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            version,
            headers,
            body,
        }
    }

    /// Drains `response`, collecting its body into memory.
    pub async fn collect<B>(response: Response<B>) -> Result<Self, MemoError>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (parts, body) = response.into_parts();
        let collected = BodyExt::collect(body)
            .await
            .map_err(MemoError::upstream)?;

        Ok(Self {
            status: parts.status,
            version: parts.version,
            headers: parts.headers,
            body: collected.to_bytes(),
        })
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The body bytes exactly as received.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Builds an owned `http::Response` for one caller.
    pub fn to_response(&self) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::from(self.body.clone()));
        *response.status_mut() = self.status;
        *response.version_mut() = self.version;
        *response.headers_mut() = self.headers.clone();
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::CONTENT_TYPE;
    use http::HeaderValue;

    #[tokio::test]
    async fn collect_keeps_status_headers_and_body() {
        let response = Response::builder()
            .status(StatusCode::ACCEPTED)
            .header(CONTENT_TYPE, "application/json")
            .body(Full::from("{\"value\":[]}"))
            .expect("valid response");

        let cached = CachedResponse::collect(response).await.expect("collects");
        assert_eq!(cached.status(), StatusCode::ACCEPTED);
        assert_eq!(
            cached.headers().get(CONTENT_TYPE),
            Some(&HeaderValue::from_static("application/json"))
        );
        assert_eq!(cached.body(), &Bytes::from_static(b"{\"value\":[]}"));
    }

    #[tokio::test]
    async fn to_response_hands_out_independent_copies() {
        let cached = CachedResponse::new(
            StatusCode::OK,
            Version::HTTP_11,
            HeaderMap::new(),
            Bytes::from_static(b"shared"),
        );

        let mut first = cached.to_response();
        first
            .headers_mut()
            .insert("x-mutated", HeaderValue::from_static("1"));
        *first.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;

        let second = cached.to_response();
        assert_eq!(second.status(), StatusCode::OK);
        assert!(second.headers().get("x-mutated").is_none());

        let body = second.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(body, "shared");
    }
}
