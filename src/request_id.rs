//! Request correlation IDs attached to cache events.

use http::{HeaderValue, Request};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Header consulted for an existing request ID.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Correlates cache events with the request that caused them.
///
/// Taken from the outgoing request's `x-request-id` header when present so
/// that events line up with the caller's own logs; otherwise a random UUID v4.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    /// Generates a random UUID v4 id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns `None` if the header value is not visible ASCII.
    pub fn from_header(header: &HeaderValue) -> Option<Self> {
        header
            .to_str()
            .ok()
            .filter(|s| !s.is_empty())
            .map(|s| Self(s.to_owned()))
    }

    /// Uses the request's `x-request-id` header when present and usable,
    /// otherwise generates a new id.
    pub fn from_request<B>(req: &Request<B>) -> Self {
        req.headers()
            .get(REQUEST_ID_HEADER)
            .and_then(Self::from_header)
            .unwrap_or_else(Self::new)
    }

    /// The id as written to events.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_uuids() {
        let a = RequestId::new();
        let b = RequestId::new();
        assert_ne!(a, b);
        assert!(Uuid::parse_str(a.as_str()).is_ok());
    }

    #[test]
    fn header_value_is_reused() {
        let req = Request::builder()
            .header(REQUEST_ID_HEADER, "req-42")
            .body(())
            .expect("valid request");
        assert_eq!(RequestId::from_request(&req).as_str(), "req-42");
    }

    #[test]
    fn empty_header_falls_back_to_generated() {
        let req = Request::builder()
            .header(REQUEST_ID_HEADER, "")
            .body(())
            .expect("valid request");
        let id = RequestId::from_request(&req);
        assert!(Uuid::parse_str(id.as_str()).is_ok());
    }
}
