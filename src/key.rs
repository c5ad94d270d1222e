//! Cache key derivation.

use std::fmt;

use http::{Method, Uri};

/// The only method whose responses are memoized.
pub const CACHEABLE_METHOD: &str = "GET";

/// Identifies a cacheable request: the uppercased method, a single space,
/// then the request target exactly as the [`Uri`] renders it.
///
/// Query parameter order and casing are preserved, so `?a=1&b=2` and
/// `?b=2&a=1` occupy distinct slots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derives the key for a request, or `None` when the method is not
    /// cacheable.
    pub fn for_request(method: &Method, uri: &Uri) -> Option<Self> {
        // A cacheable method uppercases to exactly `CACHEABLE_METHOD`.
        is_cacheable(method).then(|| Self(format!("{CACHEABLE_METHOD} {uri}")))
    }

    /// The key as stored by the [`Memoizer`](crate::Memoizer).
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the key, returning the owned string.
    pub fn into_string(self) -> String {
        self.0
    }
}

/// Returns whether requests with `method` participate in caching.
///
/// Comparison happens after ASCII uppercasing, so an extension method
/// spelled `get` is treated like [`Method::GET`].
pub fn is_cacheable(method: &Method) -> bool {
    normalize_method(method) == CACHEABLE_METHOD
}

fn normalize_method(method: &Method) -> String {
    method.as_str().to_ascii_uppercase()
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.0
    }
}
