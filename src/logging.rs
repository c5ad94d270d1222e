//! Structured per-request cache events.
//!
//! When enabled, the layer emits one JSON event per request describing how it
//! was served (hit, miss, joined wave, bypass or failed fetch). Events go to
//! the `tower_http_memo::events` tracing target, or stdout when the crate is
//! built without the `tracing` feature.

use std::time::{Duration, SystemTime};

use http::{Method, StatusCode, Uri};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::memoizer::Source;
use crate::request_id::RequestId;

/// Configuration for structured cache events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Master switch. Nothing is emitted, and no request id is derived,
    /// while this is false.
    pub enabled: bool,

    /// Fraction of requests to log (1.0 = all, 0.1 = 10%). The decision is
    /// made per request id, so a request is either fully logged or not at all.
    pub sample_rate: f64,

    /// Log a SHA-256 digest instead of the raw key. Keys contain full URLs,
    /// query strings included.
    pub hash_keys: bool,

    /// Recorded in every event as `"target"` so several layers can be told
    /// apart.
    pub target: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_rate: 1.0,
            hash_keys: true,
            target: "tower_http_memo".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Disabled, full sample rate, hashed keys.
    pub fn new() -> Self {
        Self::default()
    }

    /// Turns event logging on or off.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the sample rate, clamped to `0.0..=1.0`.
    pub fn with_sample_rate(mut self, rate: f64) -> Self {
        self.sample_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Chooses between logging a key digest (the default) and the raw key.
    pub fn with_hash_keys(mut self, hash: bool) -> Self {
        self.hash_keys = hash;
        self
    }

    /// Sets the label written to each event's `"target"` field.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    /// Whether events for `request_id` are emitted.
    ///
    /// The request id is mapped onto `[0, 1)` through its SHA-256 digest, so
    /// the same id gets the same answer from every layer sharing a rate.
    pub fn should_sample(&self, request_id: &RequestId) -> bool {
        match self.sample_rate {
            _ if !self.enabled => false,
            rate if rate >= 1.0 => true,
            rate if rate <= 0.0 => false,
            rate => sample_point(request_id.as_str()) < rate,
        }
    }
}

/// How a request was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoEventType {
    /// Served from a live entry.
    Hit,
    /// Started a new upstream fetch.
    Miss,
    /// Waited on a fetch another request started.
    Joined,
    /// Method not cacheable; passed straight through.
    Bypass,
    /// The fetch this request took part in failed.
    FetchError,
}

impl MemoEventType {
    /// The value written to an event's `"event"` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Joined => "joined",
            Self::Bypass => "bypass",
            Self::FetchError => "fetch_error",
        }
    }
}

impl From<Source> for MemoEventType {
    fn from(source: Source) -> Self {
        match source {
            Source::Hit => Self::Hit,
            Source::Fetched => Self::Miss,
            Source::Joined => Self::Joined,
        }
    }
}

/// One structured cache event.
#[derive(Debug, Clone)]
pub struct MemoEvent {
    /// When the event was created.
    pub timestamp: SystemTime,
    pub event_type: MemoEventType,
    /// Taken from `x-request-id` or generated.
    pub request_id: RequestId,
    /// Cache key, or the raw target for bypassed requests.
    pub key: String,
    pub method: Option<Method>,
    pub uri: Option<Uri>,
    /// Status of the response handed back, when there was one.
    pub status: Option<StatusCode>,
    /// Time spent in the layer, waiting on the inner service included.
    pub latency_us: Option<u64>,
    /// Body length in bytes.
    pub size_bytes: Option<usize>,
    /// Rendered error of a failed fetch.
    pub error: Option<String>,
}

impl MemoEvent {
    /// Starts an event stamped with the current time.
    pub fn new(event_type: MemoEventType, request_id: RequestId, key: impl Into<String>) -> Self {
        Self {
            timestamp: SystemTime::now(),
            event_type,
            request_id,
            key: key.into(),
            method: None,
            uri: None,
            status: None,
            latency_us: None,
            size_bytes: None,
            error: None,
        }
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn with_uri(mut self, uri: Uri) -> Self {
        self.uri = Some(uri);
        self
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    /// Recorded in whole microseconds.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency_us = Some(latency.as_micros() as u64);
        self
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size_bytes = Some(size);
        self
    }

    /// Attaches the rendered error of a failed fetch.
    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }

    /// Renders the event as the JSON document that [`MemoEvent::log`] emits.
    pub fn to_json(&self, config: &LoggingConfig) -> serde_json::Value {
        let key = if config.hash_keys {
            hash_key(&self.key)
        } else {
            self.key.clone()
        };

        let timestamp = chrono::DateTime::<chrono::Utc>::from(self.timestamp)
            .format("%Y-%m-%dT%H:%M:%S%.3fZ")
            .to_string();

        json!({
            "timestamp": timestamp,
            "target": config.target,
            "event": self.event_type.as_str(),
            "request_id": self.request_id.as_str(),
            "key": key,
            "method": self.method.as_ref().map(|m| m.as_str()),
            "uri": self.uri.as_ref().map(|u| u.to_string()),
            "status": self.status.map(|s| s.as_u16()),
            "cached": matches!(self.event_type, MemoEventType::Hit | MemoEventType::Joined),
            "latency_us": self.latency_us,
            "size_bytes": self.size_bytes,
            "error": self.error,
        })
    }

    /// Emits the event if `config` enables and samples it.
    pub fn log(&self, config: &LoggingConfig) {
        if !config.should_sample(&self.request_id) {
            return;
        }

        let data = self.to_json(config);

        #[cfg(feature = "tracing")]
        tracing::info!(target: "tower_http_memo::events", event = %data);

        #[cfg(not(feature = "tracing"))]
        println!("{}", data);
    }
}

/// First eight digest bytes of `id`, scaled into `[0, 1)`.
fn sample_point(id: &str) -> f64 {
    let digest = Sha256::digest(id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) >> 11) as f64 / (1u64 << 53) as f64
}

/// Hex-encoded SHA-256 of `key`.
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_disabled_and_hashes() {
        let config = LoggingConfig::default();
        assert!(!config.enabled);
        assert!(config.hash_keys);
        assert!(!config.should_sample(&RequestId::new()));
    }

    #[test]
    fn sample_rate_is_clamped() {
        assert_eq!(LoggingConfig::new().with_sample_rate(3.0).sample_rate, 1.0);
        assert_eq!(LoggingConfig::new().with_sample_rate(-1.0).sample_rate, 0.0);
    }

    #[test]
    fn full_rate_always_samples() {
        let config = LoggingConfig::new().with_enabled(true).with_sample_rate(1.0);
        assert!(config.should_sample(&RequestId::new()));

        let muted = config.with_sample_rate(0.0);
        assert!(!muted.should_sample(&RequestId::new()));
    }

    #[test]
    fn sampling_is_stable_per_request_id() {
        let config = LoggingConfig::new().with_enabled(true).with_sample_rate(0.5);
        let ids: Vec<RequestId> = (0..200).map(|_| RequestId::new()).collect();

        let first: Vec<bool> = ids.iter().map(|id| config.should_sample(id)).collect();
        let second: Vec<bool> = ids.iter().map(|id| config.should_sample(id)).collect();
        assert_eq!(first, second);

        let kept = first.iter().filter(|kept| **kept).count();
        assert!(kept > 0 && kept < ids.len(), "kept {kept} of {}", ids.len());
    }

    #[test]
    fn sample_point_is_a_fraction() {
        for id in ["a", "req-1", "550e8400-e29b-41d4-a716-446655440000"] {
            let point = sample_point(id);
            assert!((0.0..1.0).contains(&point), "{id} -> {point}");
        }
    }

    #[test]
    fn hash_key_is_stable_hex() {
        let hashed = hash_key("GET http://x/a");
        assert_eq!(hashed, hash_key("GET http://x/a"));
        assert_eq!(hashed.len(), 64);
        assert_ne!(hashed, hash_key("GET http://x/b"));
    }

    #[test]
    fn json_hides_raw_key_when_hashing() {
        let config = LoggingConfig::new().with_enabled(true);
        let event = MemoEvent::new(MemoEventType::Hit, RequestId::new(), "GET http://x/secret")
            .with_method(Method::GET)
            .with_status(StatusCode::OK)
            .with_size(12);

        let json = event.to_json(&config);
        assert_eq!(json["event"], "hit");
        assert_eq!(json["cached"], true);
        assert_eq!(json["status"], 200);
        assert_eq!(json["key"], hash_key("GET http://x/secret"));
    }

    #[test]
    fn json_keeps_raw_key_when_not_hashing() {
        let config = LoggingConfig::new().with_hash_keys(false).with_target("client-a");
        let event = MemoEvent::new(MemoEventType::FetchError, RequestId::new(), "GET http://x/a")
            .with_error("timed out");

        let json = event.to_json(&config);
        assert_eq!(json["key"], "GET http://x/a");
        assert_eq!(json["target"], "client-a");
        assert_eq!(json["error"], "timed out");
        assert_eq!(json["cached"], false);
    }

    #[test]
    fn event_type_follows_source() {
        assert_eq!(MemoEventType::from(Source::Hit), MemoEventType::Hit);
        assert_eq!(MemoEventType::from(Source::Fetched), MemoEventType::Miss);
        assert_eq!(MemoEventType::from(Source::Joined), MemoEventType::Joined);
    }

    #[test]
    fn logging_disabled_event_is_silent() {
        let event = MemoEvent::new(MemoEventType::Bypass, RequestId::new(), "http://x/a");
        event.log(&LoggingConfig::default());
    }
}
