//! Re-exports for consumers who prefer a single import.
//!
//! ```no_run
//! use tower_http_memo::prelude::*;
//! # use std::time::Duration;
//! let layer = MemoLayer::builder()
//!     .expiration(Duration::from_secs(30))
//!     .build();
//! ```

pub use crate::config::{MemoConfig, Options};
pub use crate::error::{ConfigError, MemoError};
pub use crate::key::CacheKey;
pub use crate::layer::{BoxError, MemoLayer, MemoLayerBuilder, MemoService};
pub use crate::logging::{LoggingConfig, MemoEvent, MemoEventType};
pub use crate::memoizer::{Memoized, Memoizer, Source, NO_CLEANUP, NO_EXPIRATION};
pub use crate::request_id::RequestId;
pub use crate::response::CachedResponse;
pub use crate::stats::StatsSnapshot;
