//! Tower HTTP Memo
//! ================
//!
//! `tower-http-memo` is a client-side Tower layer that memoizes responses to
//! `GET` requests. Repeated calls for the same URL are served from memory and
//! concurrent identical calls collapse into a single upstream request. All
//! other methods pass straight through.
//!
//! Only the raw transport response is cached (status, headers, body bytes);
//! decoding the body still happens on every call. Expiration is a flat,
//! caller-chosen duration; HTTP caching headers are not consulted.
//!
//! ```no_run
//! use std::time::Duration;
//! use tower::{Service, ServiceBuilder, ServiceExt};
//! use tower_http_memo::prelude::*;
//!
//! # async fn run() -> Result<(), tower_http_memo::layer::BoxError> {
//! let layer = MemoLayer::new(Duration::from_secs(60), Duration::from_secs(300), Options::default());
//!
//! let mut client = ServiceBuilder::new()
//!     .layer(layer)
//!     .service(tower::service_fn(|_req: http::Request<()>| async {
//!         Ok::<_, std::convert::Infallible>(http::Response::new(http_body_util::Full::from("ok")))
//!     }));
//!
//! let request = http::Request::get("https://management.example.com/sites").body(())?;
//! let response = client.ready().await?.call(request).await?;
//! # drop(response);
//! # Ok(())
//! # }
//! ```
//!
//! Failed fetches are shared with every caller waiting on them but never
//! stored, so a transient upstream error does not stick in the cache.

pub mod config;
pub mod error;
pub mod key;
pub mod layer;
pub mod logging;
pub mod memoizer;
pub mod prelude;
pub mod request_id;
pub mod response;
pub mod stats;
mod sweeper;

pub use config::{MemoConfig, Options};
pub use error::MemoError;
pub use key::CacheKey;
pub use layer::{MemoLayer, MemoLayerBuilder, MemoService};
pub use memoizer::{Memoized, Memoizer, Source, NO_CLEANUP, NO_EXPIRATION};
pub use response::CachedResponse;
