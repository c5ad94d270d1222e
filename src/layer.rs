use std::error::Error as StdError;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{Request, Response};
use http_body::Body;
use http_body_util::{BodyExt, Full};
use tower::{Layer, Service};

#[cfg(feature = "metrics")]
use metrics::counter;

use crate::config::{MemoConfig, Options};
use crate::error::MemoError;
use crate::key::CacheKey;
use crate::logging::{LoggingConfig, MemoEvent, MemoEventType};
use crate::memoizer::{Memoizer, NO_CLEANUP, NO_EXPIRATION};
use crate::request_id::RequestId;
use crate::response::CachedResponse;

pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Tower layer that memoizes `GET` responses.
///
/// Every `GET` (compared case-insensitively) is keyed by method and full URI
/// and served through a [`Memoizer`]: repeated requests are answered from the
/// cache and concurrent identical requests share a single call to the inner
/// service. Requests with any other method are forwarded untouched.
///
/// Each layer built with [`MemoLayer::new`] or the builder owns a separate
/// cache. Cloning the layer, or calling [`Layer::layer`] several times, shares
/// that cache.
///
/// The inner service readied by `poll_ready` is the one that handles the
/// call. On a hit, or when joining another caller's fetch, it is dropped
/// without being called, which releases any capacity it reserved (for
/// example a `ConcurrencyLimit` permit).
///
/// Response bodies are buffered on both paths. Bypassed responses are
/// collected into [`Full<Bytes>`] before the call resolves, so a body error
/// fails the call itself instead of surfacing while the body is read.
#[derive(Clone)]
pub struct MemoLayer {
    memoizer: Arc<Memoizer<CachedResponse>>,
    logging: LoggingConfig,
    options: Options,
}

/// Builder for [`MemoLayer`].
#[derive(Debug, Clone, Default)]
pub struct MemoLayerBuilder {
    expiration: Duration,
    cleanup_interval: Duration,
    logging: LoggingConfig,
    options: Options,
}

impl MemoLayerBuilder {
    pub fn new() -> Self {
        Self {
            expiration: NO_EXPIRATION,
            cleanup_interval: NO_CLEANUP,
            logging: LoggingConfig::default(),
            options: Options::default(),
        }
    }

    /// How long an entry stays valid after it is stored. Zero keeps entries
    /// for the lifetime of the layer.
    pub fn expiration(mut self, expiration: Duration) -> Self {
        self.expiration = expiration;
        self
    }

    /// How often expired entries are swept. Zero disables the sweep.
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Structured event logging for cache decisions. Off by default.
    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = logging;
        self
    }

    /// Reserved options. Accepted and stored, currently ignored.
    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Builds the layer. Must run inside a tokio runtime if both durations
    /// are positive, otherwise the cleanup sweep is not started.
    pub fn build(self) -> MemoLayer {
        MemoLayer {
            memoizer: Arc::new(Memoizer::new(self.expiration, self.cleanup_interval)),
            logging: self.logging,
            options: self.options,
        }
    }
}

impl MemoLayer {
    /// Creates a layer with its own cache.
    ///
    /// A zero `expiration` disables expiration and a zero `cleanup_interval`
    /// disables the background sweep. `options` is reserved and has no
    /// effect yet.
    pub fn new(expiration: Duration, cleanup_interval: Duration, options: Options) -> Self {
        MemoLayerBuilder::new()
            .expiration(expiration)
            .cleanup_interval(cleanup_interval)
            .options(options)
            .build()
    }

    /// Starts a builder with expiration and cleanup disabled.
    pub fn builder() -> MemoLayerBuilder {
        MemoLayerBuilder::new()
    }

    /// Builds a layer from a deserialized [`MemoConfig`]. Call
    /// [`MemoConfig::validate`] first to reject bad values.
    pub fn from_config(config: &MemoConfig) -> Self {
        MemoLayerBuilder::new()
            .expiration(config.expiration())
            .cleanup_interval(config.cleanup_interval())
            .logging(config.logging.clone())
            .options(config.options.clone())
            .build()
    }

    /// The cache owned by this layer.
    pub fn memoizer(&self) -> &Memoizer<CachedResponse> {
        &self.memoizer
    }

    /// Event logging settings shared by every service this layer wraps.
    pub fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    /// The reserved options this layer was built with.
    pub fn options(&self) -> &Options {
        &self.options
    }
}

impl<S> Layer<S> for MemoLayer {
    type Service = MemoService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MemoService {
            inner,
            memoizer: self.memoizer.clone(),
            logging: self.logging.clone(),
        }
    }
}

/// Service produced by [`MemoLayer`].
#[derive(Clone)]
pub struct MemoService<S> {
    inner: S,
    memoizer: Arc<Memoizer<CachedResponse>>,
    logging: LoggingConfig,
}

impl<S> MemoService<S> {
    /// The wrapped service.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// The cache shared with the layer that built this service.
    pub fn memoizer(&self) -> &Memoizer<CachedResponse> {
        &self.memoizer
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for MemoService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
    ReqBody: Send + 'static,
    ResBody: Body<Data = Bytes> + Send + 'static,
    ResBody::Error: Into<BoxError>,
{
    type Response = Response<Full<Bytes>>;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let key = CacheKey::for_request(req.method(), req.uri());
        // Take the service that `poll_ready` prepared and leave a fresh clone
        // behind for the next call.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let logging = self.logging.clone();
        let request_id = logging.enabled.then(|| RequestId::from_request(&req));

        #[cfg(feature = "tracing")]
        tracing::debug!(method = %req.method(), uri = %req.uri(), cacheable = key.is_some(), "memo_call");

        let Some(key) = key else {
            let method = req.method().clone();
            let uri = req.uri().clone();
            let start = std::time::Instant::now();
            let response = inner.call(req);

            return Box::pin(async move {
                #[cfg(feature = "metrics")]
                counter!("tower_http_memo.bypass").increment(1);

                let response = response.await.map_err(Into::<BoxError>::into)?;
                let (parts, body) = response.into_parts();
                let bytes = BodyExt::collect(body)
                    .await
                    .map_err(Into::<BoxError>::into)?
                    .to_bytes();

                if let Some(request_id) = request_id {
                    MemoEvent::new(MemoEventType::Bypass, request_id, uri.to_string())
                        .with_method(method)
                        .with_uri(uri)
                        .with_status(parts.status)
                        .with_size(bytes.len())
                        .with_latency(start.elapsed())
                        .log(&logging);
                }

                Ok::<_, BoxError>(Response::from_parts(parts, Full::from(bytes)))
            });
        };

        let memoizer = self.memoizer.clone();
        let method = req.method().clone();
        let uri = req.uri().clone();

        Box::pin(async move {
            let start = std::time::Instant::now();
            let result = memoizer
                .memoize(key.clone(), move || {
                    let response = inner.call(req);
                    async move {
                        let response = response.await.map_err(MemoError::upstream)?;
                        CachedResponse::collect(response).await
                    }
                })
                .await;

            let event = request_id.map(|request_id| {
                MemoEvent::new(MemoEventType::Miss, request_id, key.into_string())
                    .with_method(method)
                    .with_uri(uri)
                    .with_latency(start.elapsed())
            });

            match result {
                Ok(memoized) => {
                    let cached = &memoized.value;
                    if let Some(mut event) = event {
                        event.event_type = MemoEventType::from(memoized.source);
                        event
                            .with_status(cached.status())
                            .with_size(cached.body().len())
                            .log(&logging);
                    }
                    Ok(cached.to_response())
                }
                Err(err) => {
                    if let Some(mut event) = event {
                        event.event_type = MemoEventType::FetchError;
                        event.with_error(&err).log(&logging);
                    }
                    Err(BoxError::from(err))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use tower::{service_fn, ServiceExt};

    type Handler = fn(Request<()>) -> BoxFuture<'static, Result<Response<Full<Bytes>>, Infallible>>;

    fn ok_service() -> tower::util::ServiceFn<Handler> {
        fn handle(_req: Request<()>) -> BoxFuture<'static, Result<Response<Full<Bytes>>, Infallible>> {
            Box::pin(async { Ok(Response::new(Full::from("ok"))) })
        }
        service_fn(handle as Handler)
    }

    #[tokio::test]
    async fn memo_service_implements_clone() {
        fn assert_clone<T: Clone>(_: &T) {}

        let layer = MemoLayer::new(NO_EXPIRATION, NO_CLEANUP, Options::default());
        let service = layer.layer(ok_service());
        assert_clone(&service);
    }

    #[tokio::test]
    async fn clones_share_one_cache() {
        let layer = MemoLayer::new(NO_EXPIRATION, NO_CLEANUP, Options::default());
        let copy = layer.clone();
        let service = layer.layer(ok_service());

        service
            .clone()
            .oneshot(Request::get("http://x/a").body(()).expect("request"))
            .await
            .expect("call succeeds");

        assert_eq!(copy.memoizer().len(), 1);
        assert_eq!(service.memoizer().len(), 1);
    }

    #[tokio::test]
    async fn separate_layers_are_isolated() {
        let a = MemoLayer::new(NO_EXPIRATION, NO_CLEANUP, Options::default());
        let b = MemoLayer::new(NO_EXPIRATION, NO_CLEANUP, Options::default());

        a.layer(ok_service())
            .oneshot(Request::get("http://x/a").body(()).expect("request"))
            .await
            .expect("call succeeds");

        assert_eq!(a.memoizer().len(), 1);
        assert!(b.memoizer().is_empty());
    }

    #[tokio::test]
    async fn from_config_applies_durations_and_logging() {
        let config = MemoConfig::from_json(
            r#"{ "expiration_ms": 500, "cleanup_interval_ms": 1000, "logging": { "enabled": true } }"#,
        )
        .expect("valid config");
        let layer = MemoLayer::from_config(&config);

        assert_eq!(layer.memoizer().expiration(), Some(Duration::from_millis(500)));
        assert_eq!(
            layer.memoizer().cleanup_interval(),
            Some(Duration::from_secs(1))
        );
        assert!(layer.memoizer().is_sweeping());
        assert!(layer.logging().enabled);
        assert_eq!(layer.options(), &Options::default());
    }

    #[tokio::test]
    async fn zero_durations_disable_expiry_and_sweep() {
        let layer = MemoLayer::builder().build();
        assert_eq!(layer.memoizer().expiration(), None);
        assert_eq!(layer.memoizer().cleanup_interval(), None);
        assert!(!layer.memoizer().is_sweeping());
    }
}
