use std::convert::Infallible;
use std::hint::black_box;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use bytes::Bytes;
use criterion::{criterion_group, criterion_main, Criterion};
use http::{Method, Request, Response, StatusCode};
use http_body_util::Full;
use tokio::runtime::Runtime;
use tokio::time::sleep;
use tower::{Layer, ServiceExt};
use tower_http_memo::prelude::*;

fn tokio_runtime() -> &'static Runtime {
    static RUNTIME: OnceLock<Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| Runtime::new().expect("failed to build Tokio runtime"))
}

fn request(method: Method, uri: &str) -> Request<()> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(())
        .expect("valid request")
}

fn bench_layer(c: &mut Criterion) {
    let rt = tokio_runtime();
    let upstream_calls = Arc::new(AtomicUsize::new(0));

    let upstream = tower::service_fn({
        let counter = upstream_calls.clone();
        move |_req: Request<()>| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::Relaxed);
                sleep(Duration::from_micros(200)).await;
                Ok::<_, Infallible>(
                    Response::builder()
                        .status(StatusCode::OK)
                        .header("content-type", "application/json")
                        .body(Full::from(Bytes::from_static(b"{\"value\":[]}")))
                        .expect("valid response"),
                )
            }
        }
    });

    let layer = rt.block_on(async {
        MemoLayer::new(Duration::from_secs(60), Duration::from_secs(30), Options::default())
    });
    let service = layer.layer(upstream);

    let hit_uri = "https://management.example.com/subscriptions/1/sites?api-version=2022-03-01";
    rt.block_on(async {
        service
            .clone()
            .oneshot(request(Method::GET, hit_uri))
            .await
            .expect("warm-up succeeds");
    });

    c.bench_function("memo_layer_hit", |b| {
        b.to_async(rt).iter(|| {
            let service = service.clone();
            async move {
                let response = service
                    .oneshot(request(Method::GET, hit_uri))
                    .await
                    .expect("hit succeeds");
                black_box(response);
            }
        })
    });

    c.bench_function("memo_layer_bypass", |b| {
        b.to_async(rt).iter(|| {
            let service = service.clone();
            async move {
                let response = service
                    .oneshot(request(Method::POST, hit_uri))
                    .await
                    .expect("bypass succeeds");
                black_box(response);
            }
        })
    });

    let mut next = 0u64;
    c.bench_function("memo_layer_miss", |b| {
        b.to_async(rt).iter(|| {
            next += 1;
            let uri = format!("https://management.example.com/sites/{next}");
            let service = service.clone();
            async move {
                let response = service
                    .oneshot(request(Method::GET, &uri))
                    .await
                    .expect("miss succeeds");
                black_box(response);
            }
        })
    });
}

fn bench_key_derivation(c: &mut Criterion) {
    let uri: http::Uri = "https://management.example.com/subscriptions/1/sites?api-version=2022-03-01"
        .parse()
        .expect("valid uri");

    c.bench_function("cache_key_for_request", |b| {
        b.iter(|| black_box(CacheKey::for_request(black_box(&Method::GET), black_box(&uri))))
    });
}

criterion_group!(benches, bench_layer, bench_key_derivation);
criterion_main!(benches);
