//! Run with:
//! RUST_LOG=tower_http_memo=debug cargo run --example memo_demo
//!
//! Lists a paged collection from a slow fake management API four times. The
//! first listing pays for every page; the following ones are served from the
//! memo layer. Each page body is still parsed on every run, since only the
//! raw response is cached.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use serde_json::{json, Value};
use tower::{Service, ServiceBuilder, ServiceExt};
use tower_http_memo::prelude::*;
use tracing_subscriber::EnvFilter;

const BASE: &str = "https://management.example.com/subscriptions/demo/sites";
const PAGES: usize = 3;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let upstream_calls = Arc::new(AtomicUsize::new(0));
    let upstream = tower::service_fn({
        let calls = upstream_calls.clone();
        move |req: Request<()>| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(250)).await;
                Ok::<_, std::convert::Infallible>(fake_page(&req))
            }
        }
    });

    let mut client = ServiceBuilder::new()
        .layer(MemoLayer::new(NO_EXPIRATION, NO_CLEANUP, Options::default()))
        .service(upstream);

    for _ in 0..4 {
        let start = Instant::now();
        let mut site_count = 0;
        let mut next = Some(format!("{BASE}?page=1"));

        while let Some(url) = next.take() {
            let request = Request::get(url.as_str()).body(())?;
            let response = client.ready().await?.call(request).await?;
            let body = response.into_body().collect().await?.to_bytes();
            let page: Value = serde_json::from_slice(&body)?;

            site_count += page["value"].as_array().map_or(0, Vec::len);
            next = page["nextLink"].as_str().map(str::to_owned);
        }

        println!(
            "listWebSites: siteCount: {site_count} (elapsed: {}ms)",
            start.elapsed().as_millis()
        );
    }

    println!(
        "upstream calls: {}",
        upstream_calls.load(Ordering::SeqCst)
    );
    Ok(())
}

fn fake_page(req: &Request<()>) -> Response<Full<Bytes>> {
    let page: usize = req
        .uri()
        .query()
        .and_then(|q| q.strip_prefix("page="))
        .and_then(|n| n.parse().ok())
        .unwrap_or(1);

    let sites: Vec<Value> = (0..50)
        .map(|i| json!({ "name": format!("site-{page}-{i}") }))
        .collect();
    let next = (page < PAGES).then(|| format!("{BASE}?page={}", page + 1));

    let body = json!({ "value": sites, "nextLink": next }).to_string();
    let mut response = Response::new(Full::from(body));
    *response.status_mut() = StatusCode::OK;
    response
}
