use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use pricewatch_adapters::{FetchTier, HttpTier};
use pricewatch_core::{FetchTarget, ItemId};
use pricewatch_storage::{HttpClientConfig, HttpFetcher};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn fixture(name: &str) -> String {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/pages")
        .join(name);
    std::fs::read_to_string(path).expect("fixture")
}

/// Serves the same canned response to every request; returns base url and hit counter.
async fn serve(status_line: &'static str, body: String) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let body = body.clone();
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let response = format!(
                    "HTTP/1.1 {status_line}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (format!("http://{addr}"), hits)
}

fn direct_tier() -> HttpTier {
    let http = HttpFetcher::new(HttpClientConfig::default()).expect("http client");
    HttpTier::direct(Arc::new(http))
}

#[tokio::test]
async fn repeated_fetches_of_the_same_item_each_return_a_result() {
    let (base, hits) = serve("200 OK", fixture("product_in_stock.html")).await;
    let tier = direct_tier();
    let target = FetchTarget::new(ItemId::parse("B00TESTFIX").unwrap(), &base);

    let first = tier.fetch(&target).await.expect("first fetch");
    let second = tier.fetch(&target).await.expect("second fetch");

    let first = first.expect("first call produced a result");
    let second = second.expect("second call produced a result");
    assert_eq!(first.price.as_deref(), Some("1171.00"));
    assert_eq!(first, second);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn concurrent_fetches_of_the_same_item_do_not_share_results() {
    let (base, _hits) = serve("200 OK", fixture("product_in_stock.html")).await;
    let tier = direct_tier();
    let target = FetchTarget::new(ItemId::parse("B00TESTFIX").unwrap(), &base);

    let (a, b) = tokio::join!(tier.fetch(&target), tier.fetch(&target));
    assert!(a.expect("a").is_some());
    assert!(b.expect("b").is_some());
}

#[tokio::test]
async fn forbidden_response_is_reported_as_blocked_not_as_error() {
    let (base, _hits) = serve("403 Forbidden", fixture("captcha_form.html")).await;
    let tier = direct_tier();
    let target = FetchTarget::new(ItemId::parse("B00TESTFIX").unwrap(), &base);

    let result = tier.fetch(&target).await.expect("403 is not a transport error").expect("result");
    assert!(result.blocked);
    assert_eq!(result.price, None);
    assert!(!result.in_stock);
}

#[tokio::test]
async fn unreachable_host_propagates_a_tier_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let tier = direct_tier();
    let target = FetchTarget::new(ItemId::parse("B00TESTFIX").unwrap(), &format!("http://{addr}"));
    assert!(tier.fetch(&target).await.is_err());
}
