//! Integration tests for the metrics endpoint

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tiered_blockstore::{
    AllocatorKind, BlockStoreLocation, DirSpec, MetricsEndpoint, NoopEvictor, RetryConfig,
    StorageHierarchy, TierSpec, TieredBlockStore,
};
use tokio::net::TcpListener;
use tokio::time::timeout;

async fn start() -> (Arc<TieredBlockStore>, String, tokio::task::JoinHandle<()>) {
    let hierarchy = StorageHierarchy::new(vec![
        TierSpec {
            alias: "MEM".to_string(),
            ordinal: 0,
            dirs: vec![DirSpec {
                path: PathBuf::from("/mnt/ramdisk"),
                capacity_bytes: 1000,
            }],
        },
        TierSpec {
            alias: "SSD".to_string(),
            ordinal: 1,
            dirs: vec![DirSpec {
                path: PathBuf::from("/mnt/ssd0"),
                capacity_bytes: 5000,
            }],
        },
    ])
    .unwrap();
    let store = Arc::new(
        TieredBlockStore::new(
            Arc::new(hierarchy),
            AllocatorKind::FirstFit,
            Arc::new(NoopEvictor),
            RetryConfig::default(),
        )
        .unwrap(),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let endpoint = MetricsEndpoint::new(Arc::clone(&store), listener.local_addr().unwrap());
    let handle = tokio::spawn(async move {
        let _ = endpoint.serve(listener).await;
    });

    (store, base, handle)
}

async fn get(url: &str) -> reqwest::Response {
    timeout(Duration::from_secs(2), reqwest::get(url))
        .await
        .expect("request timed out")
        .expect("request failed")
}

#[tokio::test]
async fn test_metrics_endpoint_serves_metrics() {
    let (store, base, handle) = start().await;

    let mut temp = store
        .create_block(1, 1, &BlockStoreLocation::any_tier(), 400)
        .await
        .unwrap();
    store.commit_block(&mut temp).unwrap();

    let response = get(&format!("{}/metrics", base)).await;
    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains("tiered_blockstore_allocations_total"));
    assert!(body.contains("tiered_blockstore_tier_committed_bytes{tier=\"MEM\"} 400"));
    assert!(body.contains("tiered_blockstore_tier_capacity_bytes{tier=\"SSD\"} 5000"));

    handle.abort();
}

#[tokio::test]
async fn test_capacity_report() {
    let (store, base, handle) = start().await;
    let _temp = store
        .create_block(1, 1, &BlockStoreLocation::any_dir_in_tier("SSD"), 250)
        .await
        .unwrap();

    let response = get(&format!("{}/capacity", base)).await;
    assert_eq!(response.status(), 200);
    let report: serde_json::Value = serde_json::from_str(&response.text().await.unwrap()).unwrap();
    assert_eq!(report["allocator"], "first_fit");
    assert_eq!(report["capacity_bytes"], 6000);
    assert_eq!(report["committed_bytes"], 250);
    assert_eq!(report["temp_blocks"], 1);
    assert_eq!(report["tiers"][1]["alias"], "SSD");
    assert_eq!(report["tiers"][1]["dirs"][0]["path"], "/mnt/ssd0");

    handle.abort();
}

#[tokio::test]
async fn test_health_and_not_found() {
    let (_store, base, handle) = start().await;

    let response = get(&format!("{}/health", base)).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "OK");

    let response = get(&format!("{}/does-not-exist", base)).await;
    assert_eq!(response.status(), 404);

    handle.abort();
}
