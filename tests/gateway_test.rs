mod common;

use std::sync::Arc;
use std::time::Duration;

use common::MemoryBackend;
use serde_json::json;
use school_admin::events::{EventBus, DATA_CHANGED};
use school_admin::gateway::ApiGateway;
use school_admin::supabase::Query;

fn gateway(backend: &MemoryBackend, ttl: Duration) -> ApiGateway {
    ApiGateway::with_ttl(Arc::new(backend.clone()), EventBus::new(), ttl)
}

#[tokio::test]
async fn repeated_reads_share_one_cached_result() {
    let backend = MemoryBackend::new();
    backend.seed("schools", vec![json!({"name": "Lycée Blaise Diagne"}), json!({"name": "École Mariama Bâ"})]);
    let gw = gateway(&backend, Duration::from_secs(60));
    let q = Query::new().order("name", true);

    let first = gw.query("schools", &q).await.unwrap();
    let second = gw.query("schools", &q).await.unwrap();
    assert!(!first.from_cache);
    assert!(second.from_cache);
    assert!(Arc::ptr_eq(&first.data, &second.data));
    assert_eq!(backend.count("select", "schools"), 1);

    // Different options are a different entry.
    let limited = gw.query("schools", &q.clone().limit(1)).await.unwrap();
    assert!(!limited.from_cache);
    assert_eq!(limited.data.len(), 1);
    assert_eq!(gw.stats().entries, 2);
}

#[tokio::test]
async fn writes_invalidate_only_their_table() {
    let backend = MemoryBackend::new();
    backend.seed("schools", vec![json!({"name": "A"})]);
    backend.seed("classes", vec![json!({"name": "CM1"})]);
    let gw = gateway(&backend, Duration::from_secs(60));

    gw.query("schools", &Query::new()).await.unwrap();
    gw.query("classes", &Query::new()).await.unwrap();
    assert_eq!(gw.stats().tables, 2);

    gw.insert("classes", json!({"name": "CM2"})).await.unwrap();
    assert_eq!(gw.stats().tables, 1);

    assert!(gw.query("schools", &Query::new()).await.unwrap().from_cache);
    let classes = gw.query("classes", &Query::new()).await.unwrap();
    assert!(!classes.from_cache);
    assert_eq!(classes.data.len(), 2);
}

#[tokio::test]
async fn entries_expire_after_ttl() {
    let backend = MemoryBackend::new();
    backend.seed("apps", vec![json!({"name": "Gradebook"})]);
    let gw = gateway(&backend, Duration::from_millis(30));

    gw.query("apps", &Query::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    let again = gw.query("apps", &Query::new()).await.unwrap();
    assert!(!again.from_cache);
    assert_eq!(backend.count("select", "apps"), 2);
}

#[tokio::test]
async fn writes_publish_data_changed() {
    let backend = MemoryBackend::new();
    backend.seed("users", vec![json!({"id": "u1", "is_active": true})]);
    let gw = gateway(&backend, Duration::from_secs(60));
    let mut sub = gw.events().subscribe(DATA_CHANGED);

    gw.update("users", &Query::new().eq("id", "u1"), json!({"is_active": false}))
        .await
        .unwrap();
    let event = sub.recv().await.unwrap();
    assert_eq!(event.payload, json!({"table": "users", "op": "update"}));

    gw.delete("users", &Query::new().eq("id", "u1")).await.unwrap();
    assert_eq!(sub.recv().await.unwrap().payload["op"], "delete");
    assert!(backend.rows("users").is_empty());
}

#[tokio::test]
async fn clear_drops_everything() {
    let backend = MemoryBackend::new();
    let gw = gateway(&backend, Duration::from_secs(60));
    gw.query("schools", &Query::new()).await.unwrap();
    gw.query("users", &Query::new()).await.unwrap();
    gw.clear();
    assert_eq!(gw.stats().entries, 0);
}

#[tokio::test]
async fn slow_read_does_not_cache_over_a_write() {
    let backend = MemoryBackend::with_select_delay(Duration::from_millis(80));
    backend.seed("classes", vec![json!({"name": "CP"})]);
    let gw = gateway(&backend, Duration::from_secs(300));
    let q = Query::new();

    let (stale, written) = tokio::join!(gw.query("classes", &q), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        gw.insert("classes", json!({"name": "CE1"})).await
    });
    assert_eq!(stale.unwrap().data.len(), 1);
    written.unwrap();

    let fresh = gw.query("classes", &q).await.unwrap();
    assert!(!fresh.from_cache);
    assert_eq!(fresh.data.len(), 2);
    assert_eq!(gw.stats().entries, 1);
}

#[tokio::test]
async fn clear_during_read_skips_the_fill() {
    let backend = MemoryBackend::with_select_delay(Duration::from_millis(50));
    backend.seed("apps", vec![json!({"slug": "notes"})]);
    let gw = gateway(&backend, Duration::from_secs(300));

    let q = Query::new();
    let (res, _) = tokio::join!(gw.query("apps", &q), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        gw.clear();
    });
    assert!(!res.unwrap().from_cache);
    assert_eq!(gw.stats().tables, 0);
}
