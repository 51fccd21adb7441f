//! Garbage collection tests

mod common;

use catalyst_content::blob_store::ContentStorage;
use catalyst_content::types::Entity;
use common::*;
use std::collections::HashMap;

const MINUTE: u64 = 60_000;

async fn deploy(test: &TestNode, entity: Entity) {
    let files = HashMap::from([(entity.content[0].hash.clone(), file_bytes(&entity.id))]);
    test.node.deploy_local(entity, files).await.unwrap();
}

/// Superseded content and orphans go; active content and snapshot manifests stay
#[tokio::test]
async fn test_collects_only_unreferenced_blobs() {
    let network = FakeNetwork::new();
    let test = test_node(&network, &[], test_config(), 1_000);

    let old = scene("old", &["0,0"], 10);
    let new = scene("new", &["0,0"], 20);
    let old_hash = old.content[0].hash.clone();
    let new_hash = new.content[0].hash.clone();
    deploy(&test, old).await;
    deploy(&test, new).await;
    test.storage.store("orphan", b"nobody wants me").await.unwrap();

    let cycle = test.node.run_snapshot_cycle().await.unwrap();
    let manifest = cycle.generated[0].hash.clone();

    test.clock.advance(2 * MINUTE);
    let report = test.node.collect_garbage().await.unwrap();

    let mut deleted = report.deleted.clone();
    deleted.sort();
    let mut expected = vec![old_hash, "old".to_string(), "orphan".to_string()];
    expected.sort();
    assert_eq!(deleted, expected);

    for kept in [new_hash.as_str(), "new", manifest.as_str()] {
        assert!(test.storage.contains(kept), "{} was collected", kept);
    }
}

/// Blobs younger than the grace period survive even when unreferenced
#[tokio::test]
async fn test_grace_period_protects_recent_blobs() {
    let network = FakeNetwork::new();
    let test = test_node(&network, &[], test_config(), 1_000);

    test.storage.store("stale", b"a").await.unwrap();
    test.clock.advance(2 * MINUTE);
    test.storage.store("fresh", b"b").await.unwrap();
    test.clock.advance(MINUTE / 2);

    let report = test.node.collect_garbage().await.unwrap();
    assert_eq!(report.deleted, vec!["stale".to_string()]);
    assert_eq!(report.recent, 1);
    assert!(test.storage.contains("fresh"));

    test.clock.advance(MINUTE);
    let report = test.node.collect_garbage().await.unwrap();
    assert_eq!(report.deleted, vec!["fresh".to_string()]);
}

/// No sweep ever removes content of an active deployment
#[tokio::test]
async fn test_active_content_is_never_collected() {
    let network = FakeNetwork::new();
    let test = test_node(&network, &[], test_config(), 1_000);

    // Chains of overwrites on a handful of pointers
    for i in 0..30u64 {
        let pointer = format!("{},0", i % 4);
        deploy(&test, scene(&format!("e{:02}", i), &[&pointer], 10 + i)).await;
        test.clock.advance(MINUTE);
        test.node.collect_garbage().await.unwrap();
    }

    for i in 26..30u64 {
        let id = format!("e{:02}", i);
        let deployment = test.node.deployment(&id).unwrap().unwrap();
        assert!(deployment.is_active());
        assert!(test.storage.contains(&deployment.entity.content[0].hash));
        assert!(test.storage.contains(&id));
    }
    let report = test.node.collect_garbage().await.unwrap();
    assert_eq!(report.referenced, 8);
}

/// A deployment that reuses superseded content while a sweep is in flight
/// keeps that content, even though the sweep read its references earlier
#[tokio::test]
async fn test_content_reused_during_sweep_is_kept() {
    let network = FakeNetwork::new();
    let test = test_node(&network, &[], test_config(), 1_000);

    let first = scene("e1", &["0,0"], 10);
    let shared_hash = first.content[0].hash.clone();
    deploy(&test, first).await;
    deploy(&test, scene("e2", &["0,0"], 20)).await;
    test.clock.advance(2 * MINUTE);

    // e3 points at e1's content, now unreferenced and past the grace period
    let mut reuser = scene("e3", &["0,1"], 30);
    reuser.content[0].hash = shared_hash.clone();
    let files = HashMap::from([(shared_hash.clone(), file_bytes("e1"))]);

    let (reached, release) = test.storage.pause_next_list();
    let (report, ()) = tokio::join!(test.node.collect_garbage(), async {
        reached.await.unwrap();
        test.node.deploy_local(reuser, files).await.unwrap();
        release.send(()).unwrap();
    });
    let report = report.unwrap();

    assert!(!report.deleted.contains(&shared_hash));
    assert!(report.deleted.contains(&"e1".to_string()));
    assert!(test.node.deployment("e3").unwrap().unwrap().is_active());
    assert!(test.storage.contains(&shared_hash));
}

/// Reusing a stored blob without uploading it again still refreshes it
#[tokio::test]
async fn test_reuse_without_upload_refreshes_blob() {
    let network = FakeNetwork::new();
    let test = test_node(&network, &[], test_config(), 1_000);

    let first = scene("e1", &["0,0"], 10);
    let shared_hash = first.content[0].hash.clone();
    deploy(&test, first).await;
    deploy(&test, scene("e2", &["0,0"], 20)).await;
    test.clock.advance(2 * MINUTE);

    let mut reuser = scene("e3", &["0,1"], 30);
    reuser.content[0].hash = shared_hash.clone();

    let (reached, release) = test.storage.pause_next_list();
    let (report, ()) = tokio::join!(test.node.collect_garbage(), async {
        reached.await.unwrap();
        test.node.deploy_local(reuser, HashMap::new()).await.unwrap();
        release.send(()).unwrap();
    });

    assert!(!report.unwrap().deleted.contains(&shared_hash));
    assert!(test.storage.contains(&shared_hash));
}
