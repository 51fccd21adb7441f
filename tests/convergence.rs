//! Active-pointer convergence tests
//!
//! Every node must end with the same active entity per pointer, whatever the
//! order deployments arrive in and however often they are delivered.

mod common;

use catalyst_content::deployer::DeployOutcome;
use catalyst_content::time_range::TimeRange;
use catalyst_content::types::{DeletionState, Entity, EntityType};
use common::*;
use futures::StreamExt;
use std::collections::{BTreeSet, HashMap};

fn files_for(entity: &Entity) -> HashMap<String, Vec<u8>> {
    HashMap::from([(entity.content[0].hash.clone(), file_bytes(&entity.id))])
}

async fn active_set(node: &catalyst_content::CatalystNode) -> BTreeSet<String> {
    node.active_deployments_in_range(TimeRange::new(0, u64::MAX))
        .map(|d| d.unwrap().entity.id)
        .collect()
        .await
}

fn permutations<T: Clone>(items: &[T]) -> Vec<Vec<T>> {
    if items.len() <= 1 {
        return vec![items.to_vec()];
    }
    let mut out = Vec::new();
    for i in 0..items.len() {
        let mut rest = items.to_vec();
        let head = rest.remove(i);
        for mut tail in permutations(&rest) {
            tail.insert(0, head.clone());
            out.push(tail);
        }
    }
    out
}

/// Overlapping multi-pointer entities resolve the same way in every order
#[tokio::test]
async fn test_resolution_is_order_independent() {
    let a = scene("aaa", &["1,1", "1,2"], 10);
    let b = scene("bbb", &["1,2", "1,3"], 20);
    let c = scene("ccc", &["1,3"], 15);
    let d = scene("ddd", &["9,9"], 5);

    let network = FakeNetwork::new();
    let mut outcomes = BTreeSet::new();

    for order in permutations(&[a, b, c, d]) {
        let test = test_node(&network, &[], test_config(), 1_000);
        for entity in order {
            let files = files_for(&entity);
            test.node.deploy_local(entity, files).await.unwrap();
        }
        outcomes.insert(active_set(&test.node).await.into_iter().collect::<Vec<_>>());
    }

    assert_eq!(outcomes.len(), 1);
    assert_eq!(
        outcomes.into_iter().next().unwrap(),
        vec!["bbb".to_string(), "ddd".to_string()]
    );
}

/// Exactly one of two conflicting deployments is active, the greater (timestamp, id)
#[tokio::test]
async fn test_pairwise_conflict_has_one_winner() {
    let network = FakeNetwork::new();
    let older = scene("zzz", &["0,0"], 10);
    let newer = scene("aaa", &["0,0"], 11);

    for order in [[older.clone(), newer.clone()], [newer.clone(), older.clone()]] {
        let test = test_node(&network, &[], test_config(), 1_000);
        for entity in order {
            let files = files_for(&entity);
            test.node.deploy_local(entity, files).await.unwrap();
        }
        assert_eq!(active_ids(&test.node, EntityType::Scene, "0,0"), vec!["aaa"]);
    }
}

/// Pointers are compared case-insensitively and per entity type
#[tokio::test]
async fn test_pointer_case_and_type_scoping() {
    let network = FakeNetwork::new();
    let test = test_node(&network, &[], test_config(), 1_000);

    let profile_a = entity("p-old", EntityType::Profile, &["0xABC"], 10);
    let profile_b = entity("p-new", EntityType::Profile, &["0xabc"], 20);
    let wearable = entity("w-1", EntityType::Wearable, &["0xabc"], 5);

    for e in [profile_a, profile_b, wearable] {
        let files = files_for(&e);
        test.node.deploy_local(e, files).await.unwrap();
    }

    assert_eq!(active_ids(&test.node, EntityType::Profile, "0xabc"), vec!["p-new"]);
    assert_eq!(active_ids(&test.node, EntityType::Wearable, "0xabc"), vec!["w-1"]);
}

/// Re-applying tombstoned or known deployments changes nothing
#[tokio::test]
async fn test_redelivery_is_a_no_op() {
    let network = FakeNetwork::new();
    let test = test_node(&network, &[], test_config(), 1_000);

    let loser = scene("e1", &["0,0"], 10);
    let winner = scene("e2", &["0,0"], 20);
    for e in [loser.clone(), winner.clone()] {
        let files = files_for(&e);
        test.node.deploy_local(e, files).await.unwrap();
    }
    let before = test.node.stats().unwrap();

    for e in [loser, winner] {
        let files = files_for(&e);
        let outcome = test.node.deploy_local(e, files).await.unwrap();
        assert_eq!(outcome, DeployOutcome::AlreadyDeployed);
    }

    assert_eq!(test.node.stats().unwrap(), before);
    assert_eq!(active_ids(&test.node, EntityType::Scene, "0,0"), vec!["e2"]);
}

/// A fresh node pulling {E1@10, E2@20 over the same pointer} keeps both, E2 active
#[tokio::test]
async fn test_fresh_node_pulls_overwritten_history() {
    let network = FakeNetwork::new();
    network.publish("http://p1", scene("E1", &["0,0"], 10), 1);
    network.publish("http://p1", scene("E2", &["0,0"], 20), 2);

    let test = test_node(&network, &["http://p1"], test_config(), 1_000);
    test.node.refresh_cluster().await.unwrap();
    test.node.sync_once().await;

    assert_eq!(active_ids(&test.node, EntityType::Scene, "0,0"), vec!["E2"]);

    let e1 = test.node.deployment("E1").unwrap().unwrap();
    let e2 = test.node.deployment("E2").unwrap().unwrap();
    assert_eq!(e1.deletion, DeletionState::SupersededBy(e2.id));
    assert!(e2.is_active());
    assert_eq!(test.node.stats().unwrap().deployments, 2);
}

/// Equal timestamps are broken by entity id, on every node, in every arrival order
#[tokio::test]
async fn test_timestamp_tie_broken_by_entity_id() {
    let network = FakeNetwork::new();
    network.publish("http://p1", scene("aaa", &["5,5"], 5), 1);
    network.publish("http://p2", scene("bbb", &["5,5"], 5), 1);

    // One node hears from p1 first, the other from p2 first
    for (first, second) in [("http://p1", "http://p2"), ("http://p2", "http://p1")] {
        let test = test_node(&network, &[first], test_config(), 1_000);
        test.node.refresh_cluster().await.unwrap();
        test.node.sync_once().await;

        test.directory.add(second);
        test.node.refresh_cluster().await.unwrap();
        test.node.sync_once().await;

        assert_eq!(active_ids(&test.node, EntityType::Scene, "5,5"), vec!["bbb"]);
        assert!(!test.node.deployment("aaa").unwrap().unwrap().is_active());
    }
}

/// Local timestamps stay strictly increasing when the node clock goes backwards
#[tokio::test]
async fn test_local_timestamps_survive_clock_regression() {
    let network = FakeNetwork::new();
    let test = test_node(&network, &[], test_config(), 5_000);

    let first = scene("e1", &["0,0"], 10);
    let files = files_for(&first);
    let DeployOutcome::Deployed(a) = test.node.deploy_local(first, files).await.unwrap() else {
        panic!("expected a new deployment");
    };

    test.clock.set(100);
    let second = scene("e2", &["0,1"], 10);
    let files = files_for(&second);
    let DeployOutcome::Deployed(b) = test.node.deploy_local(second, files).await.unwrap() else {
        panic!("expected a new deployment");
    };

    assert_eq!(a.local_timestamp, 5_000);
    assert!(b.local_timestamp > a.local_timestamp);
}

/// Overwritten deployments stay in the pointer history, tombstoned by the winner
#[tokio::test]
async fn test_pointer_history_keeps_overwritten_deployments() {
    let network = FakeNetwork::new();
    let test = test_node(&network, &[], test_config(), 1_000);

    for e in [scene("old", &["3,3"], 10), scene("new", &["3,3"], 20)] {
        let files = files_for(&e);
        test.node.deploy_local(e, files).await.unwrap();
    }

    let history = test.node.pointer_history(EntityType::Scene, "3,3").unwrap();
    let ids: Vec<&str> = history.iter().map(|d| d.entity.id.as_str()).collect();
    assert_eq!(ids, vec!["old", "new"]);
    assert!(!history[0].is_active());
    assert!(history[1].is_active());

    let everything: Vec<String> = test
        .node
        .all_active_deployments()
        .map(|d| d.unwrap().entity.id)
        .collect()
        .await;
    assert_eq!(everything, vec!["new"]);
}
