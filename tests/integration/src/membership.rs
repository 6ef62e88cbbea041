//! Cluster formation: MEET, gossip discovery and epoch bookkeeping.

use std::collections::HashSet;

use watchdog_cluster::{ClusterEvent, ClusterHealth};

use crate::helpers::TestCluster;

#[tokio::test]
async fn three_primaries_converge() {
    let cluster = TestCluster::with_primaries(3);
    cluster.join_all().await;

    for i in 0..3 {
        cluster
            .wait_until(i, "healthy cluster", |s| s.health == ClusterHealth::Ok)
            .await;
        let info = cluster.node(i).bus.cluster_info().await;
        assert!(info.contains("cluster_state:ok"), "node {i}: {info}");
        assert!(info.contains("cluster_known_nodes:3"), "node {i}: {info}");
        assert!(info.contains("cluster_slots_assigned:16384"), "node {i}: {info}");
        assert!(info.contains("cluster_size:3"), "node {i}: {info}");
    }

    let last = cluster.node(2).id();
    let owner = cluster.node(0).check(|s| s.slot_owner(16383).map(|n| n.id)).await;
    assert_eq!(owner, Some(last));
}

#[tokio::test]
async fn met_nodes_are_announced() {
    let cluster = TestCluster::with_primaries(3);
    cluster.join_all().await;

    let events = cluster.node(0).events();
    for i in 1..3 {
        let id = cluster.node(i).id();
        assert!(
            events
                .iter()
                .any(|e| matches!(e, ClusterEvent::NodeAdded(added, _) if *added == id)),
            "node 0 never announced node {i}: {events:?}"
        );
    }
}

#[tokio::test]
async fn gossip_introduces_nodes_that_never_met() {
    let cluster = TestCluster::with_primaries(3);
    // 1 and 2 only ever meet node 0
    cluster.meet(1, 0).await;
    cluster.meet(2, 0).await;

    let two = cluster.node(2).id();
    cluster
        .wait_until(1, "node 2 known by name", move |s| {
            s.lookup(&two).is_some_and(|n| n.link.is_some())
        })
        .await;
}

#[tokio::test]
async fn config_epochs_become_unique() {
    let cluster = TestCluster::with_primaries(3);
    cluster.join_all().await;

    for i in 0..3 {
        cluster
            .wait_until(i, "distinct config epochs", |s| {
                let epochs: HashSet<u64> = s.primaries().map(|n| n.config_epoch).collect();
                epochs.len() == 3
            })
            .await;
    }
    let epoch = cluster.node(0).bus.current_epoch().await;
    assert!(epoch >= 2, "current epoch {epoch}");
}

#[tokio::test]
async fn replica_is_known_with_its_primary() {
    let mut cluster = TestCluster::with_primaries(3);
    let replica = cluster.add_replica(0);
    cluster.join_all().await;

    let primary = cluster.node(0).id();
    let id = cluster.node(replica).id();
    for i in 0..3 {
        cluster
            .wait_until(i, "replica role", move |s| {
                s.lookup(&id).and_then(|n| n.primary_id()) == Some(primary)
            })
            .await;
    }
    // replicas don't count toward the cluster size
    let size = cluster.node(1).check(|s| s.cluster_size()).await;
    assert_eq!(size, 3);
}

#[tokio::test]
async fn message_counters() {
    let cluster = TestCluster::with_primaries(2);
    cluster.join_all().await;

    let stats = cluster.node(1).bus.stats();
    assert!(stats.total_sent() > 0);
    assert!(stats.total_received() > 0);

    let info = cluster.node(1).bus.cluster_info().await;
    assert!(info.contains("cluster_stats_messages_meet_sent:"), "{info}");
    assert!(info.contains("cluster_stats_messages_pong_received:"), "{info}");
}
