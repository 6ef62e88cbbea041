//! Failure detection, failover and slot conflict resolution across nodes.

use watchdog_cluster::{ClusterEvent, ClusterHealth};

use crate::helpers::TestCluster;

#[tokio::test]
async fn unreachable_primary_is_marked_failed() {
    let cluster = TestCluster::with_primaries(3);
    cluster.join_all().await;

    let victim = cluster.node(2).id();
    cluster.stop(2);

    for i in 0..2 {
        cluster
            .wait_until(i, "victim flagged FAIL", move |s| {
                s.lookup(&victim).is_some_and(|n| n.flags.fail)
            })
            .await;
        cluster
            .wait_until(i, "cluster down", |s| s.health == ClusterHealth::Fail)
            .await;
    }
    let events = cluster.node(0).events();
    assert!(events.contains(&ClusterEvent::NodeFailed(victim)), "{events:?}");
}

#[tokio::test]
async fn returning_primary_clears_fail() {
    let cluster = TestCluster::with_primaries(3);
    cluster.join_all().await;

    let victim = cluster.node(2).id();
    cluster.stop(2);
    cluster
        .wait_until(0, "victim flagged FAIL", move |s| {
            s.lookup(&victim).is_some_and(|n| n.flags.fail)
        })
        .await;

    cluster.restart(2);
    for i in 0..2 {
        cluster
            .wait_until(i, "victim healthy again", move |s| {
                s.lookup(&victim).is_some_and(|n| !n.is_failing())
            })
            .await;
        cluster
            .wait_until(i, "cluster up", |s| s.health == ClusterHealth::Ok)
            .await;
    }
    let events = cluster.node(0).events();
    assert!(events.contains(&ClusterEvent::NodeRecovered(victim)), "{events:?}");
}

#[tokio::test]
async fn replica_replaces_failed_primary() {
    let mut cluster = TestCluster::with_primaries(3);
    let replica = cluster.add_replica(0);
    cluster.join_all().await;
    cluster.settle_epochs().await;

    let old = cluster.node(0).id();
    let new = cluster.node(replica).id();
    let epoch_before = cluster.node(1).bus.current_epoch().await;
    cluster.stop(0);

    cluster
        .wait_until(replica, "promoted to primary", |s| {
            s.myself().is_primary() && s.myself().slots.contains(0)
        })
        .await;
    let events = cluster.node(replica).events();
    assert!(
        events
            .iter()
            .any(|e| matches!(e, ClusterEvent::FailoverWon { replaced, .. } if *replaced == old)),
        "{events:?}"
    );

    for i in 1..3 {
        cluster
            .wait_until(i, "slots moved to the replica", move |s| {
                s.slot_owner(0).map(|n| n.id) == Some(new)
                    && s.slot_owner(5460).map(|n| n.id) == Some(new)
            })
            .await;
        cluster
            .wait_until(i, "cluster up again", |s| s.health == ClusterHealth::Ok)
            .await;
    }
    // the winner took a fresh epoch, which everyone adopted
    let promoted_epoch = cluster
        .node(1)
        .check(move |s| s.lookup(&new).map(|n| n.config_epoch))
        .await;
    assert!(
        promoted_epoch.is_some_and(|e| e > epoch_before),
        "{promoted_epoch:?} <= {epoch_before}"
    );
    assert!(cluster.node(1).bus.current_epoch().await > epoch_before);
}

#[tokio::test]
async fn returning_primary_becomes_replica() {
    let mut cluster = TestCluster::with_primaries(3);
    let replica = cluster.add_replica(0);
    cluster.join_all().await;
    cluster.settle_epochs().await;

    let new = cluster.node(replica).id();
    cluster.stop(0);
    for i in 1..3 {
        cluster
            .wait_until(i, "slots moved to the replica", move |s| {
                s.slot_owner(0).map(|n| n.id) == Some(new)
            })
            .await;
    }

    // node 0 comes back still claiming its old slots at a stale epoch
    cluster.restart(0);
    cluster
        .wait_until(0, "demoted to replica of the winner", move |s| {
            s.myself().primary_id() == Some(new) && s.myself().slots.is_empty()
        })
        .await;
    let events = cluster.node(0).events();
    assert!(events.contains(&ClusterEvent::BecameReplica(new)), "{events:?}");

    let old = cluster.node(0).id();
    cluster
        .wait_until(1, "old primary seen as replica", move |s| {
            s.lookup(&old).and_then(|n| n.primary_id()) == Some(new)
        })
        .await;
    let owner = cluster.node(1).check(|s| s.slot_owner(0).map(|n| n.id)).await;
    assert_eq!(owner, Some(new));
}
