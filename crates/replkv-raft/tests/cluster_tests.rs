//! Multi-node scenarios over the in-memory transport.
//!
//! - Election safety while leadership moves
//! - Partition of a follower and convergence after it rejoins
//! - Leader crash with an entry stored on 2 of 3 nodes, before and after
//!   the leader learns it committed
//! - Committed log prefixes and applied state match on every node
//! - Writes against followers are refused
//! - Joining voters, including catch-up by snapshot
//! - Full cluster restart

mod common;

use common::{fast_config, init_tracing, node_ids, Cluster};
use replkv_raft::{Command, KvError, LogEntry, LogIndex, NodeId, Role, Term};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::info;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread")]
async fn test_election_safety_single_leader_per_term() {
    init_tracing();
    let mut cluster = Cluster::bootstrapped(3, fast_config()).await;
    let ids = cluster.ids.clone();
    let first = cluster.wait_for_leader(&ids, WAIT).await;

    let mut leaders: HashMap<Term, HashSet<NodeId>> = HashMap::new();
    for round in 0..80 {
        // Force at least one more election halfway through.
        if round == 40 {
            info!(leader = %first, "Isolating leader");
            cluster.isolate(&first);
        }
        for id in cluster.live() {
            let status = cluster.node(&id).status();
            if status.role == Role::Leader {
                leaders.entry(status.term).or_default().insert(id);
            }
        }
        tokio::time::sleep(Duration::from_millis(15)).await;
    }

    let rest: Vec<NodeId> = ids.iter().filter(|id| **id != first).cloned().collect();
    let second = cluster.wait_for_leader(&rest, WAIT).await;
    assert_ne!(second, first);

    for (term, nodes) in &leaders {
        assert!(nodes.len() <= 1, "term {} had leaders {:?}", term, nodes);
    }
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_isolated_follower_converges_after_rejoin() {
    init_tracing();
    let mut cluster = Cluster::bootstrapped(3, fast_config()).await;
    let ids = cluster.ids.clone();
    let leader = cluster.wait_for_leader(&ids, WAIT).await;
    let isolated = ids.iter().find(|id| **id != leader).cloned().unwrap();
    let majority: Vec<NodeId> = ids.iter().filter(|id| **id != isolated).cloned().collect();

    cluster.isolate(&isolated);
    cluster.write_via(&majority, "user_id", "12345").await;
    for id in &majority {
        assert!(cluster.wait_for_value(id, "user_id", "12345", WAIT).await);
    }
    assert_eq!(cluster.node(&isolated).read("user_id").unwrap(), None);

    cluster.heal(&isolated);
    for id in &ids {
        assert!(
            cluster.wait_for_value(id, "user_id", "12345", WAIT).await,
            "{} never saw user_id",
            id
        );
    }

    // Logs converge: a later write lands at the same index everywhere.
    let ack = cluster.write("after", "rejoin").await;
    for id in &ids {
        assert!(cluster.wait_for_value(id, "after", "rejoin", WAIT).await);
        assert!(cluster.node(id).status().last_applied >= ack.index);
    }
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_leader_crash_preserves_entry_on_two_of_three() {
    init_tracing();
    let mut cluster = Cluster::bootstrapped(3, fast_config()).await;
    let ids = cluster.ids.clone();
    let leader = cluster.wait_for_leader(&ids, WAIT).await;
    let followers: Vec<NodeId> = ids.iter().filter(|id| **id != leader).cloned().collect();
    let (holder, lagging) = (followers[0].clone(), followers[1].clone());

    // Only the leader and `holder` store the entry.
    cluster.isolate(&lagging);
    let ack = cluster
        .write_via(&[leader.clone(), holder.clone()], "k", "durable")
        .await;
    info!(index = %ack.index, "Entry stored on two nodes");

    cluster.stop_node(&leader).await;
    cluster.heal(&lagging);

    // `lagging` misses the entry, so only `holder` can win.
    let survivors = vec![holder.clone(), lagging.clone()];
    let new_leader = cluster.wait_for_leader(&survivors, WAIT).await;
    assert_eq!(new_leader, holder);
    assert!(cluster.wait_for_value(&lagging, "k", "durable", WAIT).await);

    cluster.restart_node(&leader).await;
    assert!(cluster.wait_for_value(&leader, "k", "durable", WAIT).await);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_leader_crash_before_commit_is_known() {
    init_tracing();
    let mut cluster = Cluster::bootstrapped(3, fast_config()).await;
    let ids = cluster.ids.clone();
    let leader = cluster.wait_for_leader(&ids, WAIT).await;
    let followers: Vec<NodeId> = ids.iter().filter(|id| **id != leader).cloned().collect();
    let (holder, lagging) = (followers[0].clone(), followers[1].clone());

    cluster.isolate(&lagging);
    let command = Command::set("k", "in flight").serialize().unwrap();
    let (index, _) = cluster.node(&leader).raft().propose(command).await.unwrap();

    // Crash the leader as soon as the entry reaches `holder`.
    let deadline = Instant::now() + WAIT;
    while cluster.node(&holder).status().last_log_index < index {
        assert!(Instant::now() < deadline, "entry never reached {}", holder);
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    cluster.stop_node(&leader).await;
    cluster.heal(&lagging);

    let survivors = vec![holder.clone(), lagging.clone()];
    let new_leader = cluster.wait_for_leader(&survivors, WAIT).await;
    assert_eq!(new_leader, holder);
    for id in &survivors {
        assert!(cluster.wait_for_value(id, "k", "in flight", WAIT).await);
        assert!(cluster.node(id).status().commit_index >= index);
    }
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_committed_logs_match_after_partition() {
    init_tracing();
    let mut cluster = Cluster::bootstrapped(3, fast_config()).await;
    let ids = cluster.ids.clone();
    let old_leader = cluster.wait_for_leader(&ids, WAIT).await;
    cluster.write("before", "partition").await;

    // The cut-off leader takes entries that can never commit.
    cluster.isolate(&old_leader);
    for i in 0..3 {
        let command = Command::set(format!("lost{}", i), "x").serialize().unwrap();
        let _ = cluster.node(&old_leader).raft().propose(command).await;
    }

    let majority: Vec<NodeId> = ids.iter().filter(|id| **id != old_leader).cloned().collect();
    for i in 0..5 {
        cluster
            .write_via(&majority, &format!("key{}", i), &format!("value {}", i))
            .await;
    }

    cluster.heal(&old_leader);
    let ack = cluster.write("after", "heal").await;
    let deadline = Instant::now() + WAIT;
    while ids
        .iter()
        .any(|id| cluster.node(id).status().last_applied < ack.index)
    {
        assert!(Instant::now() < deadline, "nodes never applied {}", ack.index);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let commit = ids
        .iter()
        .map(|id| cluster.node(id).status().commit_index)
        .min()
        .unwrap();
    let logs: Vec<Vec<LogEntry>> = ids
        .iter()
        .map(|id| {
            cluster
                .node(id)
                .raft()
                .entries(LogIndex(1), commit.as_u64() as usize)
        })
        .collect();
    assert_eq!(logs[0].len() as u64, commit.as_u64());
    for (id, log) in ids.iter().zip(&logs) {
        assert_eq!(log, &logs[0], "{} diverges below commit {}", id, commit);
    }

    let mut keys = vec!["before".to_string(), "after".to_string()];
    keys.extend((0..5).map(|i| format!("key{}", i)));
    for id in &ids {
        for key in &keys {
            assert_eq!(
                cluster.node(id).read(key).unwrap(),
                cluster.node(&ids[0]).read(key).unwrap()
            );
        }
        for i in 0..3 {
            assert_eq!(cluster.node(id).read(&format!("lost{}", i)).unwrap(), None);
        }
    }
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_write_on_follower_returns_not_leader() {
    init_tracing();
    let cluster = Cluster::bootstrapped(3, fast_config()).await;
    let ids = cluster.ids.clone();
    let leader = cluster.wait_for_leader(&ids, WAIT).await;
    let follower = ids.iter().find(|id| **id != leader).cloned().unwrap();

    for _ in 0..100 {
        if cluster.node(&follower).leader().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    match cluster.node(&follower).write("k", "v").await {
        Err(KvError::NotLeader { leader: hint }) => assert_eq!(hint, Some(leader.clone())),
        other => panic!("expected NotLeader, got {:?}", other),
    }
    // Nothing was accepted anywhere.
    tokio::time::sleep(Duration::from_millis(100)).await;
    for id in &ids {
        assert_eq!(cluster.node(id).read("k").unwrap(), None);
    }
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_join_via_add_voter() {
    init_tracing();
    let ids = node_ids(3);
    let mut cluster = Cluster::new(ids.clone(), fast_config());
    for id in &ids {
        cluster.open_node(id).await;
    }
    assert!(cluster.node(&ids[0]).bootstrap().await.unwrap());
    for id in &ids {
        cluster.node(id).start().unwrap();
    }

    // Not voters yet: the others never campaign.
    let first = cluster.wait_for_leader(&ids[..1], WAIT).await;
    assert_eq!(first, ids[0]);
    cluster.write_via(&ids[..1], "before", "join").await;

    cluster.node(&first).add_voter(ids[1].clone()).await.unwrap();
    cluster.node(&first).add_voter(ids[2].clone()).await.unwrap();
    // Adding an existing voter is a no-op.
    cluster.node(&first).add_voter(ids[2].clone()).await.unwrap();

    let status = cluster.node(&first).status();
    assert_eq!(status.membership.len(), 3);
    for id in &ids {
        assert!(cluster.wait_for_value(id, "before", "join", WAIT).await);
    }

    cluster.write("after", "join").await;
    for id in &ids {
        assert!(cluster.wait_for_value(id, "after", "join", WAIT).await);
    }
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_joining_voter_catches_up_from_snapshot() {
    init_tracing();
    let mut config = fast_config();
    config.snapshot_threshold = 5;
    config.trailing_logs = 1;

    let ids = node_ids(2);
    let mut cluster = Cluster::new(ids.clone(), config);
    for id in &ids {
        cluster.open_node(id).await;
    }
    cluster.node(&ids[0]).bootstrap().await.unwrap();
    for id in &ids {
        cluster.node(id).start().unwrap();
    }
    let leader = cluster.wait_for_leader(&ids[..1], WAIT).await;

    for i in 0..12 {
        cluster
            .write_via(&ids[..1], &format!("key{}", i), &format!("value {}", i))
            .await;
    }
    let status = cluster.node(&leader).status();
    assert!(status.snapshot_index > LogIndex(1), "leader never compacted");

    cluster.node(&leader).add_voter(ids[1].clone()).await.unwrap();
    for i in 0..12 {
        assert!(
            cluster
                .wait_for_value(&ids[1], &format!("key{}", i), &format!("value {}", i), WAIT)
                .await
        );
    }
    assert!(cluster.node(&ids[1]).status().snapshot_index > LogIndex::ZERO);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_restarted_follower_catches_up() {
    init_tracing();
    let mut cluster = Cluster::bootstrapped(3, fast_config()).await;
    let ids = cluster.ids.clone();
    let leader = cluster.wait_for_leader(&ids, WAIT).await;
    let follower = ids.iter().find(|id| **id != leader).cloned().unwrap();

    cluster.write("a", "1").await;
    assert!(cluster.wait_for_value(&follower, "a", "1", WAIT).await);

    cluster.stop_node(&follower).await;
    cluster.write("b", "2").await;

    cluster.restart_node(&follower).await;
    // Replayed from its own log on open.
    assert_eq!(cluster.node(&follower).read("a").unwrap(), Some("1".to_string()));
    assert!(cluster.wait_for_value(&follower, "b", "2", WAIT).await);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_full_cluster_restart_keeps_data() {
    init_tracing();
    let mut cluster = Cluster::bootstrapped(3, fast_config()).await;
    let ids = cluster.ids.clone();
    cluster.wait_for_leader(&ids, WAIT).await;
    cluster.write("user_id", "12345").await;
    cluster.write("name", "Ada Lovelace").await;

    for id in &ids {
        cluster.stop_node(id).await;
    }
    for id in &ids {
        cluster.open_node(id).await;
    }
    for id in &ids {
        cluster.node(id).start().unwrap();
    }

    cluster.wait_for_leader(&ids, WAIT).await;
    for id in &ids {
        assert!(cluster.wait_for_value(id, "user_id", "12345", WAIT).await);
        assert!(cluster.wait_for_value(id, "name", "Ada Lovelace", WAIT).await);
    }
    cluster.shutdown().await;
}
