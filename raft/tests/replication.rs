use std::time::Duration;

use raft::message::ExecuteResponse;
use raft::Role;

use common::*;

mod common;

fn execute_ok(node: &TestNode, command: &str) {
    match node.execute(command.to_owned()) {
        ExecuteResponse::Done { ok, .. } => assert!(ok, "command {:?} was refused", command),
        other => panic!("command {:?} failed: {:?}", command, other),
    }
}

#[test]
fn committed_commands_reach_every_replica() {
    let cluster = TestCluster::launch(3);
    assert!(wait_until(Duration::from_secs(2), || {
        cluster
            .nodes
            .iter()
            .all(|node| node.leader_hint() == Some(test_addr(0)))
    }));

    let commands = ["set x 1", "append x a", "append x b"];
    for command in commands {
        execute_ok(&cluster.nodes[0], command);
    }

    let expected: Vec<String> = commands.iter().map(|c| (*c).to_owned()).collect();
    assert!(wait_until(Duration::from_secs(2), || {
        (0..3).all(|i| cluster.applied_log(i) == expected)
    }));

    let reference = cluster.nodes[0].log_snapshot();
    for node in &cluster.nodes {
        assert_eq!(node.log_snapshot(), reference);
        assert_eq!(node.commit_index(), 2);
        assert_eq!(node.last_applied(), 2);
    }
}

#[test]
fn applied_sequences_stay_prefix_ordered() {
    let cluster = TestCluster::launch(3);
    assert!(wait_until(Duration::from_secs(2), || {
        cluster
            .nodes
            .iter()
            .all(|node| node.leader_hint() == Some(test_addr(0)))
    }));

    for i in 0..5 {
        execute_ok(&cluster.nodes[0], &format!("set k{} {}", i, i));
    }

    // while replication is in flight, every pair of replicas must agree on
    // their common prefix
    for _ in 0..20 {
        let logs: Vec<Vec<String>> = (0..3).map(|i| cluster.applied_log(i)).collect();
        for a in &logs {
            for b in &logs {
                let shared = a.len().min(b.len());
                assert_eq!(&a[..shared], &b[..shared]);
            }
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    assert!(wait_until(Duration::from_secs(2), || {
        (0..3).all(|i| cluster.applied_log(i).len() == 5)
    }));
}

#[test]
fn partitioned_leader_discards_uncommitted_entries() {
    let cluster = TestCluster::launch(3);
    assert!(wait_until(Duration::from_secs(2), || {
        cluster
            .nodes
            .iter()
            .all(|node| node.leader_hint() == Some(test_addr(0)))
    }));
    execute_ok(&cluster.nodes[0], "set a 1");

    cluster.isolate(0);

    // without a majority the stray entry stays uncommitted
    match cluster.nodes[0].execute("set stray 1".to_owned()) {
        ExecuteResponse::Failed { error, .. } => assert_eq!(error, "replication failed"),
        other => panic!("stray entry must not commit: {:?}", other),
    }
    assert_eq!(cluster.nodes[0].log_snapshot().len(), 2);
    assert_eq!(cluster.nodes[0].commit_index(), 0);

    // the surviving majority elects a leader and moves on
    let new_leader = cluster.execute_until_committed(&[1, 2], "set b 2", Duration::from_secs(5));

    cluster.heal();

    // the deposed leader is walked back onto the majority log
    assert!(wait_until(Duration::from_secs(3), || {
        cluster.nodes[0].role() == Role::Follower
            && cluster.nodes[0].log_snapshot() == new_leader.log_snapshot()
    }));

    // every replica applied the same sequence; the stray command is gone
    assert!(wait_until(Duration::from_secs(2), || {
        let reference = cluster.applied_log(0);
        !reference.is_empty() && (1..3).all(|i| cluster.applied_log(i) == reference)
    }));
    let applied = cluster.applied_log(0);
    assert_eq!(applied[0], "set a 1");
    assert!(applied.contains(&"set b 2".to_owned()));
    assert!(!applied.contains(&"set stray 1".to_owned()));
}
