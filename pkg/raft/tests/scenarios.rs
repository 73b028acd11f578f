//! The concrete scenarios from spec.md §8, against a 3-node cohort
//! `{1, 2, 3}` standing in for `{A, B, C}`.

#[path = "common/mod.rs"]
mod common;

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use raft::clock::ScriptedClock;
use raft::consensus::{ConsensusModule, Event};
use raft::messages::{AppendEntriesRequest, Message, MessageBody, RequestVoteResponse};
use raft::state::PersistentState;
use raft::store::Store;
use raft::types::LogEntry;

use common::{new_store, Cluster, TestTransport};

/// Scenario 1: normal election. A's timer fires first, wins unanimously.
#[tokio::test]
async fn normal_election() {
    let mut cluster = Cluster::new(&[1, 2, 3]);

    cluster.tick(1).await;
    cluster.settle().await;

    assert_eq!(cluster.leaders(), vec![1]);
    for id in [1, 2, 3] {
        let node = &cluster.nodes[&id];
        assert_eq!(node.term(), 1);
        assert_eq!(node.voted_for(), Some(1));
    }
}

/// Scenario 2: single-entry replication. A commits "x" after two heartbeat
/// rounds (the first round only carries matchIndex information back to the
/// leader; the leader's own commit-advancement check runs at the *start* of
/// a heartbeat tick, so it needs a second tick to see it) and the client is
/// answered with the applied result.
#[tokio::test]
async fn single_entry_replication() {
    let mut cluster = Cluster::new(&[1, 2, 3]);
    cluster.tick(1).await;
    cluster.settle().await;
    assert_eq!(cluster.leaders(), vec![1]);

    let rx = cluster.call(1, Bytes::from_static(b"x")).await;

    cluster.tick(1).await;
    cluster.settle().await;
    assert_eq!(cluster.nodes[&1].commit_index(), 0, "matchIndex not yet observed");

    cluster.tick(1).await;
    cluster.settle().await;

    assert_eq!(cluster.nodes[&1].commit_index(), 1);
    assert_eq!(cluster.nodes[&2].commit_index(), 1);
    assert_eq!(cluster.nodes[&3].commit_index(), 1);

    let result = rx.await.expect("reply channel not dropped").expect("call succeeds");
    assert_eq!(result, Bytes::from_static(b"x"));
}

/// Scenario 3: leader failover. A is partitioned away; B wins a new
/// election in term 2 with C's vote. A's in-flight client call is answered
/// `Deposed` once A observes term 2 after the partition heals; B's own call
/// then commits normally.
#[tokio::test]
async fn leader_failover() {
    let mut cluster = Cluster::new(&[1, 2, 3]);
    cluster.tick(1).await;
    cluster.settle().await;

    let rx_x = cluster.call(1, Bytes::from_static(b"x")).await;
    cluster.tick(1).await;
    cluster.settle().await;
    cluster.tick(1).await;
    cluster.settle().await;
    rx_x.await.unwrap().unwrap();
    assert_eq!(cluster.leaders(), vec![1]);

    cluster.partition(1);

    cluster.tick(2).await;
    cluster.settle().await;

    assert_eq!(cluster.nodes[&2].term(), 2);
    assert!(cluster.nodes[&2].is_leader());
    assert_eq!(cluster.nodes[&3].voted_for(), Some(2));

    let rx_y = cluster.call(1, Bytes::from_static(b"y")).await;

    cluster.heal(1);
    cluster.tick(2).await;
    cluster.settle().await;

    assert_eq!(cluster.leaders(), vec![2]);
    assert_eq!(rx_y.await.unwrap(), Err(raft::errors::CallError::Deposed));

    let rx_b = cluster.call(2, Bytes::from_static(b"y")).await;
    cluster.tick(2).await;
    cluster.settle().await;
    cluster.tick(2).await;
    cluster.settle().await;

    assert_eq!(cluster.nodes[&2].commit_index(), 2);
    assert_eq!(rx_b.await.unwrap().unwrap(), Bytes::from_static(b"y"));
}

/// Scenario 4: conflict resolution. A's log has a stale uncommitted entry
/// at index 2; B (leader, term 2) overwrites it via truncate-then-append.
#[tokio::test]
async fn conflict_resolution_truncates_then_accepts() {
    let store = new_store();
    store
        .append(vec![
            LogEntry { term: 1, value: Bytes::from_static(b"x") },
            LogEntry { term: 1, value: Bytes::from_static(b"y") },
        ])
        .await
        .unwrap();

    let outbox = Arc::new(Mutex::new(Vec::new()));
    let transport = TestTransport::new(outbox.clone());
    let persistent = PersistentState { current_term: 1, voted_for: None };
    let (mut node, _timeout) = ConsensusModule::new(
        1,
        vec![1, 2],
        persistent,
        store,
        transport,
        ScriptedClock::default(),
    );

    let req = AppendEntriesRequest {
        term: 2,
        source: 2,
        prev_log_index: 1,
        prev_log_term: 1,
        entries: vec![LogEntry { term: 2, value: Bytes::from_static(b"z") }],
        commit_index: 0,
    };
    node.dispatch(Event::Peer(Message {
        to: 1,
        body: MessageBody::AppendEntriesRequest(req),
    }))
    .await
    .unwrap();

    let log = node.store().range(1, 10).await;
    assert_eq!(
        log,
        vec![
            LogEntry { term: 1, value: Bytes::from_static(b"x") },
            LogEntry { term: 2, value: Bytes::from_static(b"z") },
        ]
    );
    assert_eq!(node.term(), 2);
}

/// Scenario 5: a stale vote response (from a term we've already moved past)
/// is ignored outright.
#[tokio::test]
async fn stale_vote_response_is_ignored() {
    let store = new_store();
    let outbox = Arc::new(Mutex::new(Vec::new()));
    let transport = TestTransport::new(outbox.clone());
    let persistent = PersistentState { current_term: 3, voted_for: Some(1) };
    let (mut node, _timeout) = ConsensusModule::new(
        1,
        vec![1, 2, 3],
        persistent,
        store,
        transport,
        ScriptedClock::default(),
    );

    let resp = RequestVoteResponse { term: 1, source: 2, vote_granted: true };
    node.dispatch(Event::Peer(Message {
        to: 1,
        body: MessageBody::RequestVoteResponse(resp),
    }))
    .await
    .unwrap();

    assert_eq!(node.term(), 3);
    assert_eq!(node.voted_for(), Some(1));
    assert!(!node.is_leader());
}

/// R3: re-delivering an already-accepted `AppendEntriesRequest` does not
/// change the follower's log -- only `commitIndex` may advance.
#[tokio::test]
async fn redelivered_append_entries_is_idempotent() {
    let store = new_store();
    let outbox = Arc::new(Mutex::new(Vec::new()));
    let transport = TestTransport::new(outbox.clone());
    let persistent = PersistentState { current_term: 1, voted_for: None };
    let (mut node, _timeout) = ConsensusModule::new(
        1,
        vec![1, 2],
        persistent,
        store,
        transport,
        ScriptedClock::default(),
    );

    let req = AppendEntriesRequest {
        term: 1,
        source: 2,
        prev_log_index: 0,
        prev_log_term: 0,
        entries: vec![LogEntry { term: 1, value: Bytes::from_static(b"x") }],
        commit_index: 1,
    };
    node.dispatch(Event::Peer(Message {
        to: 1,
        body: MessageBody::AppendEntriesRequest(req.clone()),
    }))
    .await
    .unwrap();

    let log_after_first = node.store().range(1, 10).await;
    let commit_after_first = node.commit_index();
    assert_eq!(log_after_first.len(), 1);
    assert_eq!(commit_after_first, 1);

    node.dispatch(Event::Peer(Message {
        to: 1,
        body: MessageBody::AppendEntriesRequest(req),
    }))
    .await
    .unwrap();

    let log_after_second = node.store().range(1, 10).await;
    assert_eq!(log_after_second, log_after_first);
    assert_eq!(node.commit_index(), commit_after_first);
}
