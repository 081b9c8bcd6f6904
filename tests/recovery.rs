//! Durability scenarios: truncation safety at the node level, config
//! chain walkback across restarts, and full log recovery on reopen.

use std::collections::BTreeMap;

use quorum::core::{AppendEntriesReq, NodeId, RaftConfig, RaftNode};
use quorum::error::Error;
use quorum::log::{AppendRequest, Command, CommandLog, DurableLog, LogEntry, Peer};
use quorum::props::MemoryProps;
use quorum::state_machine::shared_register;

fn members(ids: &[&str]) -> BTreeMap<NodeId, Peer> {
    ids.iter()
        .map(|id| (id.to_string(), Peer::voting()))
        .collect()
}

fn user(index: u64, term: u64, payload: &str) -> LogEntry {
    LogEntry {
        index,
        term,
        command: Command::User(payload.to_string()),
    }
}

fn configure(index: u64, term: u64, ids: &[&str]) -> LogEntry {
    LogEntry {
        index,
        term,
        command: Command::Configure {
            members: members(ids),
            prev_config_index: None,
        },
    }
}

fn append_req(term: u64, entries: Vec<LogEntry>, commit_index: u64) -> AppendEntriesReq {
    AppendEntriesReq {
        term,
        leader_id: "r1".to_string(),
        prev_log_index: 0,
        prev_log_term: 0,
        entries,
        commit_index,
    }
}

async fn follower_with_entries(commit_index: u64) -> RaftNode {
    let register = shared_register();
    let log = quorum::log::MemoryLog::open(register.clone(), Some(members(&["r0", "r1", "r2"])));
    let mut node = RaftNode::new(
        "r0".to_string(),
        RaftConfig::default(),
        Box::new(MemoryProps::ready()),
        Box::new(log),
        register,
    )
    .await
    .unwrap();

    let resp = node
        .handle_append_entries(&append_req(
            1,
            vec![user(1, 1, "a"), user(2, 1, "b")],
            commit_index,
        ))
        .await
        .unwrap();
    assert!(resp.success);
    node
}

#[tokio::test]
async fn test_new_leader_overwrites_uncommitted_tail() {
    let mut node = follower_with_entries(0).await;

    let resp = node
        .handle_append_entries(&append_req(2, vec![user(1, 2, "x"), user(2, 2, "y")], 0))
        .await
        .unwrap();
    assert!(resp.success);

    let entries: Vec<_> = node
        .clog()
        .slice(0, None)
        .unwrap()
        .map(|e| e.unwrap())
        .collect();
    assert_eq!(
        entries.iter().map(|e| (e.index, e.term)).collect::<Vec<_>>(),
        vec![(0, 0), (1, 2), (2, 2)]
    );
}

#[tokio::test]
async fn test_overwrite_below_commit_fails_without_mutation() {
    let mut node = follower_with_entries(2).await;
    assert_eq!(node.commit_index(), 2);

    let err = node
        .handle_append_entries(&append_req(2, vec![user(1, 2, "x"), user(2, 2, "y")], 0))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Internal(_)));

    let entries: Vec<_> = node
        .clog()
        .slice(0, None)
        .unwrap()
        .map(|e| e.unwrap())
        .collect();
    assert_eq!(
        entries.iter().map(|e| (e.index, e.term)).collect::<Vec<_>>(),
        vec![(0, 0), (1, 1), (2, 1)]
    );
}

#[tokio::test]
async fn test_config_walkback_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = sled::open(dir.path()).unwrap();
        let tree = db.open_tree("clog").unwrap();
        let mut log = DurableLog::open(tree, shared_register(), Some(members(&["r0", "r1", "r2"])))
            .await
            .unwrap();

        // Configure entries at 0 (sentinel), 5 and 9.
        let mut entries: Vec<_> = (1..=4).map(|i| user(i, 1, "x")).collect();
        entries.push(configure(5, 1, &["r0", "r1"]));
        entries.extend((6..=8).map(|i| user(i, 1, "x")));
        entries.push(configure(9, 1, &["r0"]));
        log.append(AppendRequest {
            term: 1,
            prev_index: 0,
            prev_term: 0,
            entries,
            commit_index: 0,
        })
        .await
        .unwrap();
        assert_eq!(log.cluster_config().unwrap().clog_index, 9);

        // A conflicting entry at 7 walks the chain 9 -> 5.
        log.append(AppendRequest {
            term: 2,
            prev_index: 6,
            prev_term: 1,
            entries: vec![user(7, 2, "y")],
            commit_index: 0,
        })
        .await
        .unwrap();
        assert_eq!(log.cluster_config().unwrap().clog_index, 5);
        log.close().await.unwrap();
    }

    let db = sled::open(dir.path()).unwrap();
    let tree = db.open_tree("clog").unwrap();
    let log = DurableLog::open(tree, shared_register(), None).await.unwrap();
    assert_eq!(log.last().unwrap().index, 7);
    let config = log.cluster_config().unwrap();
    assert_eq!(config.clog_index, 5);
    assert_eq!(config.prev_config_index, Some(0));
    assert_eq!(
        config.voting_ids(),
        vec!["r0".to_string(), "r1".to_string()]
    );
}

#[tokio::test]
async fn test_ten_entry_log_recovers_identically() {
    let dir = tempfile::tempdir().unwrap();
    let initial = members(&["r0", "r1", "r2"]);
    let before;
    {
        let db = sled::open(dir.path()).unwrap();
        let tree = db.open_tree("clog").unwrap();
        let mut log = DurableLog::open(tree, shared_register(), Some(initial.clone()))
            .await
            .unwrap();
        let entries: Vec<_> = (1..=10).map(|i| user(i, 1, "x")).collect();
        log.append(AppendRequest {
            term: 1,
            prev_index: 0,
            prev_term: 0,
            entries,
            commit_index: 0,
        })
        .await
        .unwrap();
        before = (log.last().unwrap(), log.cluster_config().unwrap());
        log.close().await.unwrap();
    }

    let db = sled::open(dir.path()).unwrap();
    let tree = db.open_tree("clog").unwrap();
    let log = DurableLog::open(tree, shared_register(), None).await.unwrap();

    let (last, config) = before;
    assert_eq!(log.last().unwrap(), last);
    assert_eq!(log.last().unwrap().index, 10);
    assert_eq!(log.cluster_config().unwrap(), config);

    let entries: Vec<_> = log.slice(0, None).unwrap().map(|e| e.unwrap()).collect();
    assert_eq!(entries.len(), 11);
    assert_eq!(
        entries.iter().map(|e| e.index).collect::<Vec<_>>(),
        (0..=10).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn test_bootstrap_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let initial = members(&["r0", "r1"]);
    {
        let db = sled::open(dir.path()).unwrap();
        let tree = db.open_tree("clog").unwrap();
        let mut log = DurableLog::open(tree, shared_register(), Some(initial.clone()))
            .await
            .unwrap();
        log.close().await.unwrap();
    }

    let db = sled::open(dir.path()).unwrap();
    let tree = db.open_tree("clog").unwrap();
    let log = DurableLog::open(tree, shared_register(), None).await.unwrap();
    assert_eq!(log.last().unwrap().index, 0);
    assert_eq!(log.cluster_config().unwrap().members, initial);
}
