//! Cluster scenarios: elections under partitions, commits, membership
//! demotion. Driven deterministically through the test harness.

use quorum::core::{ClientResponse, Role};
use quorum::log::Command;
use quorum::testing::TestCluster;

fn user(payload: &str) -> Command {
    Command::User(payload.to_string())
}

#[tokio::test]
async fn test_three_node_election_after_partition() {
    let mut cluster = TestCluster::new(&["r0", "r1", "r2"]).await;
    cluster.elect("r0").await;
    assert_eq!(cluster.node("r0").current_term(), 1);

    // Cut the leader off and force r1 to stand for election.
    cluster.partition(&[&["r0"]]);
    cluster.node_mut("r1").set_leader_timeout(1);
    let elected = cluster
        .tick_until(50, |c| c.node("r2").leader_id() == Some(&"r1".to_string()))
        .await;
    assert!(elected, "r2 never recognized r1 as leader");
    assert_eq!(cluster.node("r1").current_term(), 2);

    // The majority side keeps committing.
    let rx = cluster.submit("r1", user("foo")).await.unwrap();
    assert!(rx.await.unwrap().success);
    let applied = cluster
        .tick_until(50, |c| c.data("r2") == Some("foo".to_string()))
        .await;
    assert!(applied, "r2 never applied the entry");
    assert_eq!(cluster.data("r0"), None);

    // The healed old leader steps down and catches up.
    cluster.heal();
    let caught_up = cluster
        .tick_until(100, |c| {
            c.node("r0").leader_id() == Some(&"r1".to_string())
                && c.data("r0") == Some("foo".to_string())
        })
        .await;
    assert!(caught_up, "r0 never caught up after the partition healed");
    cluster.assert_single_leader_per_term();
}

#[tokio::test]
async fn test_five_node_commit_then_minority_partition() {
    let ids = ["r0", "r1", "r2", "r3", "r4"];
    let mut cluster = TestCluster::new(&ids).await;
    cluster.elect("r0").await;

    let rx = cluster.submit("r0", user("foo")).await.unwrap();
    let response = rx.await.unwrap();
    assert_eq!(
        response,
        ClientResponse {
            leader_id: Some("r0".to_string()),
            entry_term: 1,
            entry_index: 1,
            success: true,
        }
    );
    let all_applied = cluster
        .tick_until(50, |c| {
            ids.iter().all(|id| c.data(id) == Some("foo".to_string()))
        })
        .await;
    assert!(all_applied, "not every state machine applied the entry");

    // Isolate r0, r1 and r2 individually; r3 and r4 stay connected but
    // cannot form a majority of the five voters.
    cluster.partition(&[&["r0"], &["r1"], &["r2"]]);
    cluster.tick_n(100).await;

    assert_eq!(cluster.node("r0").role(), Role::Leader);
    assert_eq!(cluster.node("r1").role(), Role::Candidate);
    assert_eq!(cluster.node("r2").role(), Role::Candidate);
    assert_ne!(cluster.node("r3").role(), Role::Leader);
    assert_ne!(cluster.node("r4").role(), Role::Leader);
    cluster.assert_single_leader_per_term();
}

#[tokio::test]
async fn test_demoted_peer_still_receives_entries() {
    let mut cluster = TestCluster::new(&["r0", "r1", "r2"]).await;
    cluster.elect("r0").await;

    let mut members = cluster.node("r0").cluster_config().unwrap().members;
    members.get_mut("r2").unwrap().voting = false;
    let rx = cluster
        .submit(
            "r0",
            Command::Configure {
                members,
                prev_config_index: None,
            },
        )
        .await
        .unwrap();
    assert!(rx.await.unwrap().success);

    assert_eq!(
        cluster.node("r1").cluster_config().unwrap().voting_ids(),
        vec!["r0".to_string(), "r1".to_string()]
    );
    let config = cluster.node("r0").cluster_config().unwrap();
    assert!(!config.members["r2"].voting);

    // Demoted peers no longer vote or count toward commit, but they
    // keep receiving entries.
    let rx = cluster.submit("r0", user("foo")).await.unwrap();
    assert!(rx.await.unwrap().success);
    let applied = cluster
        .tick_until(50, |c| c.data("r2") == Some("foo".to_string()))
        .await;
    assert!(applied, "demoted r2 never applied the entry");
}

#[tokio::test]
async fn test_submit_to_follower_redirects() {
    let mut cluster = TestCluster::new(&["r0", "r1", "r2"]).await;
    cluster.elect("r0").await;

    let err = cluster.submit("r1", user("foo")).await.unwrap_err();
    match err {
        quorum::Error::NotLeader { leader_hint } => {
            assert_eq!(leader_hint, Some("r0".to_string()));
        }
        other => panic!("expected NotLeader, got {other:?}"),
    }
}

#[tokio::test]
async fn test_reelection_after_leader_loss_preserves_entries() {
    let mut cluster = TestCluster::new(&["r0", "r1", "r2"]).await;
    cluster.elect("r0").await;

    let rx = cluster.submit("r0", user("a")).await.unwrap();
    assert!(rx.await.unwrap().success);

    cluster.partition(&[&["r0"]]);
    cluster.node_mut("r1").set_leader_timeout(1);
    assert!(
        cluster
            .tick_until(50, |c| c.node("r1").role() == Role::Leader)
            .await
    );

    let rx = cluster.submit("r1", user("b")).await.unwrap();
    assert!(rx.await.unwrap().success);
    let applied = cluster
        .tick_until(50, |c| c.data("r2") == Some("b".to_string()))
        .await;
    assert!(applied);

    cluster.heal();
    let converged = cluster
        .tick_until(100, |c| c.data("r0") == Some("b".to_string()))
        .await;
    assert!(converged);

    // Both entries survive on every node, in order.
    for id in ["r0", "r1", "r2"] {
        assert_eq!(
            cluster.nodes[id].register.lock().applied(),
            vec!["a".to_string(), "b".to_string()]
        );
    }
}
