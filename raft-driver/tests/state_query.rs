use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use raft_driver::client::StateQueryReply;
use raft_driver::event::StateQuerySpec;
use raft_driver::{NodeId, Role};

mod fixtures;
use fixtures::Cluster;

/// State query test.
///
/// What does this test do?
///
/// - elects node `a`.
/// - asks a follower for the member set; the call redirects to the leader.
/// - asks the leader for its full status and checks the fields.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn state_queries() -> Result<()> {
    fixtures::init_tracing();

    let cluster = Cluster::new(&["a", "b", "c"]);
    let a = NodeId::from("a");
    let b = NodeId::from("b");
    cluster.elect(&a).await?;
    cluster.wait_leader_known(&b, &a).await?;

    let (reply, served_by) = cluster
        .client
        .state_query(&b, StateQuerySpec::Members, Duration::from_millis(2000))
        .await?;
    assert_eq!(served_by, a);
    match reply {
        StateQueryReply::Members(members) => {
            assert_eq!(members, btreeset![a.clone(), b.clone(), NodeId::from("c")]);
        }
        other => panic!("expected the member set, got {:?}", other),
    }

    let (reply, served_by) = cluster
        .client
        .state_query(&a, StateQuerySpec::All, Duration::from_millis(2000))
        .await?;
    assert_eq!(served_by, a);
    match reply {
        StateQueryReply::All(status) => {
            assert_eq!(status.id, a);
            assert_eq!(status.role, Role::Leader);
            assert_eq!(status.leader, Some(a.clone()));
            assert!(status.current_term >= 1);
        }
        other => panic!("expected the full status, got {:?}", other),
    }
    Ok(())
}
