//! End-to-end membership scenarios: agents on one in-process bus.

use std::sync::Arc;
use std::time::Duration;

use allcall::bus::{BusConnector, BusMessage, BusOptions, TOPIC_LIST, TOPIC_LOST};
use allcall::chrono::Utc;
use allcall::{LocalBusHub, MemberSet, Membership, MembershipConfig};
use tokio::sync::mpsc;

const BEAT: Duration = Duration::from_millis(25);
const LEASE: Duration = Duration::from_millis(150);
const SKEW: Duration = Duration::from_millis(25);

fn config(rank: i32) -> MembershipConfig {
    MembershipConfig {
        beat_duration: BEAT,
        lease_duration: LEASE,
        max_clock_skew: SKEW,
        my_rank: rank,
        bus_url: "mem://test".to_string(),
        ..Default::default()
    }
}

async fn start_agent(hub: &Arc<LocalBusHub>, rank: i32) -> Arc<Membership> {
    let agent = Arc::new(Membership::new(config(rank), Arc::new(hub.connector())));
    agent.start().await.expect("in-process bus connects");
    agent
}

/// Funnel every payload published on `subject` into a channel. The watcher
/// rides a plain bus connection of its own.
async fn watch_topic(
    hub: &Arc<LocalBusHub>,
    subject: &'static str,
) -> mpsc::UnboundedReceiver<MemberSet> {
    let conn = hub
        .connector()
        .connect(&BusOptions::monitoring("mem://test"))
        .await
        .unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    conn.subscribe(
        subject,
        Arc::new(move |message: BusMessage| {
            if let Ok(set) = MemberSet::from_bytes(&message.data) {
                let _ = tx.send(set);
            }
        }),
    )
    .await
    .unwrap();
    rx
}

async fn wait_until(what: &str, timeout: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn single_node_elects_itself() {
    let hub = LocalBusHub::new();
    let agent = start_agent(&hub, 0).await;
    let me = agent.my_location().unwrap();

    wait_until("self-election", Duration::from_secs(3), || {
        let leader = agent.get_leader();
        leader.id == me.id && leader.is_leader && leader.lease_expires > Utc::now()
    })
    .await;

    let snapshot = agent.member_set_snapshot();
    assert_eq!(snapshot.len(), 1);
    assert!(snapshot.contains_id(&me.id));

    agent.stop().await;
    assert!(agent.halted());
}

#[tokio::test]
async fn lower_rank_wins_two_node_election() {
    let hub = LocalBusHub::new();
    let a = start_agent(&hub, 1).await;
    let b = start_agent(&hub, 0).await;
    let b_id = b.my_location().unwrap().id;

    wait_until("agreement on the rank-0 agent", Duration::from_secs(3), || {
        a.get_leader().id == b_id && b.get_leader().id == b_id
    })
    .await;

    wait_until("full visibility", Duration::from_secs(3), || {
        a.member_set_snapshot().len() == 2 && b.member_set_snapshot().len() == 2
    })
    .await;

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn rank_tie_resolved_by_smaller_id() {
    let hub = LocalBusHub::new();
    let x = start_agent(&hub, 5).await;
    let y = start_agent(&hub, 5).await;
    let x_id = x.my_location().unwrap().id;
    let y_id = y.my_location().unwrap().id;
    let expected = x_id.clone().min(y_id.clone());

    wait_until("lexicographic winner", Duration::from_secs(3), || {
        x.get_leader().id == expected && y.get_leader().id == expected
    })
    .await;

    x.stop().await;
    y.stop().await;
}

#[tokio::test]
async fn leader_failure_fails_over_and_reports() {
    let hub = LocalBusHub::new();
    let mut lost_rx = watch_topic(&hub, TOPIC_LOST).await;
    let mut list_rx = watch_topic(&hub, TOPIC_LIST).await;

    let a = start_agent(&hub, 1).await;
    let b = start_agent(&hub, 0).await;
    let a_id = a.my_location().unwrap().id;
    let b_id = b.my_location().unwrap().id;

    wait_until("initial convergence", Duration::from_secs(3), || {
        a.get_leader().id == b_id && b.get_leader().id == b_id
    })
    .await;

    // The leader goes silent.
    b.stop().await;

    wait_until("failover to the survivor", Duration::from_secs(3), || {
        let leader = a.get_leader();
        leader.id == a_id && leader.is_leader
    })
    .await;

    // The survivor reported the loss.
    let lost = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            let set = lost_rx.recv().await.expect("lost topic stays open");
            if set.contains_id(&b_id) {
                return set;
            }
        }
    })
    .await
    .expect("a lost event naming the dead leader");
    assert!(!lost.contains_id(&a_id));

    // Reelection publishes the full membership list, now without the dead
    // leader.
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            let set = list_rx.recv().await.expect("list topic stays open");
            if !set.contains_id(&b_id) && set.contains_id(&a_id) {
                return;
            }
        }
    })
    .await
    .expect("a post-failover membership list");

    a.stop().await;
}

#[tokio::test]
async fn stable_cluster_renews_lease_without_membership_events() {
    let hub = LocalBusHub::new();
    let a = start_agent(&hub, 1).await;
    let b = start_agent(&hub, 0).await;
    let b_id = b.my_location().unwrap().id;

    wait_until("initial convergence", Duration::from_secs(3), || {
        a.get_leader().id == b_id
            && b.get_leader().id == b_id
            && a.member_set_snapshot().len() == 2
    })
    .await;

    // Subscribe only now, so startup joins are out of the picture.
    let mut lost_rx = watch_topic(&hub, TOPIC_LOST).await;
    let mut gained_rx = watch_topic(&hub, allcall::bus::TOPIC_ADDED).await;
    let lease_before = b.get_leader().lease_expires;

    // Sit through several lease terms.
    tokio::time::sleep(LEASE * 4).await;

    assert_eq!(a.get_leader().id, b_id, "leadership never moved");
    assert_eq!(b.get_leader().id, b_id);
    assert!(
        b.get_leader().lease_expires > lease_before,
        "the lease was renewed across terms"
    );
    assert!(
        lost_rx.try_recv().is_err(),
        "no lost events while membership is unchanged"
    );
    assert!(
        gained_rx.try_recv().is_err(),
        "no gained events while membership is unchanged"
    );

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn deaf_agent_drops_out_of_the_cluster() {
    let hub = LocalBusHub::new();
    let a = start_agent(&hub, 0).await;
    let b = start_agent(&hub, 1).await;

    wait_until("initial convergence", Duration::from_secs(3), || {
        a.member_set_snapshot().len() == 2 && b.member_set_snapshot().len() == 2
    })
    .await;

    // b stops hearing anything: it neither collects pongs nor answers pings.
    b.set_deaf(true);

    wait_until("mutual loss of visibility", Duration::from_secs(3), || {
        a.member_set_snapshot().len() == 1 && b.member_set_snapshot().len() == 1
    })
    .await;

    a.stop().await;
    b.stop().await;
}
