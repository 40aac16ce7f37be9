//! Demo: a small agent cluster on an in-process bus.
//!
//! Spins up N membership agents sharing one [`LocalBusHub`], watches the
//! membership event topics, and prints what each agent believes once the
//! cluster has converged.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use allcall::bus::{BusConnector, BusMessage, BusOptions, TOPIC_ADDED, TOPIC_LIST, TOPIC_LOST};
use allcall::{LocalBusHub, MemberSet, Membership, MembershipConfig};

/// Run a demo membership cluster over an in-process bus.
#[derive(Parser, Debug)]
struct Opts {
    /// Number of agents to run. Agent `i` gets rank `i`, so agent 0 should
    /// win the election.
    #[clap(long, default_value_t = 3, env = "ALLCALL_AGENTS")]
    agents: usize,

    /// Heartbeat window in milliseconds.
    #[clap(long, default_value_t = 100, env = "ALLCALL_BEAT_MS")]
    beat_ms: u64,

    /// Leader lease term in milliseconds.
    #[clap(long, default_value_t = 1000, env = "ALLCALL_LEASE_MS")]
    lease_ms: u64,

    /// Clock-skew grace in milliseconds.
    #[clap(long, default_value_t = 250, env = "ALLCALL_SKEW_MS")]
    skew_ms: u64,

    /// How long to let the cluster run, in seconds.
    #[clap(long, default_value_t = 5)]
    run_secs: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();
    let hub = LocalBusHub::new();

    // A plain bus connection that only watches the event topics.
    let watcher = hub
        .connector()
        .connect(&BusOptions::monitoring("mem://local"))
        .await
        .unwrap();
    for subject in [TOPIC_LOST, TOPIC_ADDED, TOPIC_LIST] {
        watcher
            .subscribe(
                subject,
                Arc::new(|message: BusMessage| {
                    let members = MemberSet::from_bytes(&message.data)
                        .map(|set| {
                            set.iter().map(|m| m.to_string()).collect::<Vec<_>>().join(", ")
                        })
                        .unwrap_or_else(|_| "<unparseable>".to_string());
                    println!("event {} [{}]", message.subject, members);
                }),
            )
            .await
            .unwrap();
    }

    let mut agents = Vec::new();
    for rank in 0..opts.agents {
        let config = MembershipConfig {
            beat_duration: Duration::from_millis(opts.beat_ms),
            lease_duration: Duration::from_millis(opts.lease_ms),
            max_clock_skew: Duration::from_millis(opts.skew_ms),
            my_rank: rank as i32,
            bus_url: "mem://local".to_string(),
            ..Default::default()
        };
        let agent = Arc::new(Membership::new(config, Arc::new(hub.connector())));
        agent.start().await.expect("in-process bus is reachable");
        agents.push(agent);
    }

    tokio::time::sleep(Duration::from_secs(opts.run_secs)).await;

    for agent in &agents {
        let me = agent.my_location().expect("started");
        println!(
            "agent {} sees {} members, leader {}",
            me,
            agent.member_set_snapshot().len(),
            agent.get_leader(),
        );
    }

    for agent in &agents {
        agent.stop().await;
    }
}
