//! The membership loop: heartbeat rounds, election, diffing, lifecycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::bus::{
    Bus, BusConnector, BusMessage, BusOptions, MessageHandler, TOPIC_ADDED, TOPIC_ALLCALL,
    TOPIC_ALLREPLY, TOPIC_LIST, TOPIC_LOST,
};
use crate::candidate::Candidate;
use crate::collector::PongCollector;
use crate::config::MembershipConfig;
use crate::election::{leader_lease_check, lease_outstanding};
use crate::error::Error;
use crate::lead::LeadHolder;
use crate::member_set::MemberSet;

/// Delay before the first reconnect attempt.
const RECONNECT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
/// Ceiling for the reconnect backoff.
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Reconnect attempts before the agent halts with `BusUnreachable`.
const RECONNECT_ATTEMPTS: u32 = 10;
/// Minimum spacing of robustness-change log lines.
const COUNT_LOG_THROTTLE: Duration = Duration::from_secs(2);

/// One cluster-membership agent.
///
/// Owns the heartbeat loop: each round broadcasts a ping, gathers pongs,
/// runs the lease check, feeds the verdict through the [`LeadHolder`], and
/// publishes `lost` / `added` / `list` events for the differences against
/// the previous round.
pub struct Membership {
    config: MembershipConfig,
    connector: Arc<dyn BusConnector>,
    options: BusOptions,
    holder: Arc<LeadHolder>,
    collector: Arc<PongCollector>,
    deaf: Arc<AtomicBool>,
    last_set: Mutex<MemberSet>,
    halt_req: watch::Sender<bool>,
    halt_done: watch::Sender<bool>,
    halt_done_rx: watch::Receiver<bool>,
    started: AtomicBool,
    stopping: Mutex<bool>,
}

enum Wake {
    Beat,
    Disconnected,
}

impl Membership {
    /// An agent over the given bus connector. Call [`Membership::start`] to
    /// bring it to life.
    pub fn new(config: MembershipConfig, connector: Arc<dyn BusConnector>) -> Self {
        let config = config.normalized();
        let (halt_req, _) = watch::channel(false);
        let (halt_done, halt_done_rx) = watch::channel(false);
        Membership {
            options: BusOptions::monitoring(config.bus_url.clone()),
            holder: Arc::new(LeadHolder::new(config.history_count, config.max_clock_skew)),
            collector: Arc::new(PongCollector::new()),
            deaf: Arc::new(AtomicBool::new(config.deaf)),
            last_set: Mutex::new(MemberSet::new()),
            halt_req,
            halt_done,
            halt_done_rx,
            started: AtomicBool::new(false),
            stopping: Mutex::new(false),
            config,
            connector,
        }
    }

    /// Connect, resolve the local identity, subscribe, send the first ping,
    /// and spawn the membership loop.
    ///
    /// Fails with [`Error::BusUnreachable`] when the initial connect fails.
    pub async fn start(self: &Arc<Self>) -> Result<(), Error> {
        let bus = self
            .connector
            .connect(&self.options)
            .await
            .map_err(|error| Error::BusUnreachable {
                reason: error.to_string(),
            })?;

        let loc = bus.server_location();
        let my_loc = Candidate::new(loc.id, loc.host, loc.port, self.config.my_rank);
        self.holder.set_my_loc(my_loc.clone());
        info!(me = %my_loc, "membership agent starting");

        let (disconnect_tx, disconnect_rx) = mpsc::unbounded_channel();
        let tx = disconnect_tx.clone();
        bus.on_disconnect(Box::new(move || {
            let _ = tx.send(());
        }));

        self.subscribe_all(&bus).await?;
        self.allcall(&bus).await;

        self.started.store(true, Ordering::SeqCst);
        let agent = Arc::clone(self);
        tokio::spawn(agent.run(bus, my_loc, disconnect_rx, disconnect_tx));
        Ok(())
    }

    /// Request a halt and wait for the loop to acknowledge. Idempotent;
    /// every caller unblocks once the loop has fully stopped.
    pub async fn stop(&self) {
        {
            let mut stopping = self.stopping.lock().unwrap();
            if !*stopping {
                *stopping = true;
                let _ = self.halt_req.send(true);
            }
        }
        if !self.started.load(Ordering::SeqCst) {
            return;
        }
        let mut done = self.halt_done_rx.clone();
        if *done.borrow() {
            return;
        }
        let _ = done.changed().await;
    }

    /// A copy of the currently accepted leader.
    pub fn get_leader(&self) -> Candidate {
        self.holder.get_leader()
    }

    /// A copy of the member set observed in the most recent round.
    pub fn member_set_snapshot(&self) -> MemberSet {
        self.last_set.lock().unwrap().clone()
    }

    /// This agent's own identity, once [`Membership::start`] has resolved it
    /// from the bus.
    pub fn my_location(&self) -> Option<Candidate> {
        self.holder.my_loc()
    }

    /// Whether the loop has reached its terminal HALT state.
    pub fn halted(&self) -> bool {
        *self.halt_done_rx.borrow()
    }

    /// Accepted-leader history, oldest first. Diagnostics only.
    pub fn leader_history(&self) -> Vec<Candidate> {
        self.holder.history()
    }

    /// Toggle observe-only mode: while deaf, every subscription drops its
    /// traffic before any processing.
    pub fn set_deaf(&self, deaf: bool) {
        self.deaf.store(deaf, Ordering::SeqCst);
    }

    async fn run(
        self: Arc<Self>,
        bus: Arc<dyn Bus>,
        my_loc: Candidate,
        disconnects: mpsc::UnboundedReceiver<()>,
        disconnect_tx: mpsc::UnboundedSender<()>,
    ) {
        match self
            .drive(bus.clone(), &my_loc, disconnects, disconnect_tx)
            .await
        {
            Ok(()) | Err(Error::Shutdown) => info!("membership agent halted"),
            Err(error) => warn!(%error, "membership agent halted on error"),
        }
        bus.close().await;
        let _ = self.halt_done.send(true);
    }

    async fn drive(
        &self,
        mut bus: Arc<dyn Bus>,
        my_loc: &Candidate,
        mut disconnects: mpsc::UnboundedReceiver<()>,
        disconnect_tx: mpsc::UnboundedSender<()>,
    ) -> Result<(), Error> {
        // FIRST_BEAT: gather the pongs our initial ping solicited.
        self.wait(self.config.beat_duration).await?;
        let (mut prev_count, mut prev_set) = self.collector.get_set_and_clear(my_loc);
        *self.last_set.lock().unwrap() = prev_set.clone();

        let first_seen = self.holder.get_leader();
        let mut prev_lead = if !first_seen.is_unknown()
            && lease_outstanding(first_seen.lease_expires, self.config.max_clock_skew, Utc::now())
        {
            info!(leader = %first_seen, "adopting leader with live lease");
            first_seen
        } else {
            // Sit out one full lease term so that any lease we cannot see
            // expires before we contend for leadership.
            self.wait(self.config.lease_duration).await?;
            self.holder.get_leader()
        };

        let mut last_count_log: Option<Instant> = None;
        loop {
            self.allcall(&bus).await;

            match self.beat_or_signal(&mut disconnects).await? {
                Wake::Beat => {}
                Wake::Disconnected => {
                    bus.close().await;
                    bus = self
                        .reconnect(my_loc, &mut disconnects, &disconnect_tx)
                        .await?;
                    continue;
                }
            }

            let (cur_count, cur_set) = self.collector.get_set_and_clear(my_loc);
            let now = Utc::now();
            let (expired, proposed) = leader_lease_check(
                &cur_set,
                now,
                self.config.lease_duration,
                &prev_lead,
                self.config.max_clock_skew,
            );
            let (accepted, cur_lead) = self.holder.set_leader(proposed, now);
            if accepted && cur_lead.id != prev_lead.id {
                info!(leader = %cur_lead, "leader changed");
            }

            let lost = prev_set.set_diff(&cur_set, &cur_lead);
            let gained = cur_set.set_diff(&prev_set, &cur_lead);
            if !prev_set.sets_equal(&cur_set) {
                if !lost.is_empty() {
                    self.publish_event(&bus, TOPIC_LOST, lost.to_bytes()).await;
                }
                if !gained.is_empty() {
                    self.publish_event(&bus, TOPIC_ADDED, gained.to_bytes()).await;
                }
            }
            if expired {
                self.publish_event(&bus, TOPIC_LIST, cur_set.to_bytes()).await;
            }

            if cur_count != prev_count
                && last_count_log.is_none_or(|at| at.elapsed() >= COUNT_LOG_THROTTLE)
            {
                info!(
                    was = prev_count,
                    now = cur_count,
                    "cluster robustness changed"
                );
                last_count_log = Some(Instant::now());
            }
            debug!(members = cur_count, leader = %cur_lead, "round complete");

            *self.last_set.lock().unwrap() = cur_set.clone();
            prev_set = cur_set;
            prev_count = cur_count;
            prev_lead = cur_lead;
        }
    }

    /// Register the five membership subscriptions on a (re)connected bus.
    async fn subscribe_all(&self, bus: &Arc<dyn Bus>) -> Result<(), Error> {
        // all_call: reply with our own identity so the pinger can count us.
        let deaf = Arc::clone(&self.deaf);
        let holder = Arc::clone(&self.holder);
        let reply_bus = Arc::clone(bus);
        let on_allcall: MessageHandler = Arc::new(move |message: BusMessage| {
            if deaf.load(Ordering::Relaxed) {
                return;
            }
            let Some(my_loc) = holder.my_loc() else {
                return;
            };
            let reply_to = message
                .reply_to
                .unwrap_or_else(|| TOPIC_ALLREPLY.to_string());
            let payload = Bytes::from(my_loc.to_json());
            let bus = Arc::clone(&reply_bus);
            tokio::spawn(async move {
                if let Err(error) = bus.publish(&reply_to, payload).await {
                    debug!(%error, "pong reply failed");
                }
            });
        });
        bus.subscribe(TOPIC_ALLCALL, on_allcall).await?;

        // all_reply: collect pongs; malformed payloads are logged and dropped.
        let deaf = Arc::clone(&self.deaf);
        let collector = Arc::clone(&self.collector);
        let on_allreply: MessageHandler = Arc::new(move |message: BusMessage| {
            if deaf.load(Ordering::Relaxed) {
                return;
            }
            if let Err(error) = collector.receive_pong(&message.data) {
                warn!(%error, "dropping undecodable pong");
            }
        });
        bus.subscribe(TOPIC_ALLREPLY, on_allreply).await?;

        // Event topics are subscribed for observability only.
        for subject in [TOPIC_LOST, TOPIC_ADDED, TOPIC_LIST] {
            let deaf = Arc::clone(&self.deaf);
            let on_event: MessageHandler = Arc::new(move |message: BusMessage| {
                if deaf.load(Ordering::Relaxed) {
                    return;
                }
                trace!(subject = %message.subject, bytes = message.data.len(), "membership event");
            });
            bus.subscribe(subject, on_event).await?;
        }
        Ok(())
    }

    /// Broadcast one ping carrying the believed leader. Publish failures are
    /// logged and the round continues: losing one ping is preferable to
    /// crashing mid-report.
    async fn allcall(&self, bus: &Arc<dyn Bus>) {
        let payload = Bytes::from(self.holder.leader_json());
        if let Err(error) = bus.publish_request(TOPIC_ALLCALL, TOPIC_ALLREPLY, payload).await {
            warn!(%error, "allcall publish failed");
        }
    }

    async fn publish_event(&self, bus: &Arc<dyn Bus>, subject: &str, payload: Vec<u8>) {
        if let Err(error) = bus.publish(subject, Bytes::from(payload)).await {
            warn!(%error, subject, "event publication failed; continuing");
        }
    }

    /// Sleep `duration`, racing the halt request.
    async fn wait(&self, duration: Duration) -> Result<(), Error> {
        let mut halt = self.halt_req.subscribe();
        if *halt.borrow() {
            return Err(Error::Shutdown);
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = halt.changed() => Err(Error::Shutdown),
        }
    }

    /// Wait out one heartbeat window, waking early on disconnect or halt.
    async fn beat_or_signal(
        &self,
        disconnects: &mut mpsc::UnboundedReceiver<()>,
    ) -> Result<Wake, Error> {
        let mut halt = self.halt_req.subscribe();
        if *halt.borrow() {
            return Err(Error::Shutdown);
        }
        tokio::select! {
            _ = tokio::time::sleep(self.config.beat_duration) => Ok(Wake::Beat),
            _ = disconnects.recv() => Ok(Wake::Disconnected),
            _ = halt.changed() => Err(Error::Shutdown),
        }
    }

    /// Re-establish the bus connection with exponential backoff.
    ///
    /// The reconnected bus must report the identity we started with: this
    /// agent monitors one specific server and halts rather than silently
    /// monitoring another ([`Error::LocationChanged`]).
    async fn reconnect(
        &self,
        my_loc: &Candidate,
        disconnects: &mut mpsc::UnboundedReceiver<()>,
        disconnect_tx: &mpsc::UnboundedSender<()>,
    ) -> Result<Arc<dyn Bus>, Error> {
        warn!("bus connection lost; reconnecting");
        let mut backoff = RECONNECT_INITIAL_BACKOFF;
        for attempt in 1..=RECONNECT_ATTEMPTS {
            self.wait(jittered(backoff)).await?;
            match self.try_reconnect(my_loc, disconnect_tx).await {
                Ok(bus) => {
                    // Coalesce disconnect signals that raced the reconnect.
                    while disconnects.try_recv().is_ok() {}
                    info!(attempt, "reconnected to bus");
                    return Ok(bus);
                }
                Err(error @ Error::LocationChanged { .. }) => return Err(error),
                Err(error) => warn!(%error, attempt, "reconnect attempt failed"),
            }
            backoff = (backoff * 2).min(RECONNECT_BACKOFF_CAP);
        }
        Err(Error::BusUnreachable {
            reason: format!("gave up after {RECONNECT_ATTEMPTS} reconnect attempts"),
        })
    }

    async fn try_reconnect(
        &self,
        my_loc: &Candidate,
        disconnect_tx: &mpsc::UnboundedSender<()>,
    ) -> Result<Arc<dyn Bus>, Error> {
        let bus = self.connector.connect(&self.options).await?;
        let loc = bus.server_location();
        if loc.id != my_loc.id || loc.host != my_loc.host || loc.port != my_loc.port {
            return Err(Error::LocationChanged {
                was: format!("{}@{}:{}", my_loc.id, my_loc.host, my_loc.port),
                now: loc.endpoint(),
            });
        }
        let tx = disconnect_tx.clone();
        bus.on_disconnect(Box::new(move || {
            let _ = tx.send(());
        }));
        self.subscribe_all(&bus).await?;
        Ok(bus)
    }
}

fn jittered(backoff: Duration) -> Duration {
    backoff.mul_f64(1.0 + rand::thread_rng().gen_range(0.0..0.25))
}
