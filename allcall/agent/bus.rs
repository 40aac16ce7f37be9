//! The bus adapter contract the membership agent runs against.
//!
//! The message bus itself is an external collaborator. This module pins down
//! the few capabilities the agent needs from it: publish, request/reply
//! publish, subscription with callback delivery, local identity resolution,
//! and disconnect notification. Production embedders implement these traits
//! over their real bus client; the test suite and demo binary use the
//! in-process [`LocalBusHub`](crate::LocalBusHub).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::BusError;

/// Topic prefix shared by all membership traffic.
pub const TOPIC_PREFIX: &str = "_nats.cluster.members.";
/// Per-beat broadcast ping, payload: JSON of the believed leader.
pub const TOPIC_ALLCALL: &str = "_nats.cluster.members.allcall";
/// Reply topic for pings, payload: JSON of the replier's own candidate.
pub const TOPIC_ALLREPLY: &str = "_nats.cluster.members.allreply";
/// Published when members disappear, payload: JSON member set of lost entries.
pub const TOPIC_LOST: &str = "_nats.cluster.members.lost";
/// Published when members appear, payload: JSON member set of gained entries.
pub const TOPIC_ADDED: &str = "_nats.cluster.members.added";
/// Published on lease expiry / reelection, payload: JSON of the full set.
pub const TOPIC_LIST: &str = "_nats.cluster.members.list";

/// One message delivered by the bus.
#[derive(Clone, Debug)]
pub struct BusMessage {
    /// Subject the message was published on.
    pub subject: String,
    /// Reply subject, for request-style publishes.
    pub reply_to: Option<String>,
    /// Raw payload.
    pub data: Bytes,
}

/// Subscription callback. Invoked from the bus's delivery tasks; must be
/// short-lived and must never panic on malformed payloads.
pub type MessageHandler = Arc<dyn Fn(BusMessage) + Send + Sync>;

/// Callback invoked once per disconnection event.
pub type DisconnectHandler = Box<dyn Fn() + Send + Sync>;

/// The identity the bus reports for the server this agent monitors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerLocation {
    /// Unique id of the monitored server.
    pub id: String,
    /// Host of the monitored server.
    pub host: String,
    /// Port of the monitored server.
    pub port: u16,
    /// Process id, where the adapter knows it; zero otherwise.
    pub pid: u32,
}

impl ServerLocation {
    /// `id@host:port`, for logs and error messages.
    pub fn endpoint(&self) -> String {
        format!("{}@{}:{}", self.id, self.host, self.port)
    }
}

/// Connection options for bus adapters.
#[derive(Clone, Debug)]
pub struct BusOptions {
    /// Address of the bus instance to connect to.
    pub url: String,
    /// The adapter must not transparently migrate this agent to another bus
    /// instance; the agent monitors one specific server.
    pub no_reconnect: bool,
    /// Connection-attempt order must be deterministic.
    pub dont_randomize: bool,
    /// Per-subscription pending-message limit. `None` means unbounded: a
    /// burst of pongs within one heartbeat window must never drop.
    pub pending_limit: Option<usize>,
}

impl BusOptions {
    /// The options a monitoring agent always uses: pinned to one server,
    /// deterministic, unbounded subscription buffering.
    pub fn monitoring(url: impl Into<String>) -> Self {
        BusOptions {
            url: url.into(),
            no_reconnect: true,
            dont_randomize: true,
            pending_limit: None,
        }
    }
}

/// One live connection to the bus.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish `payload` on `subject`.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError>;

    /// Publish `payload` on `subject`, soliciting replies on `reply_to`.
    async fn publish_request(
        &self,
        subject: &str,
        reply_to: &str,
        payload: Bytes,
    ) -> Result<(), BusError>;

    /// Deliver every message published on `subject` to `handler`.
    async fn subscribe(&self, subject: &str, handler: MessageHandler) -> Result<(), BusError>;

    /// The identity of the server this connection reports.
    fn server_location(&self) -> ServerLocation;

    /// Register a callback fired once per disconnection event.
    fn on_disconnect(&self, handler: DisconnectHandler);

    /// Close the connection. Idempotent.
    async fn close(&self);
}

/// The seam the membership agent (re)connects through.
#[async_trait]
pub trait BusConnector: Send + Sync {
    /// Establish a connection per `options`.
    async fn connect(&self, options: &BusOptions) -> Result<Arc<dyn Bus>, BusError>;
}
