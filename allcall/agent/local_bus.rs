//! An in-process bus: subject-based fan-out between agents in one process.
//!
//! Backs the integration tests and the demo binary. Delivery runs through a
//! per-subscription unbounded channel drained by a spawned task, so a
//! publish never blocks on a slow subscriber and never re-enters a handler.
//! Connections can be killed to exercise the agent's disconnect and
//! reconnect plumbing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::bus::{
    Bus, BusConnector, BusMessage, BusOptions, DisconnectHandler, MessageHandler, ServerLocation,
};
use crate::error::BusError;

/// A process-local pub/sub hub shared by any number of connections.
pub struct LocalBusHub {
    inner: Mutex<HubInner>,
    next_port: AtomicU16,
}

#[derive(Default)]
struct HubInner {
    // subject -> senders into each subscriber's drain task
    subscriptions: HashMap<String, Vec<SubscriptionEntry>>,
    connections: HashMap<String, Arc<ConnShared>>,
}

struct SubscriptionEntry {
    conn_id: String,
    sender: mpsc::UnboundedSender<BusMessage>,
}

struct ConnShared {
    closed: AtomicBool,
    disconnect: Mutex<Option<DisconnectHandler>>,
}

impl LocalBusHub {
    /// A hub with no connections.
    pub fn new() -> Arc<Self> {
        Arc::new(LocalBusHub {
            inner: Mutex::default(),
            next_port: AtomicU16::new(4222),
        })
    }

    /// A connector bound to this hub under a freshly allocated identity.
    /// Reconnects through the same connector resume that identity, the way a
    /// real adapter reconnecting to the same server would.
    pub fn connector(self: &Arc<Self>) -> LocalBusConnector {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        let location = ServerLocation {
            id: uuid::Uuid::new_v4().to_string(),
            host,
            port: self.next_port.fetch_add(1, Ordering::Relaxed),
            pid: std::process::id(),
        };
        LocalBusConnector {
            hub: Arc::clone(self),
            location: Mutex::new(location),
            last_conn_id: Mutex::new(None),
        }
    }

    /// Kill a connection: drop its subscriptions and fire its disconnect
    /// callback exactly once. No-op for unknown or already-killed ids.
    pub fn kill_connection(&self, conn_id: &str) {
        let shared = {
            let mut inner = self.inner.lock().unwrap();
            for entries in inner.subscriptions.values_mut() {
                entries.retain(|entry| entry.conn_id != conn_id);
            }
            inner.connections.remove(conn_id)
        };
        if let Some(shared) = shared {
            shared.closed.store(true, Ordering::SeqCst);
            let handler = shared.disconnect.lock().unwrap().take();
            if let Some(handler) = handler {
                handler();
            }
        }
    }

    fn deliver(&self, subject: &str, reply_to: Option<&str>, payload: &Bytes) {
        let mut inner = self.inner.lock().unwrap();
        let Some(entries) = inner.subscriptions.get_mut(subject) else {
            return;
        };
        entries.retain(|entry| {
            entry
                .sender
                .send(BusMessage {
                    subject: subject.to_string(),
                    reply_to: reply_to.map(str::to_string),
                    data: payload.clone(),
                })
                .is_ok()
        });
    }

    fn register(&self, conn_id: String, shared: Arc<ConnShared>) {
        self.inner
            .lock()
            .unwrap()
            .connections
            .insert(conn_id, shared);
    }

    fn add_subscription(&self, subject: &str, entry: SubscriptionEntry) {
        self.inner
            .lock()
            .unwrap()
            .subscriptions
            .entry(subject.to_string())
            .or_default()
            .push(entry);
    }
}

/// Connector yielding connections to one [`LocalBusHub`] under a stable
/// identity. The configured url is accepted but unused: the hub is the bus.
pub struct LocalBusConnector {
    hub: Arc<LocalBusHub>,
    location: Mutex<ServerLocation>,
    last_conn_id: Mutex<Option<String>>,
}

impl LocalBusConnector {
    /// Swap the identity future connections will report. Fault injection for
    /// exercising the agent's location-change check.
    pub fn set_location(&self, location: ServerLocation) {
        *self.location.lock().unwrap() = location;
    }

    /// The identity connections from this connector report.
    pub fn location(&self) -> ServerLocation {
        self.location.lock().unwrap().clone()
    }

    /// Hub-side id of the most recent connection, for
    /// [`LocalBusHub::kill_connection`].
    pub fn last_conn_id(&self) -> Option<String> {
        self.last_conn_id.lock().unwrap().clone()
    }
}

#[async_trait]
impl BusConnector for LocalBusConnector {
    async fn connect(&self, _options: &BusOptions) -> Result<Arc<dyn Bus>, BusError> {
        let shared = Arc::new(ConnShared {
            closed: AtomicBool::new(false),
            disconnect: Mutex::new(None),
        });
        let conn = Arc::new(LocalBusConn {
            hub: Arc::clone(&self.hub),
            conn_id: uuid::Uuid::new_v4().to_string(),
            location: self.location(),
            shared,
        });
        self.hub
            .register(conn.conn_id.clone(), Arc::clone(&conn.shared));
        *self.last_conn_id.lock().unwrap() = Some(conn.conn_id.clone());
        Ok(conn)
    }
}

/// One live connection to a [`LocalBusHub`].
pub struct LocalBusConn {
    hub: Arc<LocalBusHub>,
    conn_id: String,
    location: ServerLocation,
    shared: Arc<ConnShared>,
}

impl LocalBusConn {
    fn ensure_open(&self) -> Result<(), BusError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Bus for LocalBusConn {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        self.ensure_open()?;
        self.hub.deliver(subject, None, &payload);
        Ok(())
    }

    async fn publish_request(
        &self,
        subject: &str,
        reply_to: &str,
        payload: Bytes,
    ) -> Result<(), BusError> {
        self.ensure_open()?;
        self.hub.deliver(subject, Some(reply_to), &payload);
        Ok(())
    }

    async fn subscribe(&self, subject: &str, handler: MessageHandler) -> Result<(), BusError> {
        self.ensure_open()?;
        let (sender, receiver) = mpsc::unbounded_channel::<BusMessage>();
        let mut messages = UnboundedReceiverStream::new(receiver);
        tokio::spawn(async move {
            while let Some(message) = messages.next().await {
                handler(message);
            }
        });
        self.hub.add_subscription(
            subject,
            SubscriptionEntry {
                conn_id: self.conn_id.clone(),
                sender,
            },
        );
        Ok(())
    }

    fn server_location(&self) -> ServerLocation {
        self.location.clone()
    }

    fn on_disconnect(&self, handler: DisconnectHandler) {
        *self.shared.disconnect.lock().unwrap() = Some(handler);
    }

    async fn close(&self) {
        // Closing is a local act: drop subscriptions without firing the
        // disconnect callback.
        let mut inner = self.hub.inner.lock().unwrap();
        for entries in inner.subscriptions.values_mut() {
            entries.retain(|entry| entry.conn_id != self.conn_id);
        }
        inner.connections.remove(&self.conn_id);
        self.shared.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn fan_out_reaches_every_subscriber_including_publisher() {
        let hub = LocalBusHub::new();
        let a = hub.connector().connect(&BusOptions::monitoring("")).await.unwrap();
        let b = hub.connector().connect(&BusOptions::monitoring("")).await.unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        for conn in [&a, &b] {
            let seen = Arc::clone(&seen);
            conn.subscribe(
                "t",
                Arc::new(move |message: BusMessage| {
                    assert_eq!(message.data.as_ref(), b"ping");
                    seen.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();
        }

        a.publish("t", Bytes::from_static(b"ping")).await.unwrap();
        settle().await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn request_carries_reply_subject() {
        let hub = LocalBusHub::new();
        let conn = hub.connector().connect(&BusOptions::monitoring("")).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.subscribe(
            "call",
            Arc::new(move |message: BusMessage| {
                let _ = tx.send(message.reply_to);
            }),
        )
        .await
        .unwrap();

        conn.publish_request("call", "reply", Bytes::new()).await.unwrap();
        settle().await;
        assert_eq!(rx.recv().await.unwrap().as_deref(), Some("reply"));
    }

    #[tokio::test]
    async fn kill_fires_disconnect_once_and_closes() {
        let hub = LocalBusHub::new();
        let connector = hub.connector();
        let conn = connector.connect(&BusOptions::monitoring("")).await.unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        conn.on_disconnect(Box::new(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        }));

        let local = connector.last_conn_id().unwrap();
        hub.kill_connection(&local);
        hub.kill_connection(&local);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(matches!(
            conn.publish("t", Bytes::new()).await,
            Err(BusError::Closed)
        ));
    }

    #[tokio::test]
    async fn reconnect_resumes_the_same_identity() {
        let hub = LocalBusHub::new();
        let connector = hub.connector();
        let first = connector.connect(&BusOptions::monitoring("")).await.unwrap();
        let second = connector.connect(&BusOptions::monitoring("")).await.unwrap();
        assert_eq!(first.server_location(), second.server_location());
    }
}
