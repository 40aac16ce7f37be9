//! Error types for the membership agent and its bus adapters.

use thiserror::Error;

/// Errors surfaced by the membership agent.
#[derive(Debug, Error)]
pub enum Error {
    /// The initial connect failed or reconnect attempts were exhausted.
    #[error("message bus unreachable: {reason}")]
    BusUnreachable {
        /// What the last connection attempt reported.
        reason: String,
    },

    /// A pong payload could not be decoded. Callers log and drop; this never
    /// crosses the bus-callback trust boundary as a panic.
    #[error("malformed pong payload")]
    MalformedPong(#[source] serde_json::Error),

    /// A halt was requested while a blocking call was in flight.
    #[error("membership agent is shutting down")]
    Shutdown,

    /// The bus reports a different identity after a reconnect. This agent
    /// monitors one specific server and must not silently adopt another.
    #[error("bus identity changed across reconnect: was {was}, now {now}")]
    LocationChanged {
        /// Identity recorded at startup.
        was: String,
        /// Identity the bus reports now.
        now: String,
    },

    /// A bus adapter operation failed.
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Errors produced by bus adapters.
#[derive(Debug, Error)]
pub enum BusError {
    /// The connection has been closed or dropped.
    #[error("bus connection is closed")]
    Closed,

    /// A connection attempt failed.
    #[error("bus connect failed: {0}")]
    Connect(String),
}
