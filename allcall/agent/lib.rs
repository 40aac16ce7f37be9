#![warn(missing_docs)]

//! Cluster membership and leader election atop a publish/subscribe bus.
//!
//! Every process in a cluster runs one [`Membership`] agent. Each heartbeat
//! the agent broadcasts a ping on a shared all-call topic; every agent
//! (itself included) answers with its identity, the replies are gathered
//! into a [`MemberSet`], and a deterministic lease-based ordering over the
//! observed [`Candidate`]s converges on a single leader without a separate
//! consensus protocol. Differences between consecutive rounds are published
//! as `lost` / `added` / `list` events.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use allcall::{LocalBusHub, Membership, MembershipConfig};
//!
//! # async fn example() -> Result<(), allcall::Error> {
//! let hub = LocalBusHub::new();
//! let agent = Arc::new(Membership::new(
//!     MembershipConfig::default(),
//!     Arc::new(hub.connector()),
//! ));
//! agent.start().await?;
//! // ... the agent heartbeats in the background ...
//! println!("leader: {}", agent.get_leader());
//! agent.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! The bus is an external collaborator reached through the traits in
//! [`bus`]; [`LocalBusHub`] is an in-process implementation for tests and
//! demos.

pub use {bytes, chrono};

pub mod bus;
mod candidate;
mod collector;
mod config;
mod election;
mod error;
mod lead;
mod local_bus;
mod member_set;
mod membership;

pub use candidate::{Candidate, zero_lease};
pub use collector::PongCollector;
pub use config::{
    DEFAULT_BEAT, DEFAULT_HISTORY_COUNT, DEFAULT_LEASE_BEATS, DEFAULT_MAX_CLOCK_SKEW,
    MembershipConfig,
};
pub use error::{BusError, Error};
pub use lead::LeadHolder;
pub use local_bus::{LocalBusConnector, LocalBusHub};
pub use member_set::MemberSet;
pub use membership::Membership;
