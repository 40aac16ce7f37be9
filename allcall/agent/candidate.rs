//! Candidate identities and the election ordering.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The "no lease" timestamp carried by every non-leader.
pub fn zero_lease() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// One agent's identity as advertised in pongs and leader announcements.
///
/// Field names are part of the wire contract: peers written against the
/// original bus protocol parse these exact JSON keys.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// Globally unique id of the agent instance. Empty means "unknown";
    /// unknown candidates lose every election.
    #[serde(rename = "serverId")]
    pub id: String,
    /// Host the agent's bus connection reports.
    pub host: String,
    /// Port the agent's bus connection reports.
    pub port: u16,
    /// True only on the currently elected candidate.
    #[serde(rename = "leader")]
    pub is_leader: bool,
    /// Absolute UTC expiry of the leader lease; [`zero_lease`] for non-leaders.
    #[serde(rename = "leaseExpires")]
    pub lease_expires: DateTime<Utc>,
    /// Operator-assigned leadership priority. Lower is stronger.
    pub rank: i32,
}

impl Candidate {
    /// A named candidate with no lease.
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16, rank: i32) -> Self {
        Candidate {
            id: id.into(),
            host: host.into(),
            port,
            is_leader: false,
            lease_expires: zero_lease(),
            rank,
        }
    }

    /// The empty-id candidate: sorts after every named candidate.
    pub fn unknown() -> Self {
        Candidate::new("", "", 0, 0)
    }

    /// Whether this is the empty-id "unknown" candidate.
    pub fn is_unknown(&self) -> bool {
        self.id.is_empty()
    }

    /// The election order. Strict, total, and computed from candidate fields
    /// alone so every agent reaches the same verdict on the same input.
    ///
    /// Empty ids sort high (they lose), then rank ascending, then id, host,
    /// and port lexicographically/ascending. Lease expiry is deliberately not
    /// part of this order; leases are handled by the lead holder and the
    /// lease check.
    pub fn election_cmp(&self, other: &Candidate) -> Ordering {
        match (self.id.is_empty(), other.id.is_empty()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => self
                .rank
                .cmp(&other.rank)
                .then_with(|| self.id.cmp(&other.id))
                .then_with(|| self.host.cmp(&other.host))
                .then_with(|| self.port.cmp(&other.port)),
        }
    }

    /// `self` beats `other` in an election.
    pub fn precedes(&self, other: &Candidate) -> bool {
        self.election_cmp(other) == Ordering::Less
    }

    /// Equality on the fields that identify an agent (id, host, port, rank),
    /// ignoring leadership state.
    pub fn same_identity(&self, other: &Candidate) -> bool {
        self.id == other.id
            && self.host == other.host
            && self.port == other.port
            && self.rank == other.rank
    }

    /// Canonical JSON encoding for publication on the bus.
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap()
    }

    /// Parse a candidate from a bus payload.
    pub fn from_json(payload: &[u8]) -> Result<Candidate, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unknown() {
            return write!(f, "(unknown)");
        }
        write!(f, "{}@{}:{}#{}", self.id, self.host, self.port, self.rank)?;
        if self.is_leader {
            write!(f, " leader until {}", self.lease_expires)?;
        }
        Ok(())
    }
}
