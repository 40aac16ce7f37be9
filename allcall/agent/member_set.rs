//! Deduplicated, ordered collections of candidates and their set algebra.

use serde::{Deserialize, Serialize};

use crate::candidate::Candidate;

/// The candidates observed in one heartbeat round.
///
/// Entries are unique per id and kept sorted under the election order, so
/// iteration order and the JSON encoding are canonical: equal sets serialize
/// to identical bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSet {
    members: Vec<Candidate>,
}

impl MemberSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a candidate, deduplicating on id.
    ///
    /// A second insert with the same id overwrites the first: an agent that
    /// re-registered supersedes its stale advertisement.
    pub fn insert(&mut self, candidate: Candidate) {
        if let Some(at) = self.members.iter().position(|m| m.id == candidate.id) {
            if self.members[at] == candidate {
                return;
            }
            self.members.remove(at);
        }
        let at = match self
            .members
            .binary_search_by(|m| m.election_cmp(&candidate))
        {
            Ok(at) | Err(at) => at,
        };
        self.members.insert(at, candidate);
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// True when no members were observed.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members in election order, strongest first.
    pub fn iter(&self) -> impl Iterator<Item = &Candidate> {
        self.members.iter()
    }

    /// The candidate ranked first under the election order.
    pub fn min_rank(&self) -> Option<&Candidate> {
        self.members.first()
    }

    /// Whether a member with this id is present.
    pub fn contains_id(&self, id: &str) -> bool {
        self.members.iter().any(|m| m.id == id)
    }

    /// Remove all members.
    pub fn clear(&mut self) {
        self.members.clear();
    }

    /// Members of `self` absent from `other`, keyed on id.
    ///
    /// The designated leader is carried through: a diff entry matching the
    /// leader's id keeps its leader flag and lease in the event payload.
    pub fn set_diff(&self, other: &MemberSet, leader: &Candidate) -> MemberSet {
        let mut out = MemberSet::new();
        for member in &self.members {
            if other.contains_id(&member.id) {
                continue;
            }
            let mut entry = member.clone();
            if !leader.is_unknown() && entry.id == leader.id {
                entry.is_leader = true;
                entry.lease_expires = leader.lease_expires;
            }
            out.insert(entry);
        }
        out
    }

    /// Element-wise equality on identity fields (id, host, port, rank).
    ///
    /// Leadership state is excluded so that a round which only renewed a
    /// lease compares equal to its predecessor.
    pub fn sets_equal(&self, other: &MemberSet) -> bool {
        self.members.len() == other.members.len()
            && self
                .members
                .iter()
                .zip(other.members.iter())
                .all(|(a, b)| a.same_identity(b))
    }

    /// Canonical JSON encoding for publication on the bus.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap()
    }

    /// Parse a set from a bus payload.
    pub fn from_bytes(payload: &[u8]) -> Result<MemberSet, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}
