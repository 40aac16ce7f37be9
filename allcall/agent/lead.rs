//! The lead holder: guards the currently believed leader.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::candidate::Candidate;
use crate::config::DEFAULT_HISTORY_COUNT;
use crate::election::lease_outstanding;

/// Guards the accepted leader and records the history of accepted leaders.
///
/// Updates go through the monotone rule of [`LeadHolder::set_leader`]; the
/// accepted leader is never rolled back to a weaker candidate while its
/// lease is outstanding. Every accessor returns an owned copy, never a
/// shared reference, so no caller can observe a half-updated leader.
#[derive(Debug)]
pub struct LeadHolder {
    inner: Mutex<LeadInner>,
    max_clock_skew: Duration,
}

#[derive(Debug)]
struct LeadInner {
    current: Candidate,
    history: VecDeque<Candidate>,
    history_count: usize,
    my_loc: Option<Candidate>,
}

impl LeadHolder {
    /// A holder starting from the empty-id candidate with no lease.
    ///
    /// A `history_count` of zero falls back to the default of 100.
    pub fn new(history_count: usize, max_clock_skew: Duration) -> Self {
        let history_count = if history_count == 0 {
            DEFAULT_HISTORY_COUNT
        } else {
            history_count
        };
        LeadHolder {
            inner: Mutex::new(LeadInner {
                current: Candidate::unknown(),
                history: VecDeque::with_capacity(history_count.min(1024)),
                history_count,
                my_loc: None,
            }),
            max_clock_skew,
        }
    }

    /// Offer a candidate as leader; returns `(accepted, effective)`.
    ///
    /// * empty-id candidates are always rejected;
    /// * a strictly stronger candidate is accepted;
    /// * a strictly weaker candidate is rejected while the incumbent's lease
    ///   (skew-extended) is outstanding at `now`, and accepted once that
    ///   lease has lapsed;
    /// * a candidate equal under the election order is accepted only with a
    ///   strictly later lease expiry: the renewal path for the same leader.
    ///
    /// `effective` is the leader in force after the call, always a copy.
    pub fn set_leader(&self, candidate: Candidate, now: DateTime<Utc>) -> (bool, Candidate) {
        let mut inner = self.inner.lock().unwrap();
        if candidate.is_unknown() {
            return (false, inner.current.clone());
        }

        let new_wins = candidate.precedes(&inner.current);
        let old_wins = inner.current.precedes(&candidate);
        let accept = if new_wins {
            true
        } else if old_wins {
            // A lapsed lease no longer protects the incumbent.
            !lease_outstanding(inner.current.lease_expires, self.max_clock_skew, now)
        } else {
            candidate.lease_expires > inner.current.lease_expires
        };
        if !accept {
            return (false, inner.current.clone());
        }

        inner.current = candidate;
        if inner.history.len() == inner.history_count {
            inner.history.pop_front();
        }
        let accepted = inner.current.clone();
        inner.history.push_back(accepted.clone());
        (true, accepted)
    }

    /// A copy of the currently accepted leader.
    pub fn get_leader(&self) -> Candidate {
        self.inner.lock().unwrap().current.clone()
    }

    /// The accepted leader's canonical JSON, as broadcast in each ping.
    pub fn leader_json(&self) -> Vec<u8> {
        self.inner.lock().unwrap().current.to_json()
    }

    /// Record this agent's own location. One-shot: a second call is a
    /// programmer error and asserts.
    pub fn set_my_loc(&self, my_loc: Candidate) {
        let mut inner = self.inner.lock().unwrap();
        assert!(
            inner.my_loc.is_none(),
            "set_my_loc called twice; the agent's identity is fixed at init"
        );
        inner.my_loc = Some(my_loc);
    }

    /// A copy of this agent's own location, if initialized.
    pub fn my_loc(&self) -> Option<Candidate> {
        self.inner.lock().unwrap().my_loc.clone()
    }

    /// Copies of previously accepted leaders, oldest first. Diagnostics only.
    pub fn history(&self) -> Vec<Candidate> {
        self.inner.lock().unwrap().history.iter().cloned().collect()
    }
}
