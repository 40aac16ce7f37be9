//! The lease check: deciding each round whether a lease is outstanding or a
//! new leader must be elected.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::candidate::Candidate;
use crate::member_set::MemberSet;

// Additions to lease timestamps are clamped so that pathological configured
// durations cannot overflow chrono's representable range.
const MAX_ADVANCE_MS: u128 = 1_000 * 3_600 * 24 * 365 * 100; // one century

/// `t + d`, saturating far below chrono's overflow horizon.
pub(crate) fn advance(t: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    t + chrono::Duration::milliseconds(d.as_millis().min(MAX_ADVANCE_MS) as i64)
}

/// Whether a lease expiring at `lease_expires` is still outstanding at `now`,
/// extended by the configured clock-skew grace. The boundary is inclusive: a
/// lease sitting exactly one skew behind `now` is still honored.
pub(crate) fn lease_outstanding(
    lease_expires: DateTime<Utc>,
    max_clock_skew: Duration,
    now: DateTime<Utc>,
) -> bool {
    advance(lease_expires, max_clock_skew) >= now
}

/// Decide the effective leader for one round.
///
/// Returns `(expired, leader)`:
///
/// * an outstanding lease on `prev_lead` is honored as-is;
/// * with no candidates there is nobody to elect, so the previous leader is
///   kept rather than inventing one;
/// * otherwise the lease has lapsed and the strongest observed candidate is
///   elected with a fresh lease of `now + lease_duration`.
///
/// The verdict is a pure function of the arguments, so every agent that
/// observed the same member set and previous leader reaches the same answer.
pub(crate) fn leader_lease_check(
    members: &MemberSet,
    now: DateTime<Utc>,
    lease_duration: Duration,
    prev_lead: &Candidate,
    max_clock_skew: Duration,
) -> (bool, Candidate) {
    if lease_outstanding(prev_lead.lease_expires, max_clock_skew, now) {
        return (false, prev_lead.clone());
    }
    let Some(strongest) = members.min_rank() else {
        return (false, prev_lead.clone());
    };
    let mut lead = strongest.clone();
    lead.is_leader = true;
    lead.lease_expires = advance(now, lease_duration);
    (true, lead)
}

#[cfg(test)]
mod test {
    use chrono::TimeZone;

    use super::*;

    const LEASE: Duration = Duration::from_secs(10);
    const SKEW: Duration = Duration::from_secs(1);

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn members(ids_ranks: &[(&str, i32)]) -> MemberSet {
        let mut set = MemberSet::new();
        for (id, rank) in ids_ranks {
            set.insert(Candidate::new(*id, "h", 1, *rank));
        }
        set
    }

    #[test]
    fn outstanding_lease_is_honored() {
        let mut prev = Candidate::new("b", "h", 1, 0);
        prev.is_leader = true;
        prev.lease_expires = at(5);

        let set = members(&[("a", 0), ("b", 1)]);
        let (expired, lead) = leader_lease_check(&set, at(0), LEASE, &prev, SKEW);
        assert!(!expired);
        assert_eq!(lead, prev);
    }

    #[test]
    fn expiry_boundary_is_inclusive_of_skew() {
        let mut prev = Candidate::new("b", "h", 1, 0);
        prev.is_leader = true;
        // Lease lapsed exactly one skew ago: still honored.
        prev.lease_expires = at(-1);

        let set = members(&[("a", 0)]);
        let (expired, lead) = leader_lease_check(&set, at(0), LEASE, &prev, SKEW);
        assert!(!expired);
        assert_eq!(lead.id, "b");

        // One more millisecond and it lapses.
        let (expired, lead) =
            leader_lease_check(&set, at(0) + chrono::Duration::milliseconds(1), LEASE, &prev, SKEW);
        assert!(expired);
        assert_eq!(lead.id, "a");
    }

    #[test]
    fn empty_set_never_invents_a_leader() {
        let mut prev = Candidate::new("b", "h", 1, 0);
        prev.is_leader = true;
        prev.lease_expires = at(-100);

        let (expired, lead) = leader_lease_check(&MemberSet::new(), at(0), LEASE, &prev, SKEW);
        assert!(!expired);
        assert_eq!(lead, prev);
    }

    #[test]
    fn expired_lease_elects_strongest_with_fresh_lease() {
        let prev = Candidate::unknown();
        let set = members(&[("a", 1), ("b", 0)]);

        let now = at(0);
        let (expired, lead) = leader_lease_check(&set, now, LEASE, &prev, SKEW);
        assert!(expired);
        assert_eq!(lead.id, "b");
        assert!(lead.is_leader);
        assert_eq!(lead.lease_expires, advance(now, LEASE));
    }

    #[test]
    fn verdict_is_deterministic_across_agents() {
        // Same inputs, many evaluations: identical output.
        let prev = Candidate::unknown();
        let set = members(&[("x", 5), ("y", 5), ("z", 2)]);
        let now = at(42);

        let first = leader_lease_check(&set, now, LEASE, &prev, SKEW);
        for _ in 0..10 {
            assert_eq!(leader_lease_check(&set, now, LEASE, &prev, SKEW), first);
        }
        assert_eq!(first.1.id, "z");
    }
}
