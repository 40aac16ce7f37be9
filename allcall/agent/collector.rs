//! Accumulates pong replies delivered by the bus within one heartbeat window.

use std::mem;
use std::sync::Mutex;

use crate::candidate::Candidate;
use crate::error::Error;
use crate::member_set::MemberSet;

/// Collects the pongs of one heartbeat round.
///
/// Logically single-writer, physically multi-writer: the bus delivery tasks
/// insert concurrently under the mutex, and the membership loop is the sole
/// reader via [`PongCollector::get_set_and_clear`].
#[derive(Debug, Default)]
pub struct PongCollector {
    current: Mutex<MemberSet>,
}

impl PongCollector {
    /// An empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a pong payload and record the candidate it advertises.
    ///
    /// Undecodable payloads fail with [`Error::MalformedPong`]; the caller
    /// logs and drops, keeping the delivery path panic-free.
    pub fn receive_pong(&self, payload: &[u8]) -> Result<(), Error> {
        let candidate = Candidate::from_json(payload).map_err(Error::MalformedPong)?;
        self.current.lock().unwrap().insert(candidate);
        Ok(())
    }

    /// Atomically snapshot the collected set and reset for the next round.
    ///
    /// The fresh accumulator is pre-seeded with `my_loc`, and `my_loc` is
    /// guaranteed present in the returned snapshot as well, so
    /// self-membership never depends on loopback delivery of our own pong.
    pub fn get_set_and_clear(&self, my_loc: &Candidate) -> (usize, MemberSet) {
        let mut snapshot = {
            let mut current = self.current.lock().unwrap();
            let snapshot = mem::take(&mut *current);
            current.insert(my_loc.clone());
            snapshot
        };
        if !snapshot.contains_id(&my_loc.id) {
            snapshot.insert(my_loc.clone());
        }
        (snapshot.len(), snapshot)
    }
}
