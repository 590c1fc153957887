//! Lease-based single-leader election with monotonic term numbering.
//!
//! The whole election runs inside one immediate transaction, so the read of
//! the current leader row and the conditional update on `term` act as a
//! compare-and-set: terms are strictly monotonic and no two agents can ever
//! certify the same term. The term doubles as a fencing token carried on
//! task claims.
//!
//! There is no revoke operation; lease expiry is the cancellation mechanism.
//! Leaders renew opportunistically while doing other work.

use chrono::{Duration, Utc};
use rusqlite::params;
use serde_json::json;
use tracing::debug;

use super::codec;
use super::Store;
use crate::domain::Leader;
use crate::errors::Result;

/// Default leader lease length in seconds.
pub const DEFAULT_LEASE_SECS: u64 = 30;

impl Store {
    /// Fetch the current leader record, if any.
    pub fn get_leader(&self) -> Result<Option<Leader>> {
        let mut stmt = self.conn().prepare("SELECT * FROM leader WHERE id = 1")?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => Ok(Some(codec::decode_leader(row)?)),
            None => Ok(None),
        }
    }

    /// The current leader term, or 0 when no leader has ever been elected.
    pub fn current_term(&self) -> Result<i64> {
        Ok(self.get_leader()?.map(|l| l.term).unwrap_or(0))
    }

    /// Attempt to become (or remain) leader.
    ///
    /// Returns `(true, term)` when the caller holds leadership afterwards,
    /// `(false, 0)` when another agent's unexpired lease stands or a
    /// concurrent election won the takeover race.
    ///
    /// - no leader row: insert with term 1
    /// - own unexpired lease: renew, term unchanged
    /// - other agent's unexpired lease: refused
    /// - expired lease: conditional takeover on the observed term, term + 1
    pub fn try_become_leader(&self, candidate_id: &str, lease_secs: u64) -> Result<(bool, i64)> {
        self.immediate(|store| {
            let now = Utc::now();
            let lease_expires = codec::encode_ts(now + Duration::seconds(lease_secs as i64));
            let now_ts = codec::encode_ts(now);

            let Some(current) = store.get_leader()? else {
                store.conn().execute(
                    "INSERT INTO leader (id, agent_id, term, lease_expires_at, elected_at)
                     VALUES (1, ?1, 1, ?2, ?3)",
                    params![candidate_id, lease_expires, now_ts],
                )?;
                store.append_event(
                    "leader_elected",
                    Some(candidate_id),
                    None,
                    Some(json!({ "term": 1, "reason": "first_leader" })),
                )?;
                debug!(agent = candidate_id, term = 1, "first leader elected");
                return Ok((true, 1));
            };

            if now < current.lease_expires_at {
                if current.agent_id == candidate_id {
                    // Renewal: extend the lease, keep the term.
                    store.conn().execute(
                        "UPDATE leader SET lease_expires_at = ?1 WHERE id = 1",
                        params![lease_expires],
                    )?;
                    return Ok((true, current.term));
                }
                return Ok((false, 0));
            }

            // Lease expired: fenced takeover on the term we observed.
            let new_term = current.term + 1;
            let changed = store.conn().execute(
                "UPDATE leader
                    SET agent_id = ?1, term = ?2, lease_expires_at = ?3, elected_at = ?4
                  WHERE id = 1 AND term = ?5",
                params![candidate_id, new_term, lease_expires, now_ts, current.term],
            )?;

            if changed == 1 {
                store.append_event(
                    "leader_elected",
                    Some(candidate_id),
                    None,
                    Some(json!({
                        "term": new_term,
                        "reason": "lease_expired",
                        "previous_leader": current.agent_id,
                    })),
                )?;
                debug!(agent = candidate_id, term = new_term, "leadership taken over");
                Ok((true, new_term))
            } else {
                // Another election committed between our read and update.
                Ok((false, 0))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_store() -> (tempfile::TempDir, Store) {
        let temp = tempdir().unwrap();
        let store = Store::init(temp.path(), 5000).unwrap();
        (temp, store)
    }

    #[test]
    fn test_no_leader_initially() {
        let (_t, store) = test_store();
        assert!(store.get_leader().unwrap().is_none());
        assert_eq!(store.current_term().unwrap(), 0);
    }

    #[test]
    fn test_first_candidate_wins_term_one() {
        let (_t, store) = test_store();
        assert_eq!(store.try_become_leader("a1", 30).unwrap(), (true, 1));

        let leader = store.get_leader().unwrap().unwrap();
        assert_eq!(leader.agent_id, "a1");
        assert_eq!(leader.term, 1);
        assert!(!leader.is_expired());
    }

    #[test]
    fn test_contender_refused_while_lease_valid() {
        let (_t, store) = test_store();
        store.try_become_leader("a1", 30).unwrap();
        assert_eq!(store.try_become_leader("a2", 30).unwrap(), (false, 0));
        assert_eq!(store.get_leader().unwrap().unwrap().agent_id, "a1");
    }

    #[test]
    fn test_renewal_extends_lease_same_term() {
        let (_t, store) = test_store();
        store.try_become_leader("a1", 30).unwrap();
        let before = store.get_leader().unwrap().unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(store.try_become_leader("a1", 30).unwrap(), (true, 1));

        let after = store.get_leader().unwrap().unwrap();
        assert_eq!(after.term, before.term);
        assert!(after.lease_expires_at > before.lease_expires_at);
        assert_eq!(after.elected_at, before.elected_at);
    }

    #[test]
    fn test_takeover_after_expiry_increments_term() {
        let (_t, store) = test_store();
        store.try_become_leader("a1", 1).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1200));

        assert_eq!(store.try_become_leader("a2", 1).unwrap(), (true, 2));
        // The deposed leader is now an ordinary contender.
        assert_eq!(store.try_become_leader("a1", 1).unwrap(), (false, 0));
    }

    #[test]
    fn test_terms_are_strictly_monotonic() {
        let (_t, store) = test_store();
        let mut last_term = 0;
        for agent in ["a1", "a2", "a3"] {
            let (won, term) = store.try_become_leader(agent, 0).unwrap();
            // Zero-length lease: each successive call sees an expired lease.
            assert!(won);
            assert!(term > last_term);
            last_term = term;
        }
        assert_eq!(last_term, 3);
    }
}
