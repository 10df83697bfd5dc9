//! Reconfiguration commit path.
//!
//! A committed reconfig swaps the active view, picks the server that leads
//! the new configuration, and — when that is not this peer — freezes the
//! commit pipeline until re-election hands over.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::info;
use tracing::warn;

use super::Leader;
use super::LeaderInner;
use crate::AckQuorumTracker;
use crate::QuorumVerifier;
use crate::ReconfigError;
use crate::Request;
use crate::Result;
use crate::ServerId;
use crate::Zxid;

impl Leader {
    /// Validate a reconfiguration request against the active view and wrap
    /// it as a proposable [`Request`]. The version stamp and the last-seen
    /// swap happen at propose time, under the leader lock.
    pub fn prepare_reconfig(
        &self,
        session_id: i64,
        new_config_text: &str,
        from_version: Option<u64>,
    ) -> Result<Request> {
        if !self.config().reconfig_enabled {
            return Err(ReconfigError::Disabled.into());
        }
        let current = self.current_verifier();
        if self.last_seen_verifier().version() > current.version() {
            return Err(ReconfigError::InProgress.into());
        }
        if let Some(requested) = from_version {
            if requested != current.version() {
                return Err(ReconfigError::BadVersion {
                    current: current.version(),
                    requested,
                }
                .into());
            }
        }
        let new_config = QuorumVerifier::parse(new_config_text)
            .map_err(|e| ReconfigError::InvalidConfig(e.to_string()))?;
        if !self.is_quorum_synced(&new_config) {
            return Err(ReconfigError::NewConfigNoQuorum.into());
        }
        Ok(Request::reconfig(session_id, Arc::new(new_config)))
    }

    /// Choose who leads the new configuration.
    ///
    /// If this leader is a voter of the new config at the same quorum
    /// address, it stays. Otherwise pick, among the new-config voters that
    /// acked the reconfig, the one that acknowledged the longest run of
    /// consecutive subsequent proposals: it is the most up to date, so the
    /// fewest in-flight ops get dropped. The walk stops at the first gap
    /// in the outstanding table.
    pub(crate) fn designated_leader(
        &self,
        inner: &LeaderInner,
        tracker: &AckQuorumTracker,
        zxid: Zxid,
    ) -> ServerId {
        let Some(new_pair) = tracker.newest_pair() else {
            return self.my_id();
        };
        let new_qv = new_pair.verifier();

        if new_qv.is_voter(self.my_id()) {
            let same_addr = match (
                new_qv.server(self.my_id()),
                self.current_verifier().server(self.my_id()),
            ) {
                (Some(new_me), Some(old_me)) => new_me.quorum_addr == old_me.quorum_addr,
                _ => false,
            };
            if same_addr {
                return self.my_id();
            }
        }

        // Candidates: new-config voters that acked the reconfig (a quorum
        // of them has). BTreeSet keeps the tie-break deterministic.
        let mut candidates: BTreeSet<ServerId> = new_pair
            .ackset()
            .iter()
            .copied()
            .filter(|sid| *sid != self.my_id())
            .collect();
        let Some(&first) = candidates.iter().next() else {
            return self.my_id();
        };
        let mut current_candidate = first;

        let mut walk = zxid.next();
        while let Some(proposal) = inner.outstanding.get(walk) {
            for pair in proposal.tracker.pairs() {
                candidates.retain(|sid| pair.ackset().contains(sid));
                let Some(&best) = candidates.iter().next() else {
                    // Nobody acked this one; best seen so far wins.
                    return current_candidate;
                };
                current_candidate = best;
                if candidates.len() == 1 {
                    return current_candidate;
                }
            }
            walk = walk.next();
        }

        current_candidate
    }

    /// Atomically install the new view. When leadership moves elsewhere,
    /// stop committing: the designated leader takes over from here.
    pub(crate) fn apply_reconfig(
        &self,
        inner: &mut LeaderInner,
        new_qv: Arc<QuorumVerifier>,
        designated: ServerId,
    ) {
        let last_seen = if self.last_seen_verifier().version() > new_qv.version() {
            self.last_seen_verifier()
        } else {
            new_qv.clone()
        };
        self.swap_verifiers(new_qv, last_seen);

        if designated != self.my_id() {
            info!(
                "Committing a reconfiguration (reconfigEnabled={}); this leader is not the designated leader anymore, setting allowedToCommit=false",
                self.config().reconfig_enabled
            );
            inner.allowed_to_commit = false;
        }
    }

    /// Close sessions of servers that are no longer part of the view. They
    /// have already received COMMITANDACTIVATE on their FIFO.
    pub(crate) fn drop_departed_learners(&self, new_qv: &QuorumVerifier) {
        for handle in self.learners() {
            let sid = handle.sid();
            // Synthetic (negative) sids were never configured members.
            if sid > 0 && !new_qv.contains_member(sid) {
                warn!("Closing session of removed server {}", sid);
                handle.close();
                self.remove_learner(&handle);
            }
        }
    }
}
