use std::collections::HashSet;
use std::sync::Arc;

use super::QuorumVerifier;
use crate::ServerId;

/// One `(verifier, ackset)` pair. The ackset only ever contains sids that
/// are voters under the pair's verifier.
#[derive(Debug, Clone)]
pub struct VerifierAckSet {
    verifier: Arc<QuorumVerifier>,
    ackset: HashSet<ServerId>,
}

impl VerifierAckSet {
    fn new(verifier: Arc<QuorumVerifier>) -> Self {
        VerifierAckSet {
            verifier,
            ackset: HashSet::new(),
        }
    }

    pub fn verifier(&self) -> &Arc<QuorumVerifier> {
        &self.verifier
    }

    pub fn ackset(&self) -> &HashSet<ServerId> {
        &self.ackset
    }

    pub fn has_quorum(&self) -> bool {
        self.verifier.contains_quorum(&self.ackset)
    }
}

/// Ack aggregation across the configurations a proposal must satisfy.
///
/// Ordinarily a proposal carries one pair; while a reconfiguration is
/// outstanding it carries two (the current config and the pending one), and
/// commit requires a quorum in each.
#[derive(Debug, Clone, Default)]
pub struct AckQuorumTracker {
    pairs: Vec<VerifierAckSet>,
}

impl AckQuorumTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a verifier. A verifier with the same version as an already
    /// attached one is the same configuration and is skipped.
    pub fn add_verifier(&mut self, verifier: Arc<QuorumVerifier>) {
        if self
            .pairs
            .iter()
            .any(|pair| pair.verifier.version() == verifier.version())
        {
            return;
        }
        self.pairs.push(VerifierAckSet::new(verifier));
    }

    /// Record an ack. Each pair admits the sid only if it votes under that
    /// pair's verifier.
    pub fn add_ack(&mut self, sid: ServerId) {
        for pair in &mut self.pairs {
            if pair.verifier.is_voter(sid) {
                pair.ackset.insert(sid);
            }
        }
    }

    /// Whether `sid` votes under any attached verifier.
    pub fn has_sid(&self, sid: ServerId) -> bool {
        self.pairs.iter().any(|pair| pair.verifier.is_voter(sid))
    }

    /// True iff every attached verifier is satisfied by its ackset.
    pub fn has_all_quorums(&self) -> bool {
        self.pairs.iter().all(VerifierAckSet::has_quorum)
    }

    pub fn pairs(&self) -> &[VerifierAckSet] {
        &self.pairs
    }

    /// The most recently attached pair: during a reconfig, the pending
    /// configuration.
    pub fn newest_pair(&self) -> Option<&VerifierAckSet> {
        self.pairs.last()
    }

    /// `sid,sid|sid,sid` rendering of the acksets, for logs.
    pub fn ack_sets_to_string(&self) -> String {
        self.pairs
            .iter()
            .map(|pair| {
                let mut sids: Vec<ServerId> = pair.ackset.iter().copied().collect();
                sids.sort_unstable();
                sids.iter()
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .collect::<Vec<_>>()
            .join("|")
    }
}
