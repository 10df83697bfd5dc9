use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::AckQuorumTracker;
use crate::QuorumPacket;
use crate::QuorumVerifier;
use crate::Request;
use crate::ServerId;
use crate::Zxid;

/// A proposed-but-not-yet-committed transaction: the broadcast packet, the
/// originating request (absent for protocol-internal proposals such as
/// NEWLEADER), and the ack tracker deciding when it may commit.
#[derive(Debug, Clone)]
pub struct Proposal {
    pub packet: QuorumPacket,
    pub request: Option<Request>,
    pub tracker: AckQuorumTracker,
}

impl Proposal {
    pub fn new(packet: QuorumPacket, request: Option<Request>) -> Self {
        Proposal {
            packet,
            request,
            tracker: AckQuorumTracker::new(),
        }
    }

    pub fn zxid(&self) -> Zxid {
        self.packet.zxid
    }

    pub fn is_reconfig(&self) -> bool {
        self.request.as_ref().is_some_and(Request::is_reconfig)
    }

    pub fn add_verifier(&mut self, verifier: Arc<QuorumVerifier>) {
        self.tracker.add_verifier(verifier);
    }

    pub fn add_ack(&mut self, sid: ServerId) {
        self.tracker.add_ack(sid);
    }

    pub fn has_all_quorums(&self) -> bool {
        self.tracker.has_all_quorums()
    }
}

impl fmt::Display for Proposal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}, {:?}", self.packet.ptype, self.zxid(), self.request)
    }
}

/// Outstanding proposals ordered by zxid.
///
/// The ordering is load-bearing: in-order commit checks, learner catch-up
/// replay and the designated-leader walk all iterate consecutive zxids.
#[derive(Debug, Default)]
pub struct OutstandingTable {
    proposals: BTreeMap<Zxid, Proposal>,
}

impl OutstandingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, proposal: Proposal) {
        self.proposals.insert(proposal.zxid(), proposal);
    }

    pub fn get(&self, zxid: Zxid) -> Option<&Proposal> {
        self.proposals.get(&zxid)
    }

    pub fn get_mut(&mut self, zxid: Zxid) -> Option<&mut Proposal> {
        self.proposals.get_mut(&zxid)
    }

    pub fn remove(&mut self, zxid: Zxid) -> Option<Proposal> {
        self.proposals.remove(&zxid)
    }

    pub fn contains(&self, zxid: Zxid) -> bool {
        self.proposals.contains_key(&zxid)
    }

    pub fn len(&self) -> usize {
        self.proposals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proposals.is_empty()
    }

    /// In-order iteration over all outstanding proposals.
    pub fn iter(&self) -> btree_map::Values<'_, Zxid, Proposal> {
        self.proposals.values()
    }

    /// In-order iteration over proposals with zxid strictly greater than
    /// `after`.
    pub fn iter_after(&self, after: Zxid) -> impl Iterator<Item = &Proposal> {
        use std::ops::Bound;
        self.proposals
            .range((Bound::Excluded(after), Bound::Unbounded))
            .map(|(_, p)| p)
    }
}

/// Size bookkeeping for proposed payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProposalStats {
    pub last_size: usize,
    pub min_size: usize,
    pub max_size: usize,
    seen: bool,
}

impl ProposalStats {
    pub fn record(&mut self, size: usize) {
        self.last_size = size;
        if !self.seen {
            self.min_size = size;
            self.max_size = size;
            self.seen = true;
        } else {
            self.min_size = self.min_size.min(size);
            self.max_size = self.max_size.max(size);
        }
    }
}
