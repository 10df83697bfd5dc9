//! Collaborator seams consumed by the leader.
//!
//! The leader orders mutations; everything else (the replicated data tree,
//! durable epoch storage, the committed transaction log, connection
//! authentication, and the election machinery) is behind these traits.
//! Production wiring supplies the real implementations; tests inject
//! in-memory or mock ones.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;

use crate::QuorumVerifier;
use crate::Result;
use crate::ServerId;
use crate::Zxid;

/// `(current_epoch, last_zxid)` pair exchanged during epoch agreement.
/// An epoch of −1 means the peer has never recorded one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSummary {
    pub current_epoch: i64,
    pub last_zxid: Zxid,
}

impl StateSummary {
    pub fn new(current_epoch: i64, last_zxid: Zxid) -> Self {
        StateSummary {
            current_epoch,
            last_zxid,
        }
    }

    /// Strict ordering: epoch first, zxid as tie-break.
    pub fn is_more_recent_than(&self, other: &StateSummary) -> bool {
        self.current_epoch > other.current_epoch
            || (self.current_epoch == other.current_epoch && self.last_zxid > other.last_zxid)
    }
}

/// What a proposed mutation is.
#[derive(Debug, Clone)]
pub enum RequestKind {
    /// Ordinary state mutation; the payload is the serialized transaction.
    Write,
    /// Membership change carrying the configuration to activate.
    Reconfig {
        new_config: std::sync::Arc<QuorumVerifier>,
    },
}

/// A mutation handed to the proposal pipeline, either originated locally or
/// forwarded by a learner.
#[derive(Debug, Clone)]
pub struct Request {
    pub session_id: i64,
    pub kind: RequestKind,
    pub payload: Bytes,
    pub throttled: bool,
}

impl Request {
    pub fn write(session_id: i64, payload: Bytes) -> Self {
        Request {
            session_id,
            kind: RequestKind::Write,
            payload,
            throttled: false,
        }
    }

    pub fn reconfig(session_id: i64, new_config: std::sync::Arc<QuorumVerifier>) -> Self {
        let payload = Bytes::from(new_config.to_config_text().into_bytes());
        Request {
            session_id,
            kind: RequestKind::Reconfig { new_config },
            payload,
            throttled: false,
        }
    }

    pub fn is_reconfig(&self) -> bool {
        matches!(self.kind, RequestKind::Reconfig { .. })
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            RequestKind::Write => "write",
            RequestKind::Reconfig { .. } => "reconfig",
        };
        write!(f, "{kind} request from session 0x{:x}", self.session_id)
    }
}

/// A record of the committed transaction log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedTxn {
    pub zxid: Zxid,
    pub payload: Bytes,
}

/// The replicated data tree and its request-apply pipeline.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReplicatedState: Send + Sync + 'static {
    /// Restore in-memory state from the latest snapshot and log tail.
    async fn load_data(&self) -> Result<()>;

    /// Highest zxid applied to the data tree.
    fn last_processed_zxid(&self) -> Zxid;

    /// Hand a committed request to the apply pipeline. Application is
    /// asynchronous; the pipeline calls [`crate::Leader::confirm_applied`]
    /// when done.
    fn submit_request(&self, zxid: Zxid, request: Request);

    /// A client mutation forwarded by a learner (REQUEST packet); enters the
    /// request pipeline ahead of proposal numbering.
    fn submit_learner_request(&self, sid: ServerId, payload: Bytes);

    /// Keep a client session alive on behalf of a follower.
    fn touch_session(&self, session_id: i64, timeout: i32);

    /// Validate (and touch) a global session for REVALIDATE.
    fn check_global_session(&self, session_id: i64, timeout: i32) -> bool;

    /// Serialized full snapshot for SNAP syncs.
    async fn snapshot(&self) -> Result<Bytes>;
}

/// Durable epoch storage. `accepted` is the highest epoch this peer has
/// promised to any leader; `current` is the epoch of the last reign it
/// completed discovery for. Both survive restarts.
#[cfg_attr(test, automock)]
pub trait AcceptedEpochStore: Send + Sync + 'static {
    fn accepted_epoch(&self) -> i64;
    fn set_accepted_epoch(&self, epoch: i64) -> Result<()>;
    fn current_epoch(&self) -> i64;
    fn set_current_epoch(&self, epoch: i64) -> Result<()>;
}

/// Read access to the committed transaction log for DIFF replays.
#[cfg_attr(test, automock)]
pub trait TransactionLog: Send + Sync + 'static {
    /// Oldest committed zxid still replayable.
    fn min_committed_zxid(&self) -> Zxid;

    /// Newest committed zxid.
    fn max_committed_zxid(&self) -> Zxid;

    /// Committed records in `(after, upto]`, ascending by zxid.
    fn committed_range(&self, after: Zxid, upto: Zxid) -> Vec<CommittedTxn>;
}

/// Authenticates learner connections from the credentials carried in the
/// handshake packet.
#[cfg_attr(test, automock)]
pub trait QuorumAuthServer: Send + Sync + 'static {
    fn authenticate(&self, sid: Option<ServerId>, auth: &[u8]) -> Result<()>;
}

/// Invoked when the leader terminates so the peer re-enters election.
#[cfg_attr(test, automock)]
pub trait ElectionDriver: Send + Sync + 'static {
    fn leader_shutdown(&self, reason: &str);
}

/// Optional escape hatch consulted by the tick loop before declaring the
/// quorum lost. Returning `true` keeps the leader alive for this tick.
#[cfg_attr(test, automock)]
pub trait QuorumOracle: Send + Sync + 'static {
    fn override_quorum_decision(
        &self,
        synced: &std::collections::HashSet<ServerId>,
        outstanding: usize,
    ) -> bool;
}
