//! Zab Leader Error Hierarchy
//!
//! Error types for the leader side of the Zab protocol, categorized by
//! protocol layer and operational concerns. Per-learner failures stay local
//! to the session that produced them; failures that invalidate the leader's
//! quorum terminate the leader and hand control back to the election driver.

use config::ConfigError;

use crate::Zxid;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Infrastructure-level failures (network, wire framing)
    #[error(transparent)]
    System(#[from] SystemError),

    /// Leader configuration validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Zab protocol violations and failures
    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    /// Unrecoverable failures requiring leader termination
    #[error("Fatal error: {0}")]
    Fatal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    /// Epoch agreement failures during the discovery phase
    #[error(transparent)]
    Epoch(#[from] EpochError),

    /// Broadcast-phase failures (proposal / commit pipeline)
    #[error(transparent)]
    Broadcast(#[from] BroadcastError),

    /// Membership reconfiguration failures
    #[error(transparent)]
    Reconfig(#[from] ReconfigError),
}

#[derive(Debug, thiserror::Error)]
pub enum EpochError {
    /// The connecting set never formed a quorum within `init_limit` ticks
    #[error("Timeout while waiting for epoch from quorum")]
    Timeout,

    /// The electing set never acked the epoch within `init_limit` ticks
    #[error("Timeout while waiting for epoch to be acked by quorum")]
    AckTimeout,

    /// NEWLEADER was never acked by a quorum within `init_limit` ticks
    #[error("Timeout while waiting for NEWLEADER to be acked by quorum")]
    NewLeaderTimeout,

    /// A follower's state summary is more recent than the leader's own.
    /// The leader must abdicate; re-election will pick the ahead peer.
    #[error(
        "Follower is ahead of the leader, leader summary: {leader_epoch} (current epoch), {leader_zxid} (last zxid)"
    )]
    FollowerAhead {
        leader_epoch: i64,
        leader_zxid: Zxid,
    },

    /// A tracked voter returned to election while the barrier was waiting
    /// past `max_time_to_wait_for_epoch`
    #[error("Epoch agreement aborted: voter changed mind while waiting")]
    Aborted,
}

#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    /// The zxid counter saturated its low 32 bits; a new epoch (and thus
    /// re-election) is the only way forward
    #[error("zxid lower 32 bits have rolled over, forcing re-election, and therefore new epoch start")]
    XidRollover,

    /// A throttled request reached the proposal pipeline
    #[error("Throttled request submitted as proposal")]
    ThrottledRequest,

    /// Proposal submitted after the leader shut down
    #[error("Leader is shut down: {0}")]
    LeaderShutdown(String),

    /// The tick loop found the synced set short of a quorum
    #[error("Quorum lost: {0}")]
    QuorumLost(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ReconfigError {
    /// Only one reconfiguration may be outstanding at a time
    #[error("Another reconfiguration is in progress")]
    InProgress,

    /// Caller's `from_version` does not match the active configuration
    #[error("Reconfig version mismatch (current: {current:#x}, requested from: {requested:#x})")]
    BadVersion { current: u64, requested: u64 },

    /// The proposed configuration cannot form a quorum from the learners
    /// currently synced with the leader
    #[error("New configuration cannot form a quorum of currently synced members")]
    NewConfigNoQuorum,

    /// Dynamic reconfiguration is disabled by configuration
    #[error("Dynamic reconfiguration is disabled")]
    Disabled,

    /// Malformed membership definition
    #[error("Invalid membership configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    // Network layer
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    // Wire framing layer
    #[error("Wire protocol error: {0}")]
    Wire(#[from] WireError),
}

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// None of the configured quorum addresses could be bound
    #[error("Leader failed to initialize any of the following sockets: {addresses}")]
    BindFailure { addresses: String },

    /// Learner socket I/O failure; closes that session only
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Learner closed the connection mid-protocol
    #[error("Connection closed by learner")]
    ConnectionClosed,

    /// A learner failed to answer within its session deadline
    #[error("Learner session timed out after {0:?}")]
    SessionTimeout(std::time::Duration),

    /// Quorum authentication rejected the learner
    #[error("Learner authentication failed: {0}")]
    AuthFailed(String),

    #[error("{0}")]
    SignalSendFailed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("Unknown packet type: {0}")]
    UnknownPacketType(u32),

    #[error("Truncated packet body (needed {needed} more bytes)")]
    Truncated { needed: usize },

    #[error("Frame exceeds maximum size: {0} bytes")]
    OversizedFrame(usize),

    #[error("Invalid buffer length marker: {0}")]
    InvalidLength(i32),

    /// Handshake packet was not the expected type
    #[error("Unexpected packet {got} while waiting for {expected}")]
    UnexpectedPacket {
        expected: &'static str,
        got: &'static str,
    },
}

// ============== Conversion Implementations ============== //
impl From<NetworkError> for Error {
    fn from(e: NetworkError) -> Self {
        Error::System(SystemError::Network(e))
    }
}

impl From<WireError> for Error {
    fn from(e: WireError) -> Self {
        Error::System(SystemError::Wire(e))
    }
}

impl From<EpochError> for Error {
    fn from(e: EpochError) -> Self {
        Error::Consensus(ConsensusError::Epoch(e))
    }
}

impl From<BroadcastError> for Error {
    fn from(e: BroadcastError) -> Self {
        Error::Consensus(ConsensusError::Broadcast(e))
    }
}

impl From<ReconfigError> for Error {
    fn from(e: ReconfigError) -> Self {
        Error::Consensus(ConsensusError::Reconfig(e))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        NetworkError::Io(e).into()
    }
}
