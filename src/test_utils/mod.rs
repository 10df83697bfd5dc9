//! In-memory collaborator implementations and fixtures for tests.
//!
//! Everything here is deterministic and lock-based; it exists so leader
//! behavior can be exercised without a data tree, disk, or real peers.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::AcceptedEpochStore;
use crate::CommittedTxn;
use crate::ElectionDriver;
use crate::Leader;
use crate::LeaderConfig;
use crate::LeaderContext;
use crate::LearnerHandle;
use crate::LearnerKind;
use crate::QuorumAuthServer;
use crate::QuorumPacket;
use crate::ReplicatedState;
use crate::Request;
use crate::Result;
use crate::ServerId;
use crate::TransactionLog;
use crate::Zxid;

/// Replicated state that records what the leader hands it.
#[derive(Debug, Default)]
pub struct InMemoryState {
    last_processed: AtomicU64,
    submitted: Mutex<Vec<(Zxid, Request)>>,
    learner_requests: Mutex<Vec<(ServerId, Bytes)>>,
    touched_sessions: Mutex<HashMap<i64, i32>>,
    valid_sessions: Mutex<HashMap<i64, bool>>,
    snapshot_payload: Mutex<Bytes>,
}

impl InMemoryState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_last_processed(&self, zxid: Zxid) {
        self.last_processed.store(zxid.0, Ordering::SeqCst);
    }

    pub fn set_snapshot_payload(&self, payload: Bytes) {
        *self.snapshot_payload.lock() = payload;
    }

    pub fn set_session_valid(&self, session_id: i64, valid: bool) {
        self.valid_sessions.lock().insert(session_id, valid);
    }

    pub fn submitted(&self) -> Vec<(Zxid, Request)> {
        self.submitted.lock().clone()
    }

    pub fn submitted_zxids(&self) -> Vec<Zxid> {
        self.submitted.lock().iter().map(|(zxid, _)| *zxid).collect()
    }

    pub fn learner_requests(&self) -> Vec<(ServerId, Bytes)> {
        self.learner_requests.lock().clone()
    }

    pub fn touched_sessions(&self) -> HashMap<i64, i32> {
        self.touched_sessions.lock().clone()
    }
}

#[async_trait]
impl ReplicatedState for InMemoryState {
    async fn load_data(&self) -> Result<()> {
        Ok(())
    }

    fn last_processed_zxid(&self) -> Zxid {
        Zxid(self.last_processed.load(Ordering::SeqCst))
    }

    fn submit_request(&self, zxid: Zxid, request: Request) {
        self.last_processed.store(zxid.0, Ordering::SeqCst);
        self.submitted.lock().push((zxid, request));
    }

    fn submit_learner_request(&self, sid: ServerId, payload: Bytes) {
        self.learner_requests.lock().push((sid, payload));
    }

    fn touch_session(&self, session_id: i64, timeout: i32) {
        self.touched_sessions.lock().insert(session_id, timeout);
    }

    fn check_global_session(&self, session_id: i64, _timeout: i32) -> bool {
        self.valid_sessions
            .lock()
            .get(&session_id)
            .copied()
            .unwrap_or(false)
    }

    async fn snapshot(&self) -> Result<Bytes> {
        Ok(self.snapshot_payload.lock().clone())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryEpochStore {
    accepted: AtomicI64,
    current: AtomicI64,
}

impl InMemoryEpochStore {
    pub fn new(accepted: i64, current: i64) -> Arc<Self> {
        let store = Self::default();
        store.accepted.store(accepted, Ordering::SeqCst);
        store.current.store(current, Ordering::SeqCst);
        Arc::new(store)
    }
}

impl AcceptedEpochStore for InMemoryEpochStore {
    fn accepted_epoch(&self) -> i64 {
        self.accepted.load(Ordering::SeqCst)
    }

    fn set_accepted_epoch(&self, epoch: i64) -> Result<()> {
        self.accepted.store(epoch, Ordering::SeqCst);
        Ok(())
    }

    fn current_epoch(&self) -> i64 {
        self.current.load(Ordering::SeqCst)
    }

    fn set_current_epoch(&self, epoch: i64) -> Result<()> {
        self.current.store(epoch, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryTxnLog {
    txns: Mutex<BTreeMap<Zxid, Bytes>>,
}

impl InMemoryTxnLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn append(&self, zxid: Zxid, payload: Bytes) {
        self.txns.lock().insert(zxid, payload);
    }
}

impl TransactionLog for InMemoryTxnLog {
    fn min_committed_zxid(&self) -> Zxid {
        self.txns.lock().keys().next().copied().unwrap_or_default()
    }

    fn max_committed_zxid(&self) -> Zxid {
        self.txns
            .lock()
            .keys()
            .next_back()
            .copied()
            .unwrap_or_default()
    }

    fn committed_range(&self, after: Zxid, upto: Zxid) -> Vec<CommittedTxn> {
        use std::ops::Bound;
        self.txns
            .lock()
            .range((Bound::Excluded(after), Bound::Included(upto)))
            .map(|(zxid, payload)| CommittedTxn {
                zxid: *zxid,
                payload: payload.clone(),
            })
            .collect()
    }
}

/// Accepts every learner.
#[derive(Debug, Default)]
pub struct OpenAuthServer;

impl QuorumAuthServer for OpenAuthServer {
    fn authenticate(&self, _sid: Option<ServerId>, _auth: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Records leader shutdowns instead of re-entering election.
#[derive(Debug, Default)]
pub struct RecordingElectionDriver {
    reasons: Mutex<Vec<String>>,
}

impl RecordingElectionDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn shutdown_reasons(&self) -> Vec<String> {
        self.reasons.lock().clone()
    }

    pub fn was_shutdown(&self) -> bool {
        !self.reasons.lock().is_empty()
    }
}

impl ElectionDriver for RecordingElectionDriver {
    fn leader_shutdown(&self, reason: &str) {
        self.reasons.lock().push(reason.to_string());
    }
}

/// Bundle of a leader context plus handles on its in-memory collaborators.
pub struct MockLeaderParts {
    pub context: LeaderContext,
    pub state: Arc<InMemoryState>,
    pub epoch_store: Arc<InMemoryEpochStore>,
    pub txn_log: Arc<InMemoryTxnLog>,
    pub election: Arc<RecordingElectionDriver>,
}

pub fn mock_leader_context(my_id: ServerId, config: LeaderConfig) -> MockLeaderParts {
    let state = InMemoryState::new();
    let epoch_store = InMemoryEpochStore::new(-1, -1);
    let txn_log = InMemoryTxnLog::new();
    let election = RecordingElectionDriver::new();
    MockLeaderParts {
        context: LeaderContext {
            my_id,
            config: Arc::new(config),
            state: state.clone(),
            epoch_store: epoch_store.clone(),
            txn_log: txn_log.clone(),
            auth_server: Arc::new(OpenAuthServer),
            election: election.clone(),
            oracle: None,
        },
        state,
        epoch_store,
        txn_log,
        election,
    }
}

/// A learner handle wired straight to a channel, no socket involved. It is
/// registered forwarding and synced, so broadcasts land on `rx`.
pub struct FakeLearner {
    pub handle: Arc<LearnerHandle>,
    pub rx: mpsc::UnboundedReceiver<QuorumPacket>,
}

impl FakeLearner {
    /// Packets queued so far, without waiting.
    pub fn drain(&mut self) -> Vec<QuorumPacket> {
        let mut packets = Vec::new();
        while let Ok(packet) = self.rx.try_recv() {
            packets.push(packet);
        }
        packets
    }
}

pub fn attach_fake_learner(leader: &Leader, sid: ServerId, kind: LearnerKind) -> FakeLearner {
    let (tx, rx) = mpsc::unbounded_channel();
    let addr: std::net::SocketAddr = "127.0.0.1:0".parse().expect("static addr");
    let handle = LearnerHandle::new(sid, kind, addr, tx);
    leader.register_learner(handle.clone());
    handle.start_forwarding();
    handle.set_ack_deadline(u64::MAX);
    FakeLearner { handle, rx }
}
