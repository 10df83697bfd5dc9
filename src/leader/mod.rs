//! Leader control logic: proposal pipeline, commit tracking, epoch
//! agreement, learner bookkeeping and the quorum-health tick loop.
//!
//! A single lock (`LeaderInner`) serializes the hot path: proposal
//! creation, ack processing, commit and the tick health check. Learner
//! sessions run on their own tasks and only take the lock briefly when they
//! feed acks or replay state into their outbound queues.

mod epoch;
mod proposal;
mod reconfig;

pub use proposal::*;

#[cfg(test)]
mod epoch_test;
#[cfg(test)]
mod leader_test;

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio::time::Instant;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::AcceptedEpochStore;
use crate::AckQuorumTracker;
use crate::BroadcastError;
use crate::ConsensusError;
use crate::ElectionDriver;
use crate::EpochError;
use crate::Error;
use crate::LeaderConfig;
use crate::LearnerAcceptor;
use crate::LearnerHandle;
use crate::LearnerKind;
use crate::PacketType;
use crate::PeerAddr;
use crate::QuorumAuthServer;
use crate::QuorumOracle;
use crate::QuorumPacket;
use crate::QuorumVerifier;
use crate::ReplicatedState;
use crate::Request;
use crate::RequestKind;
use crate::Result;
use crate::ServerId;
use crate::StateSummary;
use crate::TransactionLog;
use crate::Zxid;
use crate::ZxidAllocator;
use epoch::EpochAgreement;

/// Everything the leader consumes from the rest of the system.
pub struct LeaderContext {
    pub my_id: ServerId,
    pub config: Arc<LeaderConfig>,
    pub state: Arc<dyn ReplicatedState>,
    pub epoch_store: Arc<dyn AcceptedEpochStore>,
    pub txn_log: Arc<dyn TransactionLog>,
    pub auth_server: Arc<dyn QuorumAuthServer>,
    pub election: Arc<dyn ElectionDriver>,
    pub oracle: Option<Arc<dyn QuorumOracle>>,
}

/// State guarded by the leader lock.
pub(crate) struct LeaderInner {
    pub(crate) zxids: ZxidAllocator,
    pub(crate) last_proposed: Zxid,
    pub(crate) last_committed: Zxid,
    /// Cleared when a committed reconfig hands leadership to another peer;
    /// from then on the designated leader is the one that commits.
    pub(crate) allowed_to_commit: bool,
    pub(crate) outstanding: OutstandingTable,
    /// Committed proposals not yet confirmed applied by the state pipeline;
    /// the replay source for learners that sync past the committed log.
    pub(crate) to_be_applied: VecDeque<Proposal>,
    /// Sync requests parked until the zxid they were issued under commits.
    pub(crate) pending_syncs: HashMap<Zxid, Vec<ServerId>>,
    pub(crate) stats: ProposalStats,
}

pub struct Leader {
    ctx: LeaderContext,

    current_verifier: ArcSwap<QuorumVerifier>,
    last_seen_verifier: ArcSwap<QuorumVerifier>,

    pub(crate) inner: Mutex<LeaderInner>,
    epochs: EpochAgreement,
    leader_summary: Mutex<Option<StateSummary>>,

    /// All live learner sessions keyed by sid; at most one per sid.
    learners: DashMap<ServerId, Arc<LearnerHandle>>,

    /// Logical tick, advanced every other tick-loop iteration. Session ack
    /// deadlines are expressed in this clock.
    tick: AtomicU64,

    /// Synthetic sids handed to learners whose handshake carried none.
    observer_sid_counter: AtomicI64,

    shutdown_tx: watch::Sender<bool>,
    is_shutdown: AtomicBool,
    bound_addrs: Mutex<Option<Vec<SocketAddr>>>,
    broadcast_started_at: OnceLock<Instant>,
}

impl Leader {
    /// Build a leader over the initial view. The view must contain this
    /// peer; its quorum address is where the learner acceptor binds.
    pub fn new(ctx: LeaderContext, initial_view: Arc<QuorumVerifier>) -> Result<Arc<Self>> {
        ctx.config.validate()?;
        if !initial_view.contains_member(ctx.my_id) {
            return Err(Error::Config(config::ConfigError::Message(format!(
                "server {} is not part of the initial configuration",
                ctx.my_id
            ))));
        }
        info!("TCP NoDelay set to: {}", ctx.config.nodelay);

        let epochs = EpochAgreement::new(
            ctx.my_id,
            ctx.config.init_timeout(),
            ctx.config.max_epoch_wait(),
        );
        Ok(Arc::new(Leader {
            epochs,
            current_verifier: ArcSwap::new(initial_view.clone()),
            last_seen_verifier: ArcSwap::new(initial_view),
            inner: Mutex::new(LeaderInner {
                zxids: ZxidAllocator::seed(0),
                last_proposed: Zxid::default(),
                last_committed: Zxid::default(),
                allowed_to_commit: true,
                outstanding: OutstandingTable::new(),
                to_be_applied: VecDeque::new(),
                pending_syncs: HashMap::new(),
                stats: ProposalStats::default(),
            }),
            leader_summary: Mutex::new(None),
            learners: DashMap::new(),
            tick: AtomicU64::new(0),
            observer_sid_counter: AtomicI64::new(-1),
            shutdown_tx: watch::channel(false).0,
            is_shutdown: AtomicBool::new(false),
            bound_addrs: Mutex::new(None),
            broadcast_started_at: OnceLock::new(),
            ctx,
        }))
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn my_id(&self) -> ServerId {
        self.ctx.my_id
    }

    pub fn config(&self) -> &LeaderConfig {
        &self.ctx.config
    }

    pub(crate) fn replicated_state(&self) -> &Arc<dyn ReplicatedState> {
        &self.ctx.state
    }

    pub(crate) fn auth_server(&self) -> &Arc<dyn QuorumAuthServer> {
        &self.ctx.auth_server
    }

    pub fn current_verifier(&self) -> Arc<QuorumVerifier> {
        self.current_verifier.load_full()
    }

    pub fn last_seen_verifier(&self) -> Arc<QuorumVerifier> {
        self.last_seen_verifier.load_full()
    }

    pub(crate) fn swap_verifiers(
        &self,
        current: Arc<QuorumVerifier>,
        last_seen: Arc<QuorumVerifier>,
    ) {
        self.current_verifier.store(current);
        self.last_seen_verifier.store(last_seen);
    }

    pub(crate) fn store_last_seen_verifier(&self, verifier: Arc<QuorumVerifier>) {
        self.last_seen_verifier.store(verifier);
    }

    pub fn last_proposed(&self) -> Zxid {
        self.inner.lock().last_proposed
    }

    pub fn last_committed(&self) -> Zxid {
        self.inner.lock().last_committed
    }

    /// Epoch of the current reign, from the last proposed zxid.
    pub fn epoch(&self) -> u64 {
        self.last_proposed().epoch()
    }

    pub fn allowed_to_commit(&self) -> bool {
        self.inner.lock().allowed_to_commit
    }

    pub fn num_pending_syncs(&self) -> usize {
        self.inner.lock().pending_syncs.len()
    }

    pub fn proposal_stats(&self) -> ProposalStats {
        self.inner.lock().stats
    }

    /// Time since the broadcast phase started; zero before that.
    pub fn uptime(&self) -> Duration {
        self.broadcast_started_at
            .get()
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }

    pub fn current_tick(&self) -> u64 {
        self.tick.load(Ordering::Relaxed)
    }

    pub(crate) fn tick_of_initial_ack_deadline(&self) -> u64 {
        self.current_tick() + self.ctx.config.init_limit + self.ctx.config.sync_limit
    }

    pub(crate) fn tick_of_next_ack_deadline(&self) -> u64 {
        self.current_tick() + self.ctx.config.sync_limit
    }

    pub fn is_participant(&self, sid: ServerId) -> bool {
        self.current_verifier.load().is_voter(sid)
    }

    pub(crate) fn assign_observer_sid(&self) -> ServerId {
        self.observer_sid_counter.fetch_sub(1, Ordering::Relaxed)
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Learner registry
    // ------------------------------------------------------------------

    /// Register a session handle. A stale session for the same sid is
    /// closed and replaced: there is exactly one session per remote sid.
    pub(crate) fn register_learner(&self, handle: Arc<LearnerHandle>) {
        handle.set_ack_deadline(self.tick_of_initial_ack_deadline());
        if let Some(old) = self.learners.insert(handle.sid(), handle) {
            warn!("Replacing existing session for sid {}", old.sid());
            old.close();
        }
    }

    /// Deregister, but only if the registered handle is still this one; a
    /// replacement session must not be torn down by its predecessor's exit.
    pub(crate) fn remove_learner(&self, handle: &Arc<LearnerHandle>) {
        self.learners
            .remove_if(&handle.sid(), |_, current| current.token() == handle.token());
    }

    pub fn learner(&self, sid: ServerId) -> Option<Arc<LearnerHandle>> {
        self.learners.get(&sid).map(|entry| entry.value().clone())
    }

    /// Snapshot of every live session handle.
    pub fn learners(&self) -> Vec<Arc<LearnerHandle>> {
        self.learners.iter().map(|e| e.value().clone()).collect()
    }

    /// Participants currently receiving the broadcast stream.
    pub fn forwarding_learners(&self) -> Vec<Arc<LearnerHandle>> {
        self.learners
            .iter()
            .filter(|e| e.value().is_forwarding())
            .map(|e| e.value().clone())
            .collect()
    }

    /// Observers currently receiving the commit stream.
    pub fn observing_learners(&self) -> Vec<Arc<LearnerHandle>> {
        self.learners
            .iter()
            .filter(|e| e.value().is_observing())
            .map(|e| e.value().clone())
            .collect()
    }

    /// Forwarding learners that do not vote under the current config.
    pub fn non_voting_followers(&self) -> Vec<Arc<LearnerHandle>> {
        self.forwarding_learners()
            .into_iter()
            .filter(|h| !self.is_participant(h.sid()))
            .collect()
    }

    /// Voter sids currently synced with the leader, ourselves included.
    pub fn synced_voter_ids(&self, verifier: &QuorumVerifier) -> HashSet<ServerId> {
        let tick = self.current_tick();
        let mut ids = HashSet::new();
        if verifier.is_voter(self.ctx.my_id) {
            ids.insert(self.ctx.my_id);
        }
        for entry in self.learners.iter() {
            let handle = entry.value();
            if handle.synced(tick) && verifier.is_voter(handle.sid()) {
                ids.insert(handle.sid());
            }
        }
        ids
    }

    /// True if a quorum under `verifier` is connected and synced.
    pub fn is_quorum_synced(&self, verifier: &QuorumVerifier) -> bool {
        verifier.contains_quorum(&self.synced_voter_ids(verifier))
    }

    fn send_to_forwarding(&self, packet: &QuorumPacket) {
        for entry in self.learners.iter() {
            let handle = entry.value();
            if handle.is_forwarding() {
                handle.queue_packet(packet.clone());
            }
        }
    }

    fn send_to_observers(&self, packet: &QuorumPacket) {
        for entry in self.learners.iter() {
            let handle = entry.value();
            if handle.is_observing() {
                handle.queue_packet(packet.clone());
            }
        }
    }

    // ------------------------------------------------------------------
    // Epoch agreement (session entry points)
    // ------------------------------------------------------------------

    pub(crate) async fn get_epoch_to_propose(
        &self,
        sid: ServerId,
        last_accepted_epoch: i64,
    ) -> Result<i64> {
        let verifier = self.current_verifier.load_full();
        self.epochs
            .get_epoch_to_propose(
                sid,
                last_accepted_epoch,
                &verifier,
                self.ctx.epoch_store.as_ref(),
            )
            .await
    }

    pub(crate) async fn wait_for_epoch_ack(
        &self,
        sid: ServerId,
        summary: StateSummary,
    ) -> Result<()> {
        let Some(leader_summary) = *self.leader_summary.lock() else {
            return Err(Error::Fatal("leader summary not initialized".into()));
        };
        let verifier = self.current_verifier.load_full();
        let result = self
            .epochs
            .wait_for_epoch_ack(sid, summary, leader_summary, &verifier)
            .await;
        if let Err(Error::Consensus(ConsensusError::Epoch(err @ EpochError::FollowerAhead {
            ..
        }))) = &result
        {
            // A more recent peer exists; this reign is void.
            self.shutdown(&err.to_string());
        }
        result
    }

    pub(crate) async fn wait_for_new_leader_ack(&self, sid: ServerId, zxid: Zxid) -> Result<()> {
        self.epochs.wait_for_new_leader_ack(sid, zxid).await
    }

    /// Hand over the vote set that elected this leader (used by the
    /// disloyal-voter fast fail).
    pub fn set_leading_vote_set(&self, vote_set: AckQuorumTracker) {
        self.epochs.set_leading_vote_set(vote_set);
    }

    /// The election machinery reports a peer back in LOOKING state.
    pub fn report_looking_sid(&self, sid: ServerId) {
        self.epochs.report_looking_sid(sid);
    }

    // ------------------------------------------------------------------
    // The lead() procedure
    // ------------------------------------------------------------------

    /// Bind the learner acceptor and start its accept tasks. Idempotent;
    /// returns the bound addresses. Fails only if no configured address
    /// could be bound.
    pub async fn start_acceptor(self: &Arc<Self>) -> Result<Vec<SocketAddr>> {
        if let Some(addrs) = self.bound_addrs.lock().clone() {
            return Ok(addrs);
        }
        let acceptor = LearnerAcceptor::bind(&self.bind_addrs()).await?;
        let addrs = acceptor.local_addrs();
        {
            let mut bound = self.bound_addrs.lock();
            if let Some(existing) = bound.clone() {
                // Lost a bind race; the freshly bound sockets drop here.
                return Ok(existing);
            }
            *bound = Some(addrs.clone());
        }
        acceptor.start(self.clone());
        Ok(addrs)
    }

    fn bind_addrs(&self) -> Vec<PeerAddr> {
        let view = self.current_verifier.load();
        let me = view.server(self.ctx.my_id);
        if self.ctx.config.listen_on_all_ips {
            let port = me.map(|s| s.quorum_addr.port).unwrap_or(0);
            vec![PeerAddr::new("0.0.0.0", port)]
        } else {
            me.map(|s| vec![s.quorum_addr.clone()]).unwrap_or_default()
        }
    }

    /// Main leading procedure: discovery, synchronization, then the
    /// broadcast phase with the tick loop. Returns when the leader shuts
    /// down; errors are terminal for this reign and control goes back to
    /// the election driver.
    pub async fn lead(self: &Arc<Self>) -> Result<()> {
        let result = self.lead_inner().await;
        if let Err(e) = &result {
            // Targeted paths shut down with a specific message first;
            // shutdown is idempotent so this only covers the rest.
            self.shutdown(&e.to_string());
        }
        result
    }

    async fn lead_inner(self: &Arc<Self>) -> Result<()> {
        self.ctx.state.load_data().await?;

        let leader_summary = StateSummary::new(
            self.ctx.epoch_store.current_epoch(),
            self.ctx.state.last_processed_zxid(),
        );
        *self.leader_summary.lock() = Some(leader_summary);

        // Accept follower connections from here on; sessions block on the
        // epoch barriers until a quorum has checked in.
        self.start_acceptor().await?;

        let epoch = self
            .get_epoch_to_propose(self.ctx.my_id, self.ctx.epoch_store.accepted_epoch())
            .await?;
        let newleader_zxid = Zxid::epoch_base(epoch as u64);
        {
            let mut inner = self.inner.lock();
            inner.zxids = ZxidAllocator::seed(epoch as u64);
            inner.last_proposed = newleader_zxid;
        }
        info!("NEWLEADER proposal has Zxid of {}", newleader_zxid);

        // An initial config carries version 0. Establish it by re-stamping
        // the last-seen verifier with the NEWLEADER zxid, which followers
        // learn through the NEWLEADER packet. Must happen before any
        // session passes the epoch-ack barrier.
        let current = self.current_verifier.load_full();
        if current.version() == 0 && self.last_seen_verifier.load().version() == 0 {
            debug!("set lastSeenQuorumVerifier version to NEWLEADER zxid {newleader_zxid}");
            self.last_seen_verifier
                .store(Arc::new(current.with_version(newleader_zxid.0)));
        }

        let mut tracker = AckQuorumTracker::new();
        tracker.add_verifier(self.current_verifier.load_full());
        let last_seen = self.last_seen_verifier.load_full();
        if last_seen.version() > self.current_verifier.load().version() {
            tracker.add_verifier(last_seen);
        }
        self.epochs.arm_new_leader(newleader_zxid, tracker);

        self.wait_for_epoch_ack(self.ctx.my_id, leader_summary).await?;
        self.ctx.epoch_store.set_current_epoch(epoch)?;

        if let Err(e) = self.wait_for_new_leader_ack(self.ctx.my_id, newleader_zxid).await {
            let tracker = self.epochs.new_leader_tracker();
            self.shutdown(&format!(
                "Waiting for a quorum of followers, only synced with sids: [ {} ]",
                tracker.ack_sets_to_string()
            ));
            let follower_set: HashSet<ServerId> = self
                .learners()
                .iter()
                .map(|h| h.sid())
                .filter(|sid| self.is_participant(*sid))
                .collect();
            if tracker
                .pairs()
                .iter()
                .all(|pair| pair.verifier().contains_quorum(&follower_set))
            {
                warn!("Enough followers present. Perhaps the initTicks need to be increased.");
            }
            return Err(e);
        }

        self.start_broadcast(newleader_zxid);
        self.tick_loop().await
    }

    /// Enter the broadcast phase: the NEWLEADER zxid is committed by its
    /// quorum, the QA zxid override (if any) applies, and a pending
    /// last-seen config is completed the same way a reconfig commit would.
    fn start_broadcast(&self, newleader_zxid: Zxid) {
        let mut inner = self.inner.lock();
        inner.last_committed = newleader_zxid;
        info!(
            "Have quorum of supporters, sids: [{}]; starting up and setting last processed zxid: {}",
            self.epochs.new_leader_tracker().ack_sets_to_string(),
            newleader_zxid
        );

        if let Some(counter) = self.ctx.config.testing_initial_zxid {
            inner.zxids.force_counter(counter);
            inner.last_proposed = inner.zxids.last_allocated();
            warn!(
                "testing_initial_zxid override active, zxid forced to {}",
                inner.last_proposed
            );
        }

        if self.ctx.config.reconfig_enabled {
            let tracker = self.epochs.new_leader_tracker();
            let designated = self.designated_leader(&inner, &tracker, newleader_zxid);
            let new_qv = self.last_seen_verifier.load_full();
            self.apply_reconfig(&mut inner, new_qv, designated);
        } else {
            info!("Dynamic reconfig feature is disabled, skip designatedLeader calculation and reconfig processing.");
        }

        let _ = self.broadcast_started_at.set(Instant::now());
    }

    /// Periodic quorum-health check. Every `tick_time / 2`: collect the
    /// synced voter set, advance the logical tick every other iteration,
    /// shut down when the synced set fails either attached verifier, then
    /// ping every session outside the lock.
    async fn tick_loop(&self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_signal();
        let half_tick = self.ctx.config.tick_time() / 2;
        let mut tick_skip = true;

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("tick loop stopping: shutdown signal received");
                    return Ok(());
                }
                _ = sleep(half_tick) => {}
            }

            let mut quorum_lost = None;
            {
                let inner = self.inner.lock();
                if !tick_skip {
                    self.tick.fetch_add(1, Ordering::Relaxed);
                }

                let mut synced = AckQuorumTracker::new();
                synced.add_verifier(self.current_verifier.load_full());
                let last_seen = self.last_seen_verifier.load_full();
                if last_seen.version() > self.current_verifier.load().version() {
                    synced.add_verifier(last_seen);
                }
                synced.add_ack(self.ctx.my_id);
                let tick = self.current_tick();
                for entry in self.learners.iter() {
                    let handle = entry.value();
                    if handle.synced(tick) {
                        synced.add_ack(handle.sid());
                    }
                }

                if !tick_skip && !synced.has_all_quorums() {
                    let ids: HashSet<ServerId> = self
                        .synced_voter_ids(&self.current_verifier.load());
                    let saved_by_oracle = self
                        .ctx
                        .oracle
                        .as_ref()
                        .is_some_and(|o| {
                            o.override_quorum_decision(&ids, inner.outstanding.len())
                        });
                    if !saved_by_oracle {
                        quorum_lost = Some(format!(
                            "Not sufficient followers synced, only synced with sids: [ {} ]",
                            synced.ack_sets_to_string()
                        ));
                    }
                }
                tick_skip = !tick_skip;
            }

            if let Some(reason) = quorum_lost {
                self.shutdown(&reason);
                return Err(BroadcastError::QuorumLost(reason).into());
            }

            let ping = QuorumPacket::marker(PacketType::Ping, self.last_proposed());
            for entry in self.learners.iter() {
                entry.value().queue_packet(ping.clone());
            }
        }
    }

    /// Idempotent teardown: halts the acceptor, releases every epoch
    /// barrier, closes all sessions and notifies the election driver.
    pub fn shutdown(&self, reason: &str) {
        if self.is_shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutdown called. For the reason {}", reason);

        self.shutdown_tx.send_replace(true);
        self.epochs.abort_all();
        for entry in self.learners.iter() {
            entry.value().close();
        }
        self.learners.clear();
        self.ctx.election.leader_shutdown(reason);
    }

    // ------------------------------------------------------------------
    // Proposal pipeline
    // ------------------------------------------------------------------

    /// Serialize a mutation into the next numbered proposal and broadcast
    /// it to every forwarding participant.
    pub fn propose(&self, request: Request) -> Result<Zxid> {
        if request.throttled {
            error!("Throttled request send as proposal: {}. Exiting.", request);
            return Err(BroadcastError::ThrottledRequest.into());
        }
        if self.is_shutdown() {
            return Err(BroadcastError::LeaderShutdown("leader not running".into()).into());
        }

        let mut inner = self.inner.lock();
        let zxid = match inner.zxids.allocate() {
            Ok(zxid) => zxid,
            Err(rollover) => {
                drop(inner);
                self.shutdown(&rollover.to_string());
                return Err(rollover.into());
            }
        };

        // A reconfig proposal is stamped with its own zxid as the config
        // version and becomes the last-seen config immediately: from here
        // until it commits, every proposal needs acks under both configs.
        let session_id = request.session_id;
        let request = match request.kind {
            RequestKind::Reconfig { new_config } => {
                let stamped = Arc::new(new_config.with_version(zxid.0));
                self.last_seen_verifier.store(stamped.clone());
                Request::reconfig(session_id, stamped)
            }
            RequestKind::Write => request,
        };

        inner.stats.record(request.payload.len());
        let packet = QuorumPacket::new(PacketType::Proposal, zxid, Some(request.payload.clone()));
        let mut proposal = Proposal::new(packet.clone(), Some(request));
        proposal.add_verifier(self.current_verifier.load_full());
        let last_seen = self.last_seen_verifier.load_full();
        if self.current_verifier.load().version() < last_seen.version() {
            proposal.add_verifier(last_seen);
        }

        trace!("Proposing:: {}", proposal);
        inner.last_proposed = zxid;
        inner.outstanding.insert(proposal);
        self.send_to_forwarding(&packet);
        Ok(zxid)
    }

    /// Count an ack toward a proposal's quorums and commit everything that
    /// became committable.
    pub fn process_ack(&self, sid: ServerId, zxid: Zxid, from: Option<SocketAddr>) {
        let mut inner = self.inner.lock();
        if !inner.allowed_to_commit {
            // Last committed op was a leader handoff; the new leader commits.
            return;
        }
        if zxid.is_epoch_base() {
            // NEWLEADER acks have their own barrier; the ack a learner
            // sends after UPTODATE lands here and is dropped.
            return;
        }
        if inner.outstanding.is_empty() {
            debug!("outstanding is 0");
            return;
        }
        if inner.last_committed >= zxid {
            debug!(
                "proposal has already been committed, pzxid: {} zxid: {}",
                inner.last_committed, zxid
            );
            return;
        }
        let Some(proposal) = inner.outstanding.get_mut(zxid) else {
            warn!("Trying to commit future proposal: zxid {} from {:?}", zxid, from);
            return;
        };
        proposal.add_ack(sid);

        let frequency = self.ctx.config.ack_logging_frequency;
        if frequency > 0 && zxid.0 % frequency == 0 {
            debug!("ack sample: sid {} acked {} ", sid, zxid);
        }

        let was_reconfig = proposal.is_reconfig();
        let committed = self.try_to_commit(&mut inner, zxid);

        // Committing a reconfig may unblock later proposals whose pending
        // verifier just became the committed one; sweep forward while
        // consecutive proposals keep committing.
        if committed && was_reconfig {
            let mut current = zxid;
            while inner.allowed_to_commit {
                current = current.next();
                if !inner.outstanding.contains(current) {
                    break;
                }
                if !self.try_to_commit(&mut inner, current) {
                    break;
                }
            }
        }
    }

    /// Commit `zxid` if it is next in order and fully acked. Returns true
    /// if it committed.
    fn try_to_commit(&self, inner: &mut LeaderInner, zxid: Zxid) -> bool {
        // Strict in-order commit: with two verifier sets in play, a later
        // proposal can be fully acked while an earlier one is not.
        if inner.outstanding.contains(zxid.pred()) {
            return false;
        }
        match inner.outstanding.get(zxid) {
            None => return false,
            Some(p) if !p.has_all_quorums() => return false,
            Some(_) => {}
        }
        if zxid != inner.last_committed.next() {
            warn!("Commiting zxid {} not first!", zxid);
            warn!("First is {}", inner.last_committed.next());
        }
        let Some(proposal) = inner.outstanding.remove(zxid) else {
            return false;
        };

        if proposal.request.is_some() {
            inner.to_be_applied.push_back(proposal.clone());
        } else {
            warn!("Going to commit null: {}", proposal);
        }

        if proposal.is_reconfig() {
            debug!("Committing a reconfiguration! {}", inner.outstanding.len());
            let designated = self.designated_leader(inner, &proposal.tracker, zxid);
            let new_qv = proposal
                .tracker
                .newest_pair()
                .map(|pair| pair.verifier().clone());
            if let Some(new_qv) = new_qv {
                self.apply_reconfig(inner, new_qv.clone(), designated);
                self.commit_and_activate(inner, zxid, designated);
                self.inform_and_activate(&proposal, designated);
                self.drop_departed_learners(&new_qv);
            }
        } else {
            self.commit(inner, zxid);
            self.inform(&proposal);
        }

        if let Some(request) = proposal.request.clone() {
            self.ctx.state.submit_request(zxid, request);
        }
        if let Some(waiters) = inner.pending_syncs.remove(&zxid) {
            for sid in waiters {
                self.send_sync(sid);
            }
        }
        true
    }

    /// Advance `last_committed` and broadcast COMMIT to participants.
    fn commit(&self, inner: &mut LeaderInner, zxid: Zxid) {
        inner.last_committed = zxid;
        self.send_to_forwarding(&QuorumPacket::marker(PacketType::Commit, zxid));
    }

    fn commit_and_activate(&self, inner: &mut LeaderInner, zxid: Zxid, designated: ServerId) {
        inner.last_committed = zxid;
        let packet = QuorumPacket::new(
            PacketType::CommitAndActivate,
            zxid,
            Some(crate::encode_commit_and_activate(designated)),
        );
        self.send_to_forwarding(&packet);
    }

    /// Commit notification for observers, carrying the proposal payload.
    fn inform(&self, proposal: &Proposal) {
        let packet = QuorumPacket::new(
            PacketType::Inform,
            proposal.zxid(),
            proposal.packet.data.clone(),
        );
        self.send_to_observers(&packet);
    }

    fn inform_and_activate(&self, proposal: &Proposal, designated: ServerId) {
        let data = proposal.packet.data.clone().unwrap_or_else(Bytes::new);
        let packet = QuorumPacket::new(
            PacketType::InformAndActivate,
            proposal.zxid(),
            Some(crate::encode_inform_and_activate(designated, &data)),
        );
        self.send_to_observers(&packet);
    }

    /// The state-apply pipeline confirms the head of the to-be-applied
    /// queue has reached the data tree.
    pub fn confirm_applied(&self, zxid: Zxid) {
        let mut inner = self.inner.lock();
        match inner.to_be_applied.front() {
            Some(head) if head.zxid() == zxid => {
                inner.to_be_applied.pop_front();
            }
            _ => error!("Committed request not found on toBeApplied: {}", zxid),
        }
    }

    // ------------------------------------------------------------------
    // Sync requests
    // ------------------------------------------------------------------

    /// A learner asked to flush the pipe. Answer immediately when nothing
    /// is outstanding, otherwise after the currently last proposal commits.
    pub fn process_sync(&self, sid: ServerId) {
        let mut inner = self.inner.lock();
        if inner.outstanding.is_empty() {
            drop(inner);
            self.send_sync(sid);
        } else {
            let last_proposed = inner.last_proposed;
            inner.pending_syncs.entry(last_proposed).or_default().push(sid);
        }
    }

    fn send_sync(&self, sid: ServerId) {
        if let Some(handle) = self.learner(sid) {
            handle.queue_packet(QuorumPacket::marker(PacketType::Sync, Zxid::default()));
        }
    }

    // ------------------------------------------------------------------
    // Learner synchronization
    // ------------------------------------------------------------------

    /// Whether a learner at `peer_last_zxid` is too far behind the
    /// replayable committed log and needs a full snapshot.
    pub(crate) fn sync_needs_snapshot(&self, peer_last_zxid: Zxid) -> bool {
        let _inner = self.inner.lock();
        let min_cl = self.ctx.txn_log.min_committed_zxid();
        let max_cl = self.ctx.txn_log.max_committed_zxid();
        peer_last_zxid < min_cl && peer_last_zxid != max_cl
    }

    /// Queue the whole sync prologue for a learner, register it for the
    /// broadcast stream, and return the NEWLEADER zxid it must ack.
    ///
    /// Runs entirely under the leader lock so that no proposal or commit
    /// can interleave between the replayed tail and the live stream: the
    /// session's FIFO sees strictly ordered history.
    pub(crate) fn queue_sync_and_forward(
        &self,
        handle: &Arc<LearnerHandle>,
        peer_last_zxid: Zxid,
        snapshot: Option<(Bytes, Zxid)>,
    ) -> Zxid {
        let inner = self.inner.lock();
        let max_cl = self.ctx.txn_log.max_committed_zxid();

        // Where the committed-log replay resumes from.
        let mut replayed_upto = peer_last_zxid;

        match snapshot {
            Some((payload, snap_zxid)) => {
                info!(
                    "Syncing sid {} with SNAP up to {} (peer at {})",
                    handle.sid(),
                    snap_zxid,
                    peer_last_zxid
                );
                handle.queue_packet(QuorumPacket::new(
                    PacketType::Snap,
                    snap_zxid,
                    Some(payload),
                ));
                replayed_upto = snap_zxid;
            }
            None if peer_last_zxid == max_cl => {
                debug!("Syncing sid {} with empty DIFF at {}", handle.sid(), max_cl);
                handle.queue_packet(QuorumPacket::marker(PacketType::Diff, max_cl));
            }
            None if peer_last_zxid > max_cl => {
                info!(
                    "Syncing sid {} with TRUNC to {} (peer ahead at {})",
                    handle.sid(),
                    max_cl,
                    peer_last_zxid
                );
                handle.queue_packet(QuorumPacket::marker(PacketType::Trunc, max_cl));
                replayed_upto = max_cl;
            }
            None => {
                info!(
                    "Syncing sid {} with DIFF from {} to {}",
                    handle.sid(),
                    peer_last_zxid,
                    max_cl
                );
                handle.queue_packet(QuorumPacket::marker(PacketType::Diff, max_cl));
            }
        }

        // Replay the committed tail above the sync point. The
        // needs-snapshot split already guaranteed the range is replayable.
        if replayed_upto < max_cl {
            for txn in self.ctx.txn_log.committed_range(replayed_upto, max_cl) {
                handle.queue_packet(QuorumPacket::new(
                    PacketType::Proposal,
                    txn.zxid,
                    Some(txn.payload),
                ));
                handle.queue_packet(QuorumPacket::marker(PacketType::Commit, txn.zxid));
                replayed_upto = txn.zxid;
            }
        }

        // Committed proposals still in the apply queue are not in the log
        // yet; replay them the same way.
        if inner.last_proposed > replayed_upto {
            for proposal in &inner.to_be_applied {
                if proposal.zxid() <= replayed_upto {
                    continue;
                }
                handle.queue_packet(proposal.packet.clone());
                handle.queue_packet(QuorumPacket::marker(PacketType::Commit, proposal.zxid()));
            }
            // Only participants see outstanding (uncommitted) proposals.
            if handle.kind() == LearnerKind::Participant {
                for proposal in inner.outstanding.iter_after(replayed_upto) {
                    handle.queue_packet(proposal.packet.clone());
                }
            }
        }

        // NEWLEADER closes the prologue; from here the live stream flows.
        let newleader_zxid = Zxid::epoch_base(inner.last_proposed.epoch());
        let config_text = self.last_seen_verifier.load().to_config_text();
        handle.queue_packet(QuorumPacket::new(
            PacketType::NewLeader,
            newleader_zxid,
            Some(Bytes::from(config_text.into_bytes())),
        ));
        handle.start_forwarding();
        newleader_zxid
    }
}
