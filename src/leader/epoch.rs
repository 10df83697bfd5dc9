//! Epoch agreement barriers.
//!
//! Three quorum barriers gate a leader's takeover: agreeing on the new
//! epoch number, collecting epoch acks, and collecting NEWLEADER acks.
//! Sessions and the leader itself contribute through the same entry points;
//! whoever completes a barrier's quorum releases every waiter. State lives
//! under a mutex, completion is broadcast on a watch channel so waiters can
//! block with a deadline without holding the lock.

use std::collections::HashSet;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio::time::Instant;
use tracing::error;
use tracing::info;

use crate::AcceptedEpochStore;
use crate::AckQuorumTracker;
use crate::EpochError;
use crate::QuorumVerifier;
use crate::Result;
use crate::ServerId;
use crate::StateSummary;
use crate::Zxid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BarrierStatus {
    Pending,
    Done,
    Aborted,
}

#[derive(Debug)]
struct ConnectingState {
    connecting: HashSet<ServerId>,
    epoch: i64,
    waiting_for_new_epoch: bool,
    wait_started: Option<Instant>,
}

#[derive(Debug)]
struct ElectingState {
    electing: HashSet<ServerId>,
    finished: bool,
}

#[derive(Debug)]
struct NewLeaderState {
    zxid: Zxid,
    tracker: AckQuorumTracker,
    quorum_formed: bool,
}

#[derive(Debug)]
pub(crate) struct EpochAgreement {
    my_id: ServerId,
    init_timeout: Duration,
    max_epoch_wait: Option<Duration>,

    connecting: Mutex<ConnectingState>,
    connecting_status: watch::Sender<BarrierStatus>,

    electing: Mutex<ElectingState>,
    electing_status: watch::Sender<BarrierStatus>,

    new_leader: Mutex<NewLeaderState>,
    new_leader_status: watch::Sender<BarrierStatus>,

    /// The vote set the election handed over; consulted by
    /// [`EpochAgreement::report_looking_sid`] to decide whether a defecting
    /// peer was one of this leader's supporters.
    vote_set: Mutex<Option<AckQuorumTracker>>,
}

impl EpochAgreement {
    pub(crate) fn new(
        my_id: ServerId,
        init_timeout: Duration,
        max_epoch_wait: Option<Duration>,
    ) -> Self {
        EpochAgreement {
            my_id,
            init_timeout,
            max_epoch_wait,
            connecting: Mutex::new(ConnectingState {
                connecting: HashSet::new(),
                epoch: -1,
                waiting_for_new_epoch: true,
                wait_started: None,
            }),
            connecting_status: watch::channel(BarrierStatus::Pending).0,
            electing: Mutex::new(ElectingState {
                electing: HashSet::new(),
                finished: false,
            }),
            electing_status: watch::channel(BarrierStatus::Pending).0,
            new_leader: Mutex::new(NewLeaderState {
                zxid: Zxid::default(),
                tracker: AckQuorumTracker::new(),
                quorum_formed: false,
            }),
            new_leader_status: watch::channel(BarrierStatus::Pending).0,
            vote_set: Mutex::new(None),
        }
    }

    /// Contribute `sid`'s accepted epoch and wait for the new epoch to be
    /// agreed. The epoch freezes (and is persisted) once a quorum of
    /// participants, the leader included, has checked in.
    pub(crate) async fn get_epoch_to_propose(
        &self,
        sid: ServerId,
        last_accepted_epoch: i64,
        verifier: &QuorumVerifier,
        store: &dyn AcceptedEpochStore,
    ) -> Result<i64> {
        let mut rx = self.connecting_status.subscribe();
        {
            let mut state = self.connecting.lock();
            if !state.waiting_for_new_epoch {
                return Ok(state.epoch);
            }
            if last_accepted_epoch >= state.epoch {
                state.epoch = last_accepted_epoch + 1;
            }
            if verifier.is_voter(sid) {
                state.connecting.insert(sid);
            }
            if state.connecting.contains(&self.my_id)
                && verifier.contains_quorum(&state.connecting)
            {
                state.waiting_for_new_epoch = false;
                store.set_accepted_epoch(state.epoch)?;
                self.connecting_status.send_replace(BarrierStatus::Done);
                return Ok(state.epoch);
            }
            if sid == self.my_id {
                state.wait_started = Some(Instant::now());
            }
        }

        match self.wait(&mut rx).await {
            Some(BarrierStatus::Done) => Ok(self.connecting.lock().epoch),
            Some(_) => Err(EpochError::Aborted.into()),
            None => Err(EpochError::Timeout.into()),
        }
    }

    /// Contribute `sid`'s state summary and wait until a quorum has
    /// acknowledged the new epoch. A summary more recent than the leader's
    /// own means this peer should not be leading at all.
    pub(crate) async fn wait_for_epoch_ack(
        &self,
        sid: ServerId,
        summary: StateSummary,
        leader_summary: StateSummary,
        verifier: &QuorumVerifier,
    ) -> Result<()> {
        let mut rx = self.electing_status.subscribe();
        {
            let mut state = self.electing.lock();
            if state.finished {
                return Ok(());
            }
            if summary.current_epoch != -1 {
                if summary.is_more_recent_than(&leader_summary) {
                    return Err(EpochError::FollowerAhead {
                        leader_epoch: leader_summary.current_epoch,
                        leader_zxid: leader_summary.last_zxid,
                    }
                    .into());
                }
                if verifier.is_voter(sid) {
                    state.electing.insert(sid);
                }
            }
            if state.electing.contains(&self.my_id) && verifier.contains_quorum(&state.electing) {
                state.finished = true;
                self.electing_status.send_replace(BarrierStatus::Done);
                return Ok(());
            }
        }

        match self.wait(&mut rx).await {
            Some(BarrierStatus::Done) => Ok(()),
            Some(_) => Err(EpochError::Aborted.into()),
            None => Err(EpochError::AckTimeout.into()),
        }
    }

    /// Install the NEWLEADER proposal this reign is built on. Must happen
    /// before any session can reach the NEWLEADER ack exchange.
    pub(crate) fn arm_new_leader(&self, zxid: Zxid, tracker: AckQuorumTracker) {
        let mut state = self.new_leader.lock();
        state.zxid = zxid;
        state.tracker = tracker;
        state.quorum_formed = false;
    }

    /// Snapshot of the NEWLEADER ack tracker, for logging and for the
    /// initial designated-leader computation.
    pub(crate) fn new_leader_tracker(&self) -> AckQuorumTracker {
        self.new_leader.lock().tracker.clone()
    }

    /// Record a NEWLEADER ack from `sid` and wait for the quorum to form.
    /// Acks carrying a different zxid belong to another epoch and are
    /// ignored.
    pub(crate) async fn wait_for_new_leader_ack(&self, sid: ServerId, zxid: Zxid) -> Result<()> {
        let mut rx = self.new_leader_status.subscribe();
        {
            let mut state = self.new_leader.lock();
            if state.quorum_formed {
                return Ok(());
            }
            if zxid != state.zxid {
                error!(
                    "NEWLEADER ACK from sid: {} is from a different epoch - current {} received {}",
                    sid, state.zxid, zxid
                );
                return Ok(());
            }
            state.tracker.add_ack(sid);
            if state.tracker.has_all_quorums() {
                state.quorum_formed = true;
                self.new_leader_status.send_replace(BarrierStatus::Done);
                return Ok(());
            }
        }

        match self.wait(&mut rx).await {
            Some(BarrierStatus::Done) => Ok(()),
            Some(_) => Err(EpochError::Aborted.into()),
            None => Err(EpochError::NewLeaderTimeout.into()),
        }
    }

    /// Hand over the vote set that elected this leader.
    pub(crate) fn set_leading_vote_set(&self, vote_set: AckQuorumTracker) {
        *self.vote_set.lock() = Some(vote_set);
    }

    /// The election machinery reports a peer that went back to LOOKING.
    ///
    /// If that peer is one of our supporters and the epoch barrier has
    /// already been waiting longer than `max_time_to_wait_for_epoch`, abort
    /// the barrier so the leader can restart instead of riding out the full
    /// `init_limit` deadline.
    pub(crate) fn report_looking_sid(&self, sid: ServerId) {
        let Some(max_wait) = self.max_epoch_wait else {
            return;
        };
        {
            let state = self.connecting.lock();
            if !state.waiting_for_new_epoch {
                return;
            }
            let Some(started) = state.wait_started else {
                return;
            };
            let tracked = self
                .vote_set
                .lock()
                .as_ref()
                .is_some_and(|votes| votes.has_sid(sid));
            if !tracked || started.elapsed() <= max_wait {
                return;
            }
        }
        info!("Quit leading due to voter changed mind.");
        self.connecting_status.send_replace(BarrierStatus::Aborted);
    }

    /// Release every waiter with the categorical abort. Called on leader
    /// shutdown; idempotent.
    pub(crate) fn abort_all(&self) {
        for status in [
            &self.connecting_status,
            &self.electing_status,
            &self.new_leader_status,
        ] {
            status.send_if_modified(|current| {
                if *current == BarrierStatus::Pending {
                    *current = BarrierStatus::Aborted;
                    true
                } else {
                    false
                }
            });
        }
    }

    /// Wait for a barrier to leave `Pending`, bounded by the init deadline.
    /// `None` means the deadline elapsed first.
    async fn wait(&self, rx: &mut watch::Receiver<BarrierStatus>) -> Option<BarrierStatus> {
        match timeout(
            self.init_timeout,
            rx.wait_for(|status| *status != BarrierStatus::Pending),
        )
        .await
        {
            Err(_elapsed) => None,
            Ok(Err(_sender_gone)) => Some(BarrierStatus::Aborted),
            Ok(Ok(status)) => Some(*status),
        }
    }
}
