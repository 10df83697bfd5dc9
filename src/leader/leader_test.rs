use std::sync::Arc;

use bytes::Bytes;

use super::*;
use crate::test_utils::attach_fake_learner;
use crate::test_utils::mock_leader_context;
use crate::test_utils::MockLeaderParts;
use crate::BroadcastError;
use crate::ConsensusError;
use crate::Error;
use crate::LeaderConfig;
use crate::LearnerKind;
use crate::PacketType;
use crate::QuorumPacket;
use crate::QuorumVerifier;
use crate::Request;
use crate::Zxid;
use crate::ZxidAllocator;

impl Leader {
    /// Test shortcut: skip discovery/sync and place the leader directly in
    /// the broadcast phase of `epoch`.
    fn test_enter_broadcast(&self, epoch: u64) {
        let mut inner = self.inner.lock();
        inner.zxids = ZxidAllocator::seed(epoch);
        inner.last_proposed = Zxid::epoch_base(epoch);
        inner.last_committed = Zxid::epoch_base(epoch);
    }
}

fn three_node_view() -> Arc<QuorumVerifier> {
    Arc::new(
        QuorumVerifier::parse(
            "server.1=127.0.0.1:2888:3888:participant\n\
             server.2=127.0.0.1:2889:3889:participant\n\
             server.3=127.0.0.1:2890:3890:participant\n\
             version=100000000",
        )
        .unwrap(),
    )
}

fn broadcast_leader(config: LeaderConfig) -> (Arc<Leader>, MockLeaderParts) {
    let parts = mock_leader_context(1, config);
    let context = LeaderContext {
        my_id: parts.context.my_id,
        config: parts.context.config.clone(),
        state: parts.state.clone(),
        epoch_store: parts.epoch_store.clone(),
        txn_log: parts.txn_log.clone(),
        auth_server: parts.context.auth_server.clone(),
        election: parts.election.clone(),
        oracle: None,
    };
    let leader = Leader::new(context, three_node_view()).unwrap();
    leader.test_enter_broadcast(5);
    (leader, parts)
}

fn packet_types(packets: &[QuorumPacket]) -> Vec<PacketType> {
    packets.iter().map(|p| p.ptype).collect()
}

#[tokio::test]
async fn test_propose_assigns_sequential_zxids_and_broadcasts() {
    let (leader, _parts) = broadcast_leader(LeaderConfig::default());
    let mut follower = attach_fake_learner(&leader, 2, LearnerKind::Participant);
    let mut observer = attach_fake_learner(&leader, 4, LearnerKind::Observer);

    let z1 = leader.propose(Request::write(0x10, Bytes::from_static(b"a"))).unwrap();
    let z2 = leader.propose(Request::write(0x10, Bytes::from_static(b"b"))).unwrap();
    assert_eq!(z1, Zxid::new(5, 1));
    assert_eq!(z2, Zxid::new(5, 2));
    assert_eq!(leader.last_proposed(), z2);

    // Participants see PROPOSAL in order; observers see nothing yet.
    let packets = follower.drain();
    assert_eq!(packet_types(&packets), vec![PacketType::Proposal, PacketType::Proposal]);
    assert_eq!(packets[0].zxid, z1);
    assert_eq!(packets[1].zxid, z2);
    assert!(observer.drain().is_empty());
}

#[tokio::test]
async fn test_quorum_ack_commits_and_informs() {
    let (leader, parts) = broadcast_leader(LeaderConfig::default());
    let mut follower = attach_fake_learner(&leader, 2, LearnerKind::Participant);
    let mut observer = attach_fake_learner(&leader, 4, LearnerKind::Observer);

    let zxid = leader
        .propose(Request::write(0x10, Bytes::from_static(b"setData /k v")))
        .unwrap();
    follower.drain();

    leader.process_ack(1, zxid, None);
    assert_eq!(leader.last_committed(), Zxid::epoch_base(5));
    leader.process_ack(2, zxid, None);

    assert_eq!(leader.last_committed(), zxid);
    let packets = follower.drain();
    assert_eq!(packet_types(&packets), vec![PacketType::Commit]);
    assert_eq!(packets[0].zxid, zxid);

    // Observers get INFORM with the payload.
    let packets = observer.drain();
    assert_eq!(packet_types(&packets), vec![PacketType::Inform]);
    assert_eq!(packets[0].data.as_deref(), Some(&b"setData /k v"[..]));

    // The request reached the apply pipeline and waits for confirmation.
    assert_eq!(parts.state.submitted_zxids(), vec![zxid]);
    leader.confirm_applied(zxid);
    assert_eq!(leader.inner.lock().to_be_applied.len(), 0);
}

#[tokio::test]
async fn test_redelivered_ack_is_a_no_op() {
    let (leader, parts) = broadcast_leader(LeaderConfig::default());
    let mut follower = attach_fake_learner(&leader, 2, LearnerKind::Participant);

    let zxid = leader.propose(Request::write(0, Bytes::from_static(b"x"))).unwrap();
    leader.process_ack(1, zxid, None);
    leader.process_ack(2, zxid, None);
    follower.drain();

    leader.process_ack(2, zxid, None);
    leader.process_ack(3, zxid, None);
    assert!(follower.drain().is_empty());
    assert_eq!(parts.state.submitted_zxids(), vec![zxid]);
}

#[tokio::test]
async fn test_commits_stay_in_zxid_order() {
    let (leader, _parts) = broadcast_leader(LeaderConfig::default());
    let mut follower = attach_fake_learner(&leader, 2, LearnerKind::Participant);

    let z1 = leader.propose(Request::write(0, Bytes::from_static(b"a"))).unwrap();
    let z2 = leader.propose(Request::write(0, Bytes::from_static(b"b"))).unwrap();
    follower.drain();

    // z2 is fully acked first, but cannot commit ahead of z1.
    leader.process_ack(1, z2, None);
    leader.process_ack(2, z2, None);
    assert_eq!(leader.last_committed(), Zxid::epoch_base(5));
    assert!(follower.drain().is_empty());

    // z1's quorum commits z1 only; z2 stays outstanding until an ack
    // arrives for it again.
    leader.process_ack(1, z1, None);
    leader.process_ack(2, z1, None);
    assert_eq!(leader.last_committed(), z1);

    leader.process_ack(3, z2, None);
    assert_eq!(leader.last_committed(), z2);
    let packets = follower.drain();
    assert_eq!(packet_types(&packets), vec![PacketType::Commit, PacketType::Commit]);
    assert_eq!(packets[0].zxid, z1);
    assert_eq!(packets[1].zxid, z2);
}

#[tokio::test]
async fn test_epoch_base_ack_is_dropped() {
    let (leader, _parts) = broadcast_leader(LeaderConfig::default());
    let _follower = attach_fake_learner(&leader, 2, LearnerKind::Participant);

    // The ack a learner sends after UPTODATE carries the epoch-base zxid.
    leader.process_ack(2, Zxid::epoch_base(5), None);
    assert_eq!(leader.last_committed(), Zxid::epoch_base(5));
    assert_eq!(leader.inner.lock().outstanding.len(), 0);
}

#[tokio::test]
async fn test_no_commits_while_not_allowed() {
    let (leader, parts) = broadcast_leader(LeaderConfig::default());
    let _follower = attach_fake_learner(&leader, 2, LearnerKind::Participant);

    let zxid = leader.propose(Request::write(0, Bytes::from_static(b"x"))).unwrap();
    leader.inner.lock().allowed_to_commit = false;

    leader.process_ack(1, zxid, None);
    leader.process_ack(2, zxid, None);
    assert_eq!(leader.last_committed(), Zxid::epoch_base(5));
    assert!(parts.state.submitted_zxids().is_empty());
}

#[tokio::test]
async fn test_pending_sync_drains_on_commit() {
    let (leader, _parts) = broadcast_leader(LeaderConfig::default());
    let mut follower = attach_fake_learner(&leader, 2, LearnerKind::Participant);

    let zxid = leader.propose(Request::write(0, Bytes::from_static(b"x"))).unwrap();
    follower.drain();

    leader.process_sync(2);
    assert_eq!(leader.num_pending_syncs(), 1);
    assert!(follower.drain().is_empty());

    leader.process_ack(1, zxid, None);
    leader.process_ack(2, zxid, None);
    assert_eq!(leader.num_pending_syncs(), 0);
    assert_eq!(
        packet_types(&follower.drain()),
        vec![PacketType::Commit, PacketType::Sync]
    );
}

#[tokio::test]
async fn test_sync_answers_immediately_when_nothing_outstanding() {
    let (leader, _parts) = broadcast_leader(LeaderConfig::default());
    let mut follower = attach_fake_learner(&leader, 2, LearnerKind::Participant);

    leader.process_sync(2);
    assert_eq!(packet_types(&follower.drain()), vec![PacketType::Sync]);
    assert_eq!(leader.num_pending_syncs(), 0);
}

#[tokio::test]
async fn test_throttled_request_is_rejected() {
    let (leader, _parts) = broadcast_leader(LeaderConfig::default());
    let mut request = Request::write(0, Bytes::from_static(b"x"));
    request.throttled = true;
    assert!(matches!(
        leader.propose(request),
        Err(Error::Consensus(ConsensusError::Broadcast(
            BroadcastError::ThrottledRequest
        )))
    ));
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_zxid_rollover_shuts_the_leader_down() {
    let (leader, parts) = broadcast_leader(LeaderConfig::default());
    let _follower = attach_fake_learner(&leader, 2, LearnerKind::Participant);
    leader.inner.lock().zxids.force_counter(0xffff_fffe);

    // The saturated counter value is still proposable.
    let last = leader.propose(Request::write(0, Bytes::from_static(b"x"))).unwrap();
    assert_eq!(last, Zxid::new(5, 0xffff_ffff));

    // The next proposal hits rollover: no zxid is assigned and the leader
    // shuts down so re-election can open a fresh epoch.
    let result = leader.propose(Request::write(0, Bytes::from_static(b"y")));
    assert!(matches!(
        result,
        Err(Error::Consensus(ConsensusError::Broadcast(
            BroadcastError::XidRollover
        )))
    ));
    assert!(leader.is_shutdown());
    assert!(parts.election.was_shutdown());
    assert!(logs_contain("Shutdown called"));
}

#[tokio::test]
async fn test_proposal_stats_track_payload_sizes() {
    let (leader, _parts) = broadcast_leader(LeaderConfig::default());
    leader.propose(Request::write(0, Bytes::from_static(b"abc"))).unwrap();
    leader.propose(Request::write(0, Bytes::from_static(b"a"))).unwrap();
    leader.propose(Request::write(0, Bytes::from_static(b"abcde"))).unwrap();

    let stats = leader.proposal_stats();
    assert_eq!(stats.last_size, 5);
    assert_eq!(stats.min_size, 1);
    assert_eq!(stats.max_size, 5);
}

// ============================================================================
// Reconfiguration through the pipeline
// ============================================================================

fn reconfig_enabled_leader() -> (Arc<Leader>, MockLeaderParts) {
    broadcast_leader(LeaderConfig {
        reconfig_enabled: true,
        ..Default::default()
    })
}

fn two_node_config_text() -> &'static str {
    "server.1=127.0.0.1:2888:3888:participant\n\
     server.2=127.0.0.1:2889:3889:participant"
}

#[tokio::test]
async fn test_reconfig_remove_one_keeps_leader() {
    let (leader, parts) = reconfig_enabled_leader();
    let mut follower2 = attach_fake_learner(&leader, 2, LearnerKind::Participant);
    let mut follower3 = attach_fake_learner(&leader, 3, LearnerKind::Participant);

    // Remove server 3: new voters {1, 2}.
    let request = leader
        .prepare_reconfig(0x20, two_node_config_text(), Some(0x1_0000_0000))
        .unwrap();
    let zxid = leader.propose(request).unwrap();
    assert_eq!(zxid, Zxid::new(5, 1));

    // Both old and new configs must reach quorum before commit.
    leader.process_ack(1, zxid, None);
    leader.process_ack(3, zxid, None);
    // Old config {1,2,3} has a quorum {1,3}, new config {1,2} does not.
    assert_eq!(leader.last_committed(), Zxid::epoch_base(5));

    leader.process_ack(2, zxid, None);
    assert_eq!(leader.last_committed(), zxid);

    // Leader 1 is a voter of the new config at the same address: it stays
    // designated and keeps committing.
    assert!(leader.allowed_to_commit());
    assert_eq!(leader.current_verifier().version(), zxid.0);
    assert!(!leader.current_verifier().is_voter(3));

    let packets = follower2.drain();
    assert_eq!(
        packet_types(&packets),
        vec![PacketType::Proposal, PacketType::CommitAndActivate]
    );
    let designated =
        crate::decode_commit_and_activate(packets[1].data.as_ref()).unwrap();
    assert_eq!(designated, 1);

    // The removed server got the activation too, then its session closed.
    let packets = follower3.drain();
    assert_eq!(
        packet_types(&packets),
        vec![PacketType::Proposal, PacketType::CommitAndActivate]
    );
    assert!(leader.learner(3).is_none());
    assert!(parts.state.submitted_zxids().contains(&zxid));
}

#[tokio::test]
async fn test_reconfig_swapping_leader_out_stops_commits() {
    let (leader, _parts) = reconfig_enabled_leader();
    let mut follower2 = attach_fake_learner(&leader, 2, LearnerKind::Participant);
    let _follower3 = attach_fake_learner(&leader, 3, LearnerKind::Participant);
    let _follower4 = attach_fake_learner(&leader, 4, LearnerKind::Participant);

    // New config {2,3,4}: the leader is not a member.
    let new_config = "server.2=127.0.0.1:2889:3889:participant\n\
                      server.3=127.0.0.1:2890:3890:participant\n\
                      server.4=127.0.0.1:2891:3891:participant";
    let request = leader.prepare_reconfig(0x20, new_config, None).unwrap();
    let zxid = leader.propose(request).unwrap();

    leader.process_ack(1, zxid, None);
    leader.process_ack(2, zxid, None);
    leader.process_ack(3, zxid, None);
    assert_eq!(leader.last_committed(), zxid);

    // Smallest acked new-config voter is designated; this leader freezes.
    let packets = follower2.drain();
    let commit = packets
        .iter()
        .find(|p| p.ptype == PacketType::CommitAndActivate)
        .unwrap();
    let designated = crate::decode_commit_and_activate(commit.data.as_ref()).unwrap();
    assert_eq!(designated, 2);
    assert!(!leader.allowed_to_commit());

    // Nothing further commits under this reign.
    let z_next = leader.propose(Request::write(0, Bytes::from_static(b"x"))).unwrap();
    leader.process_ack(2, z_next, None);
    leader.process_ack(3, z_next, None);
    leader.process_ack(4, z_next, None);
    assert_eq!(leader.last_committed(), zxid);
}

#[tokio::test]
async fn test_reconfig_commit_sweeps_pending_proposals() {
    let (leader, parts) = reconfig_enabled_leader();
    let _follower2 = attach_fake_learner(&leader, 2, LearnerKind::Participant);
    let _follower3 = attach_fake_learner(&leader, 3, LearnerKind::Participant);

    let request = leader
        .prepare_reconfig(0x20, two_node_config_text(), None)
        .unwrap();
    let reconfig_zxid = leader.propose(request).unwrap();

    // A write proposed while the reconfig is outstanding carries both
    // verifier pairs.
    let write_zxid = leader.propose(Request::write(0, Bytes::from_static(b"w"))).unwrap();
    {
        let inner = leader.inner.lock();
        assert_eq!(inner.outstanding.get(write_zxid).unwrap().tracker.pairs().len(), 2);
    }

    // Fully ack the write first; it stays blocked behind the reconfig.
    leader.process_ack(1, write_zxid, None);
    leader.process_ack(2, write_zxid, None);
    leader.process_ack(3, write_zxid, None);
    assert_eq!(leader.last_committed(), Zxid::epoch_base(5));

    // Acking the reconfig commits it and sweeps the write right after.
    leader.process_ack(1, reconfig_zxid, None);
    leader.process_ack(2, reconfig_zxid, None);
    assert_eq!(leader.last_committed(), write_zxid);
    assert_eq!(parts.state.submitted_zxids(), vec![reconfig_zxid, write_zxid]);
}

#[tokio::test]
async fn test_observer_sid_assignment_is_unique_and_negative() {
    let (leader, _parts) = broadcast_leader(LeaderConfig::default());
    let first = leader.assign_observer_sid();
    let second = leader.assign_observer_sid();
    assert!(first < 0 && second < 0);
    assert_ne!(first, second);
}

#[tokio::test]
async fn test_learner_registry_keeps_one_session_per_sid() {
    let (leader, _parts) = broadcast_leader(LeaderConfig::default());
    let old = attach_fake_learner(&leader, 2, LearnerKind::Participant);
    let new = attach_fake_learner(&leader, 2, LearnerKind::Participant);

    // The replacement closed the old session and owns the registration.
    assert!(!old.handle.synced(0));
    assert_eq!(leader.learners().len(), 1);

    // The old session's exit must not deregister the replacement.
    leader.remove_learner(&old.handle);
    assert!(leader.learner(2).is_some());
    leader.remove_learner(&new.handle);
    assert!(leader.learner(2).is_none());
}

#[tokio::test]
async fn test_is_quorum_synced_counts_self_and_synced_learners() {
    let (leader, _parts) = broadcast_leader(LeaderConfig::default());
    let view = leader.current_verifier();
    assert!(!leader.is_quorum_synced(&view));

    let _follower = attach_fake_learner(&leader, 2, LearnerKind::Participant);
    assert!(leader.is_quorum_synced(&view));
}
