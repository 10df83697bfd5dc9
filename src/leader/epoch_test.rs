use std::sync::Arc;
use std::time::Duration;

use super::epoch::EpochAgreement;
use crate::test_utils::InMemoryEpochStore;
use crate::AcceptedEpochStore;
use crate::AckQuorumTracker;
use crate::ConsensusError;
use crate::EpochError;
use crate::Error;
use crate::QuorumVerifier;
use crate::StateSummary;
use crate::Zxid;

fn three_node_verifier() -> QuorumVerifier {
    QuorumVerifier::parse(
        "server.1=127.0.0.1:2888:3888:participant\n\
         server.2=127.0.0.1:2889:3889:participant\n\
         server.3=127.0.0.1:2890:3890:participant\n\
         version=1",
    )
    .unwrap()
}

fn is_epoch_err(err: &Error, expected: fn(&EpochError) -> bool) -> bool {
    matches!(err, Error::Consensus(ConsensusError::Epoch(e)) if expected(e))
}

#[tokio::test]
async fn test_epoch_freezes_once_quorum_connects() {
    let agreement = EpochAgreement::new(1, Duration::from_secs(5), None);
    let verifier = three_node_verifier();
    let store = InMemoryEpochStore::new(4, 4);

    // Leader (accepted epoch 4) blocks until follower 2 (accepted epoch 3)
    // completes the quorum; both see epoch 5 = max(4, 3) + 1.
    let (leader_epoch, follower_epoch) = tokio::join!(
        agreement.get_epoch_to_propose(1, 4, &verifier, store.as_ref()),
        agreement.get_epoch_to_propose(2, 3, &verifier, store.as_ref()),
    );
    assert_eq!(leader_epoch.unwrap(), 5);
    assert_eq!(follower_epoch.unwrap(), 5);

    // The frozen epoch was persisted.
    assert_eq!(store.accepted_epoch(), 5);

    // Late joiners get the already frozen epoch immediately, even with a
    // higher accepted epoch of their own.
    let late = agreement.get_epoch_to_propose(3, 9, &verifier, store.as_ref()).await;
    assert_eq!(late.unwrap(), 5);
    assert_eq!(store.accepted_epoch(), 5);
}

#[tokio::test]
async fn test_epoch_barrier_times_out_without_quorum() {
    let agreement = EpochAgreement::new(1, Duration::from_millis(50), None);
    let verifier = three_node_verifier();
    let store = InMemoryEpochStore::new(4, 4);

    let result = agreement.get_epoch_to_propose(1, 4, &verifier, store.as_ref()).await;
    assert!(is_epoch_err(
        &result.unwrap_err(),
        |e| matches!(e, EpochError::Timeout)
    ));
}

#[tokio::test]
async fn test_non_participant_does_not_advance_epoch_quorum() {
    let agreement = EpochAgreement::new(1, Duration::from_millis(50), None);
    let verifier = three_node_verifier();
    let store = InMemoryEpochStore::new(4, 4);

    // sid 99 is not a voter; with only the leader checked in there is no
    // quorum and the barrier must still time out.
    let (r1, r99) = tokio::join!(
        agreement.get_epoch_to_propose(1, 4, &verifier, store.as_ref()),
        agreement.get_epoch_to_propose(99, 2, &verifier, store.as_ref()),
    );
    assert!(r1.is_err());
    assert!(r99.is_err());
}

#[tokio::test]
async fn test_epoch_ack_completes_with_quorum() {
    let agreement = EpochAgreement::new(1, Duration::from_secs(5), None);
    let verifier = three_node_verifier();
    let leader_summary = StateSummary::new(5, Zxid::new(5, 0));

    let (r1, r2) = tokio::join!(
        agreement.wait_for_epoch_ack(1, leader_summary, leader_summary, &verifier),
        agreement.wait_for_epoch_ack(
            2,
            StateSummary::new(4, Zxid::new(4, 7)),
            leader_summary,
            &verifier
        ),
    );
    r1.unwrap();
    r2.unwrap();
}

#[tokio::test]
async fn test_epoch_ack_rejects_follower_ahead() {
    let agreement = EpochAgreement::new(1, Duration::from_secs(5), None);
    let verifier = three_node_verifier();
    let leader_summary = StateSummary::new(5, Zxid::new(5, 0));

    // Same epoch, higher zxid: the follower is more recent.
    let ahead = StateSummary::new(5, Zxid::new(5, 10));
    let result = agreement.wait_for_epoch_ack(2, ahead, leader_summary, &verifier).await;
    assert!(is_epoch_err(
        &result.unwrap_err(),
        |e| matches!(e, EpochError::FollowerAhead { .. })
    ));
}

#[tokio::test]
async fn test_epoch_ack_ignores_unknown_epoch_summary() {
    let agreement = EpochAgreement::new(1, Duration::from_millis(50), None);
    let verifier = three_node_verifier();
    let leader_summary = StateSummary::new(5, Zxid::new(5, 0));

    // Epoch −1 contributes nothing; alone with the leader it cannot form a
    // quorum.
    let unknown = StateSummary::new(-1, Zxid::default());
    let (r1, r2) = tokio::join!(
        agreement.wait_for_epoch_ack(1, leader_summary, leader_summary, &verifier),
        agreement.wait_for_epoch_ack(2, unknown, leader_summary, &verifier),
    );
    assert!(is_epoch_err(
        &r1.unwrap_err(),
        |e| matches!(e, EpochError::AckTimeout)
    ));
    assert!(r2.is_err());
}

#[tokio::test]
async fn test_new_leader_ack_quorum() {
    let agreement = EpochAgreement::new(1, Duration::from_secs(5), None);
    let newleader_zxid = Zxid::epoch_base(5);
    let mut tracker = AckQuorumTracker::new();
    tracker.add_verifier(Arc::new(three_node_verifier()));
    agreement.arm_new_leader(newleader_zxid, tracker);

    let (r1, r2) = tokio::join!(
        agreement.wait_for_new_leader_ack(1, newleader_zxid),
        agreement.wait_for_new_leader_ack(2, newleader_zxid),
    );
    r1.unwrap();
    r2.unwrap();

    // After the quorum formed, further acks return immediately.
    agreement.wait_for_new_leader_ack(3, newleader_zxid).await.unwrap();
}

#[tokio::test]
async fn test_new_leader_ack_with_wrong_zxid_is_ignored() {
    let agreement = EpochAgreement::new(1, Duration::from_millis(50), None);
    let newleader_zxid = Zxid::epoch_base(5);
    let mut tracker = AckQuorumTracker::new();
    tracker.add_verifier(Arc::new(three_node_verifier()));
    agreement.arm_new_leader(newleader_zxid, tracker);

    // A stale-epoch ack returns without contributing.
    agreement
        .wait_for_new_leader_ack(2, Zxid::epoch_base(4))
        .await
        .unwrap();

    // The quorum never formed: the leader's own wait still times out.
    let result = agreement.wait_for_new_leader_ack(1, newleader_zxid).await;
    assert!(is_epoch_err(
        &result.unwrap_err(),
        |e| matches!(e, EpochError::NewLeaderTimeout)
    ));
}

#[tokio::test]
async fn test_disloyal_voter_aborts_epoch_barrier() {
    let agreement = Arc::new(EpochAgreement::new(
        1,
        Duration::from_secs(30),
        Some(Duration::from_millis(0)),
    ));
    let verifier = three_node_verifier();
    let store = InMemoryEpochStore::new(4, 4);

    let mut vote_set = AckQuorumTracker::new();
    vote_set.add_verifier(Arc::new(three_node_verifier()));
    agreement.set_leading_vote_set(vote_set);

    let waiter = {
        let agreement = agreement.clone();
        let verifier = verifier.clone();
        let store = store.clone();
        tokio::spawn(async move {
            agreement.get_epoch_to_propose(1, 4, &verifier, store.as_ref()).await
        })
    };

    // Let the leader reach the waiting state, then report one of its
    // supporters back in LOOKING.
    tokio::time::sleep(Duration::from_millis(20)).await;
    agreement.report_looking_sid(2);

    let result = waiter.await.unwrap();
    assert!(is_epoch_err(
        &result.unwrap_err(),
        |e| matches!(e, EpochError::Aborted)
    ));
}

#[tokio::test]
async fn test_abort_all_releases_every_barrier() {
    let agreement = Arc::new(EpochAgreement::new(1, Duration::from_secs(30), None));
    let verifier = three_node_verifier();
    let store = InMemoryEpochStore::new(4, 4);

    let waiter = {
        let agreement = agreement.clone();
        let verifier = verifier.clone();
        tokio::spawn(async move {
            agreement.get_epoch_to_propose(1, 4, &verifier, store.as_ref()).await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    agreement.abort_all();

    let result = waiter.await.unwrap();
    assert!(is_epoch_err(
        &result.unwrap_err(),
        |e| matches!(e, EpochError::Aborted)
    ));
}
