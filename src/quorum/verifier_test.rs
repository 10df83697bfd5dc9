use std::collections::HashSet;

use super::*;
use crate::ServerId;

pub(crate) fn three_node_config() -> String {
    "server.1=127.0.0.1:2888:3888:participant;127.0.0.1:2181\n\
     server.2=127.0.0.1:2889:3889:participant;127.0.0.1:2182\n\
     server.3=127.0.0.1:2890:3890:participant;127.0.0.1:2183\n\
     version=100000000"
        .to_string()
}

fn sids(ids: &[ServerId]) -> HashSet<ServerId> {
    ids.iter().copied().collect()
}

#[test]
fn test_parse_three_node_majority() {
    let qv = QuorumVerifier::parse(&three_node_config()).unwrap();
    assert_eq!(qv.version(), 0x1_0000_0000);
    assert_eq!(qv.voter_ids().len(), 3);
    assert!(qv.is_voter(1) && qv.is_voter(2) && qv.is_voter(3));

    let server = qv.server(2).unwrap();
    assert_eq!(server.quorum_addr.to_string(), "127.0.0.1:2889");
    assert_eq!(server.election_addr.as_ref().unwrap().port, 3889);
    assert_eq!(server.client_addr.as_ref().unwrap().port, 2182);
}

#[test]
fn test_majority_decision() {
    let qv = QuorumVerifier::parse(&three_node_config()).unwrap();
    assert!(!qv.contains_quorum(&sids(&[])));
    assert!(!qv.contains_quorum(&sids(&[1])));
    assert!(qv.contains_quorum(&sids(&[1, 2])));
    assert!(qv.contains_quorum(&sids(&[1, 2, 3])));
    // Non-voters never count toward a quorum.
    assert!(!qv.contains_quorum(&sids(&[1, 99])));
}

#[test]
fn test_observers_do_not_vote() {
    let text = "server.1=127.0.0.1:2888:3888:participant\n\
                server.2=127.0.0.1:2889:3889:participant\n\
                server.3=127.0.0.1:2890:3890:observer\n\
                version=1";
    let qv = QuorumVerifier::parse(text).unwrap();
    assert_eq!(qv.voter_ids().len(), 2);
    assert!(!qv.is_voter(3));
    assert!(qv.contains_member(3));
    // Two voters: both are required for a majority.
    assert!(!qv.contains_quorum(&sids(&[1, 3])));
    assert!(qv.contains_quorum(&sids(&[1, 2])));
}

#[test]
fn test_hierarchical_weighted_decision() {
    let text = "server.1=h1:2888:3888:participant\n\
                server.2=h2:2888:3888:participant\n\
                server.3=h3:2888:3888:participant\n\
                server.4=h4:2888:3888:participant\n\
                server.5=h5:2888:3888:participant\n\
                server.6=h6:2888:3888:participant\n\
                group.1=1:2:3\n\
                group.2=4:5:6\n\
                weight.1=2\n\
                weight.2=1\n\
                weight.3=1\n\
                weight.4=1\n\
                weight.5=1\n\
                weight.6=1\n\
                version=2";
    let qv = QuorumVerifier::parse(text).unwrap();

    // Group 1 total weight 4: sid 1 alone (weight 2) is not a strict
    // majority; {1,2} (weight 3) is. Group 2 total 3: {4,5} is a majority.
    // A quorum needs a weighted majority in a majority of the two groups,
    // i.e. in both.
    assert!(!qv.contains_quorum(&sids(&[1, 4, 5])));
    assert!(qv.contains_quorum(&sids(&[1, 2, 4, 5])));
    assert!(!qv.contains_quorum(&sids(&[1, 2, 4])));
}

#[test]
fn test_hierarchical_rejects_ungrouped_participant() {
    let text = "server.1=h1:2888:3888:participant\n\
                server.2=h2:2888:3888:participant\n\
                group.1=1\n\
                version=1";
    assert!(QuorumVerifier::parse(text).is_err());
}

#[test]
fn test_config_text_roundtrip() {
    let qv = QuorumVerifier::parse(&three_node_config()).unwrap();
    let reparsed = QuorumVerifier::parse(&qv.to_config_text()).unwrap();
    assert_eq!(qv, reparsed);
    assert_eq!(qv.version(), reparsed.version());
}

#[test]
fn test_equality_ignores_version() {
    let qv = QuorumVerifier::parse(&three_node_config()).unwrap();
    let restamped = qv.with_version(0x5_0000_0002);
    assert_eq!(qv, restamped);
    assert_ne!(qv.version(), restamped.version());
}

#[test]
fn test_parse_rejects_garbage() {
    assert!(QuorumVerifier::parse("").is_err());
    assert!(QuorumVerifier::parse("server.x=127.0.0.1:2888").is_err());
    assert!(QuorumVerifier::parse("server.1=127.0.0.1").is_err());
    assert!(QuorumVerifier::parse("server.1=127.0.0.1:2888:3888:banana").is_err());
    assert!(QuorumVerifier::parse("bogus=1").is_err());
    // weight without groups is not a valid hierarchical config
    assert!(QuorumVerifier::parse("server.1=h:1:2\nweight.1=1").is_err());
}

#[test]
fn test_default_role_is_participant() {
    let qv = QuorumVerifier::parse("server.1=127.0.0.1:2888:3888").unwrap();
    assert!(qv.is_voter(1));
}
