use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;

use super::config_err;
use super::LearnerKind;
use super::QuorumServer;
use crate::Result;
use crate::ServerId;

/// The voting rule of a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
enum QuorumRule {
    /// Simple majority of the voting members.
    Majority,
    /// Weighted hierarchical groups: a quorum needs a weighted majority in a
    /// majority of the (non-zero-weight) groups.
    Hierarchical {
        groups: BTreeMap<u64, BTreeSet<ServerId>>,
        weights: HashMap<ServerId, u64>,
    },
}

/// Immutable decision function over a voting membership.
///
/// A verifier is built once from configuration text and never mutated; the
/// pipeline swaps whole verifiers when a reconfiguration commits. Identity
/// is the configuration itself, ordering between configurations is by
/// `version` (the zxid that established them).
#[derive(Debug, Clone)]
pub struct QuorumVerifier {
    version: u64,
    all_members: BTreeMap<ServerId, QuorumServer>,
    voters: BTreeSet<ServerId>,
    rule: QuorumRule,
}

impl QuorumVerifier {
    /// Majority verifier over the given servers.
    pub fn majority(servers: Vec<QuorumServer>, version: u64) -> Self {
        let all_members: BTreeMap<ServerId, QuorumServer> =
            servers.into_iter().map(|s| (s.id, s)).collect();
        let voters = voting_ids(&all_members);
        QuorumVerifier {
            version,
            all_members,
            voters,
            rule: QuorumRule::Majority,
        }
    }

    /// Hierarchical verifier: `groups` maps group id → member sids,
    /// `weights` maps sid → weight. Sids without an explicit weight count 1.
    pub fn hierarchical(
        servers: Vec<QuorumServer>,
        groups: BTreeMap<u64, BTreeSet<ServerId>>,
        weights: HashMap<ServerId, u64>,
        version: u64,
    ) -> Result<Self> {
        let all_members: BTreeMap<ServerId, QuorumServer> =
            servers.into_iter().map(|s| (s.id, s)).collect();
        let voters = voting_ids(&all_members);
        for (gid, members) in &groups {
            for sid in members {
                if !voters.contains(sid) {
                    return Err(config_err(format!(
                        "group.{gid} references sid {sid} which is not a participant"
                    )));
                }
            }
        }
        for sid in &voters {
            if !groups.values().any(|g| g.contains(sid)) {
                return Err(config_err(format!("participant {sid} belongs to no group")));
            }
        }
        Ok(QuorumVerifier {
            version,
            all_members,
            voters,
            rule: QuorumRule::Hierarchical { groups, weights },
        })
    }

    /// Parse configuration text: `server.N=` lines plus optional `group.N=`,
    /// `weight.N=` and `version=` (hex) lines.
    pub fn parse(text: &str) -> Result<Self> {
        let mut servers = Vec::new();
        let mut groups: BTreeMap<u64, BTreeSet<ServerId>> = BTreeMap::new();
        let mut weights: HashMap<ServerId, u64> = HashMap::new();
        let mut version = 0u64;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| config_err(format!("malformed config line '{line}'")))?;
            let (key, value) = (key.trim(), value.trim());

            if let Some(id) = key.strip_prefix("server.") {
                let id: ServerId = id
                    .parse()
                    .map_err(|_| config_err(format!("invalid server id in '{key}'")))?;
                servers.push(QuorumServer::parse(id, value)?);
            } else if let Some(gid) = key.strip_prefix("group.") {
                let gid: u64 = gid
                    .parse()
                    .map_err(|_| config_err(format!("invalid group id in '{key}'")))?;
                let members = value
                    .split(':')
                    .map(|sid| {
                        sid.parse::<ServerId>()
                            .map_err(|_| config_err(format!("invalid sid '{sid}' in '{key}'")))
                    })
                    .collect::<Result<BTreeSet<ServerId>>>()?;
                groups.insert(gid, members);
            } else if let Some(sid) = key.strip_prefix("weight.") {
                let sid: ServerId = sid
                    .parse()
                    .map_err(|_| config_err(format!("invalid sid in '{key}'")))?;
                let weight: u64 = value
                    .parse()
                    .map_err(|_| config_err(format!("invalid weight '{value}' in '{key}'")))?;
                weights.insert(sid, weight);
            } else if key == "version" {
                version = u64::from_str_radix(value, 16)
                    .map_err(|_| config_err(format!("invalid version '{value}'")))?;
            } else {
                return Err(config_err(format!("unrecognized config key '{key}'")));
            }
        }

        if servers.is_empty() {
            return Err(config_err("configuration defines no servers".to_string()));
        }

        if groups.is_empty() {
            if !weights.is_empty() {
                return Err(config_err(
                    "weight.* lines require group.* lines".to_string(),
                ));
            }
            Ok(QuorumVerifier::majority(servers, version))
        } else {
            QuorumVerifier::hierarchical(servers, groups, weights, version)
        }
    }

    /// The zxid that established this configuration.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Same membership re-stamped with a new version. Used when the
    /// establishing zxid is only known after the configuration is built.
    pub fn with_version(&self, version: u64) -> Self {
        let mut v = self.clone();
        v.version = version;
        v
    }

    pub fn is_voter(&self, sid: ServerId) -> bool {
        self.voters.contains(&sid)
    }

    pub fn voting_members(&self) -> impl Iterator<Item = &QuorumServer> {
        self.voters.iter().filter_map(|sid| self.all_members.get(sid))
    }

    pub fn voter_ids(&self) -> &BTreeSet<ServerId> {
        &self.voters
    }

    pub fn all_members(&self) -> &BTreeMap<ServerId, QuorumServer> {
        &self.all_members
    }

    pub fn server(&self, sid: ServerId) -> Option<&QuorumServer> {
        self.all_members.get(&sid)
    }

    pub fn contains_member(&self, sid: ServerId) -> bool {
        self.all_members.contains_key(&sid)
    }

    /// Pure quorum decision over a set of acknowledging sids.
    pub fn contains_quorum(&self, acked: &HashSet<ServerId>) -> bool {
        match &self.rule {
            QuorumRule::Majority => {
                let count = acked.iter().filter(|sid| self.voters.contains(sid)).count();
                2 * count > self.voters.len()
            }
            QuorumRule::Hierarchical { groups, weights } => {
                let weight_of = |sid: &ServerId| weights.get(sid).copied().unwrap_or(1);
                let mut live_groups = 0usize;
                let mut satisfied = 0usize;
                for members in groups.values() {
                    let total: u64 = members.iter().map(weight_of).sum();
                    if total == 0 {
                        continue;
                    }
                    live_groups += 1;
                    let acked_weight: u64 = members
                        .iter()
                        .filter(|sid| acked.contains(sid))
                        .map(weight_of)
                        .sum();
                    if 2 * acked_weight > total {
                        satisfied += 1;
                    }
                }
                live_groups > 0 && 2 * satisfied > live_groups
            }
        }
    }

    /// Canonical configuration text, the inverse of [`QuorumVerifier::parse`].
    pub fn to_config_text(&self) -> String {
        let mut out = String::new();
        for server in self.all_members.values() {
            out.push_str(&format!(
                "server.{}={}\n",
                server.id,
                server.to_config_value()
            ));
        }
        if let QuorumRule::Hierarchical { groups, weights } = &self.rule {
            for (gid, members) in groups {
                let sids: Vec<String> = members.iter().map(|s| s.to_string()).collect();
                out.push_str(&format!("group.{}={}\n", gid, sids.join(":")));
            }
            let mut weighted: Vec<_> = weights.iter().collect();
            weighted.sort();
            for (sid, weight) in weighted {
                out.push_str(&format!("weight.{sid}={weight}\n"));
            }
        }
        out.push_str(&format!("version={:x}", self.version));
        out
    }
}

/// Configuration identity: same membership and rule. The version is a
/// property of when the config was established, not of what it says.
impl PartialEq for QuorumVerifier {
    fn eq(&self, other: &Self) -> bool {
        self.all_members == other.all_members && self.rule == other.rule
    }
}

impl Eq for QuorumVerifier {}

impl fmt::Display for QuorumVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_config_text())
    }
}

fn voting_ids(members: &BTreeMap<ServerId, QuorumServer>) -> BTreeSet<ServerId> {
    members
        .values()
        .filter(|s| s.kind == LearnerKind::Participant)
        .map(|s| s.id)
        .collect()
}
