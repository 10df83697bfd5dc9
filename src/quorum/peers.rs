use std::fmt;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;
use crate::ServerId;

/// Whether a learner votes on proposals or only observes commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LearnerKind {
    Participant,
    Observer,
}

impl fmt::Display for LearnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LearnerKind::Participant => f.write_str("participant"),
            LearnerKind::Observer => f.write_str("observer"),
        }
    }
}

/// A resolvable peer endpoint. Kept as `host:port` text because quorum
/// configurations routinely name peers by hostname; resolution happens at
/// bind/connect time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        PeerAddr {
            host: host.into(),
            port,
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        let (host, port) = text
            .rsplit_once(':')
            .ok_or_else(|| config_err(format!("address '{text}' is missing a port")))?;
        if host.is_empty() {
            return Err(config_err(format!("address '{text}' is missing a host")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| config_err(format!("invalid port in address '{text}'")))?;
        Ok(PeerAddr::new(host, port))
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One server entry of a quorum configuration:
/// `server.<id>=<host>:<quorum-port>[:<election-port>][:<role>][;[<host>:]<client-port>]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuorumServer {
    pub id: ServerId,
    pub quorum_addr: PeerAddr,
    pub election_addr: Option<PeerAddr>,
    pub client_addr: Option<PeerAddr>,
    pub kind: LearnerKind,
}

impl QuorumServer {
    /// Parse the value part of a `server.<id>=` line.
    pub fn parse(id: ServerId, value: &str) -> Result<Self> {
        let (server_part, client_part) = match value.split_once(';') {
            Some((s, c)) => (s, Some(c)),
            None => (value, None),
        };

        let mut fields = server_part.split(':');
        let host = fields
            .next()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| config_err(format!("server.{id}: missing host")))?;
        let quorum_port = parse_port(id, fields.next())?;

        let mut election_addr = None;
        let mut kind = LearnerKind::Participant;
        let rest: Vec<&str> = fields.collect();
        match rest.as_slice() {
            [] => {}
            [port] if is_port(port) => {
                election_addr = Some(PeerAddr::new(host, parse_port(id, Some(port))?));
            }
            [role] => kind = parse_role(id, role)?,
            [port, role] => {
                election_addr = Some(PeerAddr::new(host, parse_port(id, Some(port))?));
                kind = parse_role(id, role)?;
            }
            _ => {
                return Err(config_err(format!(
                    "server.{id}: too many ':'-separated fields in '{value}'"
                )))
            }
        }

        let client_addr = match client_part {
            None => None,
            Some(c) if c.contains(':') => Some(PeerAddr::parse(c)?),
            Some(c) => Some(PeerAddr::new("0.0.0.0", parse_port(id, Some(c))?)),
        };

        Ok(QuorumServer {
            id,
            quorum_addr: PeerAddr::new(host, quorum_port),
            election_addr,
            client_addr,
            kind,
        })
    }

    /// Canonical config-line value, the inverse of [`QuorumServer::parse`].
    pub fn to_config_value(&self) -> String {
        let mut out = self.quorum_addr.to_string();
        if let Some(election) = &self.election_addr {
            out.push_str(&format!(":{}", election.port));
        }
        out.push_str(&format!(":{}", self.kind));
        if let Some(client) = &self.client_addr {
            out.push_str(&format!(";{client}"));
        }
        out
    }
}

fn is_port(text: &str) -> bool {
    text.chars().all(|c| c.is_ascii_digit()) && !text.is_empty()
}

fn parse_port(id: ServerId, field: Option<&str>) -> Result<u16> {
    field
        .and_then(|p| p.parse::<u16>().ok())
        .ok_or_else(|| config_err(format!("server.{id}: missing or invalid port")))
}

fn parse_role(id: ServerId, role: &str) -> Result<LearnerKind> {
    match role {
        "participant" => Ok(LearnerKind::Participant),
        "observer" => Ok(LearnerKind::Observer),
        other => Err(config_err(format!("server.{id}: unknown role '{other}'"))),
    }
}

pub(crate) fn config_err(message: String) -> Error {
    Error::Config(ConfigError::Message(message))
}
