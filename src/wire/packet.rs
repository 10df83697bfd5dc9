use std::fmt;

use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

use crate::ServerId;
use crate::WireError;
use crate::Zxid;

/// Protocol version advertised in LEADERINFO.
pub const PROTOCOL_VERSION: u32 = 0x10000;

/// Packet types exchanged between the leader and its learners.
///
/// The discriminants are the wire codes; they are fixed by the protocol and
/// must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PacketType {
    /// Forwarded client mutation (learner → leader)
    Request = 1,
    /// Proposed transaction (leader → follower)
    Proposal = 2,
    /// Follower acknowledges a zxid
    Ack = 3,
    /// Commit a zxid on followers
    Commit = 4,
    /// Liveness probe; the reply carries client-session touch data
    Ping = 5,
    /// Session validity query and its echo reply
    Revalidate = 6,
    /// Reply flushing the pipe after a sync request
    Sync = 7,
    /// Commit notification for observers
    Inform = 8,
    /// Commit of a reconfig plus the designated leader
    CommitAndActivate = 9,
    /// New-epoch announcement carrying the last-seen configuration
    NewLeader = 10,
    /// Follower handshake
    FollowerInfo = 11,
    /// Permission to start serving clients
    UpToDate = 12,
    /// Sync strategy marker: incremental replay follows
    Diff = 13,
    /// Truncate the follower log down to the carried zxid
    Trunc = 14,
    /// Full snapshot follows
    Snap = 15,
    /// Observer handshake
    ObserverInfo = 16,
    /// Leader's advertised epoch and protocol version
    LeaderInfo = 17,
    /// Follower accepts the epoch; carries its state summary
    AckEpoch = 18,
    /// Reconfig commit notification for observers
    InformAndActivate = 19,
}

impl PacketType {
    pub fn from_code(code: u32) -> Result<Self, WireError> {
        Ok(match code {
            1 => PacketType::Request,
            2 => PacketType::Proposal,
            3 => PacketType::Ack,
            4 => PacketType::Commit,
            5 => PacketType::Ping,
            6 => PacketType::Revalidate,
            7 => PacketType::Sync,
            8 => PacketType::Inform,
            9 => PacketType::CommitAndActivate,
            10 => PacketType::NewLeader,
            11 => PacketType::FollowerInfo,
            12 => PacketType::UpToDate,
            13 => PacketType::Diff,
            14 => PacketType::Trunc,
            15 => PacketType::Snap,
            16 => PacketType::ObserverInfo,
            17 => PacketType::LeaderInfo,
            18 => PacketType::AckEpoch,
            19 => PacketType::InformAndActivate,
            other => return Err(WireError::UnknownPacketType(other)),
        })
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            PacketType::Request => "REQUEST",
            PacketType::Proposal => "PROPOSAL",
            PacketType::Ack => "ACK",
            PacketType::Commit => "COMMIT",
            PacketType::Ping => "PING",
            PacketType::Revalidate => "REVALIDATE",
            PacketType::Sync => "SYNC",
            PacketType::Inform => "INFORM",
            PacketType::CommitAndActivate => "COMMITANDACTIVATE",
            PacketType::NewLeader => "NEWLEADER",
            PacketType::FollowerInfo => "FOLLOWERINFO",
            PacketType::UpToDate => "UPTODATE",
            PacketType::Diff => "DIFF",
            PacketType::Trunc => "TRUNC",
            PacketType::Snap => "SNAP",
            PacketType::ObserverInfo => "OBSERVERINFO",
            PacketType::LeaderInfo => "LEADERINFO",
            PacketType::AckEpoch => "ACKEPOCH",
            PacketType::InformAndActivate => "INFORMANDACTIVATE",
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One packet on a quorum connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuorumPacket {
    pub ptype: PacketType,
    pub zxid: Zxid,
    pub data: Option<Bytes>,
    pub auth: Option<Bytes>,
}

impl QuorumPacket {
    pub fn new(ptype: PacketType, zxid: Zxid, data: Option<Bytes>) -> Self {
        QuorumPacket {
            ptype,
            zxid,
            data,
            auth: None,
        }
    }

    /// Zxid-only packet with no payload (COMMIT, TRUNC, UPTODATE, ...).
    pub fn marker(ptype: PacketType, zxid: Zxid) -> Self {
        Self::new(ptype, zxid, None)
    }
}

impl fmt::Display for QuorumPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} zxid {} ({} payload bytes)",
            self.ptype,
            self.zxid,
            self.data.as_ref().map(Bytes::len).unwrap_or(0)
        )
    }
}

/// Payload of FOLLOWERINFO / OBSERVERINFO.
///
/// Learners predating the protocol-version handshake sent a bare sid, and
/// the very oldest sent nothing at all; decoding tolerates both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LearnerInfo {
    pub sid: Option<ServerId>,
    pub protocol_version: u32,
    pub config_version: i64,
}

impl LearnerInfo {
    pub fn new(sid: ServerId, config_version: i64) -> Self {
        LearnerInfo {
            sid: Some(sid),
            protocol_version: PROTOCOL_VERSION,
            config_version,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(20);
        buf.put_i64(self.sid.unwrap_or(-1));
        buf.put_u32(self.protocol_version);
        buf.put_i64(self.config_version);
        buf.freeze()
    }

    pub fn decode(data: Option<&Bytes>) -> Result<Self, WireError> {
        let mut info = LearnerInfo {
            sid: None,
            protocol_version: 0,
            config_version: -1,
        };
        let Some(data) = data else {
            return Ok(info);
        };
        let mut buf = data.clone();
        if buf.remaining() >= 8 {
            info.sid = Some(buf.get_i64());
        }
        if buf.remaining() >= 4 {
            info.protocol_version = buf.get_u32();
        }
        if buf.remaining() >= 8 {
            info.config_version = buf.get_i64();
        }
        Ok(info)
    }
}

/// LEADERINFO payload: the leader's protocol version.
pub fn encode_leader_info() -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u32(PROTOCOL_VERSION);
    buf.freeze()
}

/// ACKEPOCH payload: the follower's current epoch (−1 when unknown).
pub fn encode_epoch_ack(current_epoch: i32) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_i32(current_epoch);
    buf.freeze()
}

pub fn decode_epoch_ack(data: Option<&Bytes>) -> Result<i32, WireError> {
    let data = data.ok_or(WireError::Truncated { needed: 4 })?;
    if data.len() < 4 {
        return Err(WireError::Truncated {
            needed: 4 - data.len(),
        });
    }
    Ok(data.clone().get_i32())
}

/// COMMITANDACTIVATE payload: the designated leader for the new config.
pub fn encode_commit_and_activate(designated_leader: ServerId) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_i64(designated_leader);
    buf.freeze()
}

pub fn decode_commit_and_activate(data: Option<&Bytes>) -> Result<ServerId, WireError> {
    let data = data.ok_or(WireError::Truncated { needed: 8 })?;
    if data.len() < 8 {
        return Err(WireError::Truncated {
            needed: 8 - data.len(),
        });
    }
    Ok(data.clone().get_i64())
}

/// INFORMANDACTIVATE payload: designated leader followed by the reconfig
/// proposal data, so observers can apply without having seen the PROPOSAL.
pub fn encode_inform_and_activate(designated_leader: ServerId, proposal_data: &Bytes) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + proposal_data.len());
    buf.put_i64(designated_leader);
    buf.put_slice(proposal_data);
    buf.freeze()
}

/// REVALIDATE request payload.
pub fn decode_revalidate_request(data: Option<&Bytes>) -> Result<(i64, i32), WireError> {
    let data = data.ok_or(WireError::Truncated { needed: 12 })?;
    if data.len() < 12 {
        return Err(WireError::Truncated {
            needed: 12 - data.len(),
        });
    }
    let mut buf = data.clone();
    Ok((buf.get_i64(), buf.get_i32()))
}

pub fn encode_revalidate_request(session_id: i64, timeout: i32) -> Bytes {
    let mut buf = BytesMut::with_capacity(12);
    buf.put_i64(session_id);
    buf.put_i32(timeout);
    buf.freeze()
}

/// REVALIDATE reply payload: the session id and whether it is still valid.
pub fn encode_revalidate_reply(session_id: i64, valid: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(9);
    buf.put_i64(session_id);
    buf.put_u8(valid as u8);
    buf.freeze()
}

pub fn decode_revalidate_reply(data: Option<&Bytes>) -> Result<(i64, bool), WireError> {
    let data = data.ok_or(WireError::Truncated { needed: 9 })?;
    if data.len() < 9 {
        return Err(WireError::Truncated {
            needed: 9 - data.len(),
        });
    }
    let mut buf = data.clone();
    Ok((buf.get_i64(), buf.get_u8() != 0))
}

/// PING reply payload: `(session_id, timeout)` pairs of the sessions the
/// follower is keeping alive. An empty payload is a bare liveness reply.
pub fn decode_session_touches(data: Option<&Bytes>) -> Result<Vec<(i64, i32)>, WireError> {
    let Some(data) = data else {
        return Ok(Vec::new());
    };
    let mut buf = data.clone();
    let mut touches = Vec::with_capacity(buf.remaining() / 12);
    while buf.remaining() >= 12 {
        touches.push((buf.get_i64(), buf.get_i32()));
    }
    if buf.has_remaining() {
        return Err(WireError::Truncated {
            needed: 12 - buf.remaining(),
        });
    }
    Ok(touches)
}

pub fn encode_session_touches(touches: &[(i64, i32)]) -> Bytes {
    let mut buf = BytesMut::with_capacity(touches.len() * 12);
    for (session_id, timeout) in touches {
        buf.put_i64(*session_id);
        buf.put_i32(*timeout);
    }
    buf.freeze()
}
