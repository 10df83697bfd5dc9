//! Per-learner protocol sessions.
//!
//! Each accepted connection runs one session task through the handshake
//! (FOLLOWERINFO → LEADERINFO → ACKEPOCH), synchronization (DIFF / TRUNC /
//! SNAP plus NEWLEADER), and then the serving loop (acks, pings,
//! revalidations). A companion task drains the session's outbound FIFO, so
//! every packet the leader queues reaches the wire in order.
//!
//! The leader never touches a session directly: it holds a
//! [`LearnerHandle`] keyed by sid, through which it queues packets, reads
//! liveness, and requests closure.

use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use futures::Stream;
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::decode_epoch_ack;
use crate::decode_revalidate_request;
use crate::decode_session_touches;
use crate::encode_leader_info;
use crate::encode_revalidate_reply;
use crate::Leader;
use crate::LearnerInfo;
use crate::LearnerKind;
use crate::NetworkError;
use crate::PacketCodec;
use crate::PacketType;
use crate::QuorumPacket;
use crate::Result;
use crate::ServerId;
use crate::StateSummary;
use crate::WireError;
use crate::Zxid;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Session lifecycle, stored as an atomic so the leader can read it without
/// any coordination with the session task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum LearnerPhase {
    Connecting = 0,
    Syncing = 1,
    /// Registered for the broadcast stream (sync prologue queued).
    Forwarding = 2,
    /// UPTODATE sent; the learner serves clients.
    Serving = 3,
    Closed = 4,
}

impl LearnerPhase {
    fn from_u8(raw: u8) -> LearnerPhase {
        match raw {
            0 => LearnerPhase::Connecting,
            1 => LearnerPhase::Syncing,
            2 => LearnerPhase::Forwarding,
            3 => LearnerPhase::Serving,
            _ => LearnerPhase::Closed,
        }
    }
}

/// The leader-side view of one learner session.
#[derive(Debug)]
pub struct LearnerHandle {
    token: u64,
    sid: ServerId,
    kind: LearnerKind,
    addr: SocketAddr,
    tx: mpsc::UnboundedSender<QuorumPacket>,
    phase: AtomicU8,
    /// Logical tick by which the next packet must arrive for the learner
    /// to still count as synced.
    ack_deadline_tick: AtomicU64,
    close_tx: watch::Sender<bool>,
}

impl LearnerHandle {
    pub(crate) fn new(
        sid: ServerId,
        kind: LearnerKind,
        addr: SocketAddr,
        tx: mpsc::UnboundedSender<QuorumPacket>,
    ) -> Arc<Self> {
        Arc::new(LearnerHandle {
            token: NEXT_TOKEN.fetch_add(1, Ordering::Relaxed),
            sid,
            kind,
            addr,
            tx,
            phase: AtomicU8::new(LearnerPhase::Connecting as u8),
            ack_deadline_tick: AtomicU64::new(0),
            close_tx: watch::channel(false).0,
        })
    }

    pub fn sid(&self) -> ServerId {
        self.sid
    }

    pub fn kind(&self) -> LearnerKind {
        self.kind
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub(crate) fn token(&self) -> u64 {
        self.token
    }

    /// Enqueue a packet on the session FIFO. Returns false once the
    /// session is gone; the caller treats that as a closed learner.
    pub(crate) fn queue_packet(&self, packet: QuorumPacket) -> bool {
        self.tx.send(packet).is_ok()
    }

    fn phase(&self) -> LearnerPhase {
        LearnerPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: LearnerPhase) {
        // Closed is terminal.
        if self.phase() != LearnerPhase::Closed {
            self.phase.store(phase as u8, Ordering::Release);
        }
    }

    pub(crate) fn mark_syncing(&self) {
        self.set_phase(LearnerPhase::Syncing);
    }

    pub(crate) fn start_forwarding(&self) {
        self.set_phase(LearnerPhase::Forwarding);
    }

    pub(crate) fn mark_serving(&self) {
        self.set_phase(LearnerPhase::Serving);
    }

    pub fn is_forwarding(&self) -> bool {
        self.kind == LearnerKind::Participant
            && matches!(
                self.phase(),
                LearnerPhase::Forwarding | LearnerPhase::Serving
            )
    }

    pub fn is_observing(&self) -> bool {
        self.kind == LearnerKind::Observer
            && matches!(
                self.phase(),
                LearnerPhase::Forwarding | LearnerPhase::Serving
            )
    }

    pub(crate) fn set_ack_deadline(&self, tick: u64) {
        self.ack_deadline_tick.store(tick, Ordering::Relaxed);
    }

    /// Alive and inside its ack deadline.
    pub fn synced(&self, current_tick: u64) -> bool {
        self.phase() != LearnerPhase::Closed
            && self.ack_deadline_tick.load(Ordering::Relaxed) > current_tick
    }

    /// Ask the session tasks to exit. Safe to call repeatedly and from any
    /// task; the socket closes when the tasks unwind.
    pub fn close(&self) {
        self.phase.store(LearnerPhase::Closed as u8, Ordering::Release);
        self.close_tx.send_replace(true);
    }

    fn close_signal(&self) -> watch::Receiver<bool> {
        self.close_tx.subscribe()
    }
}

/// Entry point spawned by the acceptor for each connection.
pub(crate) async fn run_learner_session(leader: Arc<Leader>, stream: TcpStream, addr: SocketAddr) {
    if let Err(e) = serve_learner(&leader, stream, addr).await {
        // Per-learner failures are local: log and let the peer reconnect.
        warn!("Learner session from {} terminated: {}", addr, e);
    }
}

async fn serve_learner(leader: &Arc<Leader>, stream: TcpStream, addr: SocketAddr) -> Result<()> {
    let mut framed = Framed::new(stream, PacketCodec::new());
    let init_timeout = leader.config().init_timeout();

    // READING_INFO: the first packet identifies the learner.
    let info_packet = recv_within(&mut framed, init_timeout).await?;
    let kind = match info_packet.ptype {
        PacketType::FollowerInfo => LearnerKind::Participant,
        PacketType::ObserverInfo => LearnerKind::Observer,
        other => {
            return Err(WireError::UnexpectedPacket {
                expected: "FOLLOWERINFO",
                got: other.name(),
            }
            .into())
        }
    };
    let info = LearnerInfo::decode(info_packet.data.as_ref())?;
    leader
        .auth_server()
        .authenticate(info.sid, info_packet.auth.as_deref().unwrap_or(&[]))?;
    let sid = info.sid.unwrap_or_else(|| leader.assign_observer_sid());
    // FOLLOWERINFO's zxid field carries the learner's accepted epoch.
    let last_accepted_epoch = info_packet.zxid.epoch() as i64;
    debug!(
        "Learner sid: {} ({:?}) from {}: {:?}",
        sid, kind, addr, info
    );

    let (tx, rx) = mpsc::unbounded_channel();
    let handle = LearnerHandle::new(sid, kind, addr, tx);
    leader.register_learner(handle.clone());

    let result = drive_session(leader, framed, &handle, rx, last_accepted_epoch).await;

    leader.remove_learner(&handle);
    handle.close();
    result
}

async fn drive_session(
    leader: &Arc<Leader>,
    mut framed: Framed<TcpStream, PacketCodec>,
    handle: &Arc<LearnerHandle>,
    outbound_rx: mpsc::UnboundedReceiver<QuorumPacket>,
    last_accepted_epoch: i64,
) -> Result<()> {
    let sid = handle.sid();
    let init_timeout = leader.config().init_timeout();

    // Contribute the learner's accepted epoch; blocks until the epoch
    // quorum forms.
    let epoch = leader.get_epoch_to_propose(sid, last_accepted_epoch).await?;

    // SENT_LEADERINFO
    let leader_info = QuorumPacket::new(
        PacketType::LeaderInfo,
        Zxid::epoch_base(epoch as u64),
        Some(encode_leader_info()),
    );
    framed.send(leader_info).await?;

    let epoch_ack = recv_within(&mut framed, init_timeout).await?;
    if epoch_ack.ptype != PacketType::AckEpoch {
        return Err(WireError::UnexpectedPacket {
            expected: "ACKEPOCH",
            got: epoch_ack.ptype.name(),
        }
        .into());
    }
    let peer_epoch = decode_epoch_ack(epoch_ack.data.as_ref())?;
    let summary = StateSummary::new(peer_epoch as i64, epoch_ack.zxid);
    leader.wait_for_epoch_ack(sid, summary).await?;

    // SYNCING: pick the strategy and queue the whole prologue. A snapshot
    // is serialized outside the leader lock; the lock-held replay then
    // covers anything committed since.
    handle.mark_syncing();
    let snapshot = if leader.sync_needs_snapshot(summary.last_zxid) {
        let payload = leader.replicated_state().snapshot().await?;
        let snap_zxid = leader.replicated_state().last_processed_zxid();
        Some((payload, snap_zxid))
    } else {
        None
    };
    let newleader_zxid = leader.queue_sync_and_forward(handle, summary.last_zxid, snapshot);

    // The outbound pump owns the write half from here; the prologue it
    // drains first ends with NEWLEADER.
    let (sink, mut stream) = framed.split();
    tokio::spawn(pump_outbound(sink, outbound_rx, handle.close_signal()));

    let newleader_ack = recv_within(&mut stream, init_timeout).await?;
    if newleader_ack.ptype != PacketType::Ack {
        return Err(WireError::UnexpectedPacket {
            expected: "ACK",
            got: newleader_ack.ptype.name(),
        }
        .into());
    }
    leader.wait_for_new_leader_ack(sid, newleader_ack.zxid).await?;

    // UPTODATE_WAIT → SERVING. The ack of UPTODATE arrives in the serving
    // loop as an epoch-base ACK and is dropped by the ack pipeline.
    info!("Synchronization with sid {} complete, sending UPTODATE", sid);
    handle.queue_packet(QuorumPacket::marker(
        PacketType::UpToDate,
        Zxid::epoch_base(newleader_zxid.epoch()),
    ));
    handle.mark_serving();

    serving_loop(leader, &mut stream, handle).await
}

async fn serving_loop<S>(
    leader: &Arc<Leader>,
    stream: &mut S,
    handle: &Arc<LearnerHandle>,
) -> Result<()>
where
    S: Stream<Item = std::io::Result<QuorumPacket>> + Unpin,
{
    let sid = handle.sid();
    let sync_timeout = leader.config().sync_timeout();
    let mut close_rx = handle.close_signal();

    loop {
        let packet = tokio::select! {
            _ = close_rx.changed() => {
                debug!("Session for sid {} closed by leader", sid);
                return Ok(());
            }
            received = recv_within(stream, sync_timeout) => received?,
        };

        handle.set_ack_deadline(leader.tick_of_next_ack_deadline());
        trace!("sid {} -> {}", sid, packet);

        match packet.ptype {
            PacketType::Ack => {
                leader.process_ack(sid, packet.zxid, Some(handle.addr()));
            }
            PacketType::Ping => {
                // Ping replies piggyback the learner's client sessions.
                for (session_id, session_timeout) in
                    decode_session_touches(packet.data.as_ref())?
                {
                    leader
                        .replicated_state()
                        .touch_session(session_id, session_timeout);
                }
            }
            PacketType::Revalidate => {
                let (session_id, session_timeout) =
                    decode_revalidate_request(packet.data.as_ref())?;
                let valid = leader
                    .replicated_state()
                    .check_global_session(session_id, session_timeout);
                trace!("Session 0x{:x} is valid: {}", session_id, valid);
                handle.queue_packet(QuorumPacket::new(
                    PacketType::Revalidate,
                    packet.zxid,
                    Some(encode_revalidate_reply(session_id, valid)),
                ));
            }
            PacketType::Request => {
                leader
                    .replicated_state()
                    .submit_learner_request(sid, packet.data.unwrap_or_default());
            }
            other => {
                warn!("unexpected packet type {} from sid {}", other, sid);
            }
        }
    }
}

/// Drains the session FIFO into the socket. Single consumer per queue, so
/// packets hit the wire exactly in enqueue order.
async fn pump_outbound(
    mut sink: futures::stream::SplitSink<Framed<TcpStream, PacketCodec>, QuorumPacket>,
    mut rx: mpsc::UnboundedReceiver<QuorumPacket>,
    mut close_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = close_rx.changed() => break,
            packet = rx.recv() => match packet {
                Some(packet) => {
                    if let Err(e) = sink.send(packet).await {
                        debug!("outbound pump stopping: {}", e);
                        break;
                    }
                }
                None => break,
            }
        }
    }
    // Flush what was queued before the close landed: a learner removed by
    // reconfig must still see its COMMITANDACTIVATE.
    while let Ok(packet) = rx.try_recv() {
        if sink.send(packet).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn recv_within<S>(stream: &mut S, limit: Duration) -> Result<QuorumPacket>
where
    S: Stream<Item = std::io::Result<QuorumPacket>> + Unpin,
{
    match timeout(limit, stream.next()).await {
        Err(_elapsed) => Err(NetworkError::SessionTimeout(limit).into()),
        Ok(None) => Err(NetworkError::ConnectionClosed.into()),
        Ok(Some(Err(e))) => Err(e.into()),
        Ok(Some(Ok(packet))) => Ok(packet),
    }
}
