use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::run_learner_session;
use crate::Leader;
use crate::NetworkError;
use crate::PeerAddr;
use crate::Result;

/// Accepts follower/observer connections on the leader's quorum addresses.
///
/// One listener per configured address, one accept task per listener. A
/// partial bind is tolerated; failing to bind every address is fatal for
/// leader startup.
pub struct LearnerAcceptor {
    listeners: Vec<TcpListener>,
}

impl LearnerAcceptor {
    pub async fn bind(addrs: &[PeerAddr]) -> Result<Self> {
        let mut listeners = Vec::new();
        for addr in addrs {
            match TcpListener::bind((addr.host.as_str(), addr.port)).await {
                Ok(listener) => {
                    info!("Learner acceptor bound to {}", addr);
                    listeners.push(listener);
                }
                Err(e) => error!("Couldn't bind to {}: {}", addr, e),
            }
        }
        if listeners.is_empty() {
            let addresses = addrs
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("|");
            return Err(NetworkError::BindFailure { addresses }.into());
        }
        Ok(LearnerAcceptor { listeners })
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .collect()
    }

    /// Spawn one accept task per bound socket. The tasks exit (dropping
    /// their sockets) when the leader's shutdown signal fires.
    pub fn start(self, leader: Arc<Leader>) {
        for listener in self.listeners {
            tokio::spawn(accept_loop(listener, leader.clone()));
        }
    }
}

async fn accept_loop(listener: TcpListener, leader: Arc<Leader>) {
    let mut shutdown_rx = leader.shutdown_signal();
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                info!("Learner acceptor on {:?} stopping", listener.local_addr().ok());
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nodelay(leader.config().nodelay) {
                        warn!("Failed to set TCP_NODELAY on {}: {}", addr, e);
                    }
                    debug!("Accepted learner connection from {}", addr);
                    tokio::spawn(run_learner_session(leader.clone(), stream, addr));
                }
                Err(e) => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                    warn!("Exception while accepting follower: {}", e);
                }
            }
        }
    }
}
