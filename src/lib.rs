//! # zab-engine
//!
//! The leader side of the Zab atomic-broadcast protocol: the primary-backup
//! agreement engine that orders mutations in a replicated coordination
//! service.
//!
//! ## Features
//! - **Epoch Agreement**: quorum barriers for epoch hand-off after election
//! - **Learner Synchronization**: DIFF / TRUNC / SNAP catch-up for
//!   reconnecting followers and observers
//! - **Atomic Broadcast**: strictly ordered proposal / commit pipeline with
//!   multi-configuration quorum acknowledgment
//! - **Online Reconfiguration**: commit-and-activate membership changes
//!   with designated-leader hand-off
//! - **Runtime**: built for `tokio`
//!
//! ## Core Concepts
//!
//! Election promotes a peer, which drives [`Leader::lead`]: it installs the
//! new epoch, accepts learner connections, synchronizes a quorum, and then
//! broadcasts. The data tree, durable stores, authentication and election
//! are external collaborators behind the traits in [`state`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use zab_engine::{Leader, LeaderContext, QuorumVerifier};
//! # async fn example(ctx: LeaderContext) -> zab_engine::Result<()> {
//! let view = Arc::new(QuorumVerifier::parse(
//!     "server.1=127.0.0.1:2888:3888:participant\n\
//!      server.2=127.0.0.1:2889:3889:participant\n\
//!      server.3=127.0.0.1:2890:3890:participant",
//! )?);
//!
//! let leader = Leader::new(ctx, view)?;
//! leader.lead().await?;
//! // lead() returned: this peer goes back to election.
//! # Ok(())
//! # }
//! ```

pub mod config;
mod errors;
mod leader;
mod network;
mod quorum;
pub mod state;
mod wire;
mod zxid;

pub use config::*;
pub use errors::*;
pub use leader::*;
pub use network::*;
pub use quorum::*;
pub use state::*;
pub use wire::*;
pub use zxid::*;

#[doc(hidden)]
pub mod test_utils;
