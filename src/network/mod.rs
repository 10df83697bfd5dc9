//! Learner-facing networking: the connection acceptor and the per-learner
//! protocol sessions.

mod acceptor;
mod learner;

pub use acceptor::*;
pub use learner::*;
