// NAT traversal — STUN probing, hole punching, connection coordination

pub mod coordinator;
pub mod probe;
pub mod punch;
pub mod stun;

use thiserror::Error;

pub use coordinator::{
    direct_compatibility, ConnectionCoordinator, ConnectionStrategy, PathDecision, PathStrategy,
};
pub use probe::{NatProbe, NatType, ProbeResult};
pub use punch::{answer_punch, attempt_hole_punch};
pub use stun::StunError;

#[derive(Debug, Error)]
pub enum NatError {
    #[error("NAT detection failed: {0}")]
    Detection(String),
    #[error("STUN server {0} timed out")]
    Timeout(String),
    #[error("STUN protocol error: {0}")]
    Stun(#[from] StunError),
    #[error("no relay available: {0}")]
    NoRelayAvailable(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
