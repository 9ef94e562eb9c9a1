//! Customized unified error type spanning all cluster subsystems.

use std::fmt;
use std::io;

use crate::replica::NodeId;

/// Customized error type for Volary. Every fallible cluster operation
/// classifies its failure into one of these kinds; kinds cross API
/// boundaries verbatim.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ClusterError {
    /// Channel, node, slot, or shard absent.
    NotFound(String),

    /// The addressed replica is not the leader; `hint` carries the node id
    /// of the believed leader (0 if unknown). Callers should redirect.
    NotLeader { hint: NodeId },

    /// A message or propose carried a term older than the replica's.
    StaleTerm,

    /// A bounded wait (e.g. propose-and-wait-commit) ran out of time. The
    /// awaited log may still commit later.
    Timeout,

    /// The receive queue's memory budget rejected a payload-heavy message.
    RateLimited,

    /// The shard log storage failed; fatal for the owning shard.
    StorageFailure(String),

    /// A peer could not be reached; retryable by the caller.
    TransportFailure(String),

    /// A protocol invariant was broken; fatal for the owning shard.
    InvariantViolation(String),

    /// Anything else, carried as its string representation.
    Other(String),
}

impl ClusterError {
    /// Constructs an `Other` error from anything printable.
    pub fn msg(m: impl ToString) -> Self {
        ClusterError::Other(m.to_string())
    }
}

impl fmt::Display for ClusterError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ClusterError::NotFound(what) => write!(f, "not found: {}", what),
            ClusterError::NotLeader { hint } => {
                write!(f, "not leader (hint node {})", hint)
            }
            ClusterError::StaleTerm => write!(f, "stale term"),
            ClusterError::Timeout => write!(f, "timeout"),
            ClusterError::RateLimited => write!(f, "rate limited"),
            ClusterError::StorageFailure(e) => {
                write!(f, "storage failure: {}", e)
            }
            ClusterError::TransportFailure(e) => {
                write!(f, "transport failure: {}", e)
            }
            ClusterError::InvariantViolation(e) => {
                write!(f, "invariant violation: {}", e)
            }
            ClusterError::Other(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ClusterError {}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `ClusterError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for ClusterError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                ClusterError::Other(e.to_string())
            }
        }
    };
    ($error:ty => $kind:ident) => {
        impl From<$error> for ClusterError {
            fn from(e: $error) -> Self {
                ClusterError::$kind(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error => StorageFailure);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(std::string::FromUtf8Error);
