//! Lock coordination engine.
//!
//! The engine is a plain, synchronous state machine. It owns no tasks and never
//! blocks: every operation completes immediately and reports its result, while
//! requests that cannot be granted right away are queued and settled later.
//!
//! * [LockSpace] manages a single namespace: the set of locked resources and the
//!   queue of pending requests.
//! * [LockUniverse] manages many namespaces, tracks which client owns what, and
//!   collects namespaces that have been idle for a while.
//!
//! Time is passed in explicitly through [Instant]s, so the owner of the engine
//! decides when deadlines fire. The [broker](crate::broker) drives an engine from
//! a single task.
//!
//! [Instant]: tokio::time::Instant

use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, error::Error, fmt};

mod double_keyed;
mod request;
mod space;
mod universe;

pub use double_keyed::{DoubleKeyedMap, DoubleKeyedSet};
pub use request::{LockOptions, LockRequest, RequestId, RequestState, Settled, REQUEST_ID_LENGTH};
pub use space::LockSpace;
pub use universe::{LockUniverse, Notice};

/// A set of resource keys.
///
/// Keys are opaque strings; the set removes duplicates.
pub type ResourceSet = BTreeSet<String>;

/// Namespace partitioning resource keys.
///
/// [None] is the default namespace.
pub type Namespace = Option<String>;

/// Identifier of a client of a [LockUniverse].
pub type ClientId = String;

/// A lock request was not granted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockError {
    /// The namespace already had the maximum number of pending requests queued.
    CapacityExceeded {
        /// The configured limit.
        max_pending: usize,
    },
    /// The request was not granted before its timeout elapsed.
    Timeout,
    /// The request was aborted.
    Aborted,
    /// The broker was shut down before the request was settled.
    Terminated,
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::CapacityExceeded { max_pending } => {
                write!(f, "too many pending lock requests (maximum is {})", max_pending)
            }
            Self::Timeout => write!(f, "lock request timed out"),
            Self::Aborted => write!(f, "lock request aborted"),
            Self::Terminated => write!(f, "lock broker terminated"),
        }
    }
}

impl Error for LockError {}
