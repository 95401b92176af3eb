use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use std::{borrow::Borrow, fmt, ops::Deref, time::Duration};
use tokio::time::Instant;

use super::{LockError, ResourceSet};

/// Number of random characters in a generated request id.
pub const REQUEST_ID_LENGTH: usize = 30;

/// Identifier of a lock request.
///
/// Consists of an optional prefix followed by [REQUEST_ID_LENGTH] random
/// alphanumeric characters.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generates a random request id with the specified prefix that is not `taken`.
    pub(crate) fn generate(prefix: &str, taken: impl Fn(&str) -> bool) -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let mut cand = String::with_capacity(prefix.len() + REQUEST_ID_LENGTH);
            cand.push_str(prefix);
            cand.extend((&mut rng).sample_iter(Alphanumeric).take(REQUEST_ID_LENGTH).map(char::from));
            if !taken(&cand) {
                break Self(cand);
            }
        }
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Converts the id into a string.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Deref for RequestId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Borrow<str> for RequestId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Options for a lock request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LockOptions {
    /// Time after which a queued request is rejected with [LockError::Timeout].
    ///
    /// By default requests wait indefinitely.
    pub timeout: Option<Duration>,
    /// Prefix prepended to the generated request id.
    pub id_prefix: String,
}

impl LockOptions {
    /// Lock options with the specified timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout: Some(timeout), ..Default::default() }
    }
}

/// State of a lock request.
///
/// A request leaves [Pending](Self::Pending) exactly once; all other states are final.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestState {
    /// Waiting for its resources.
    Pending,
    /// All resources have been locked on behalf of the request.
    Granted,
    /// The request was refused or timed out.
    Rejected,
    /// The request was aborted.
    Aborted,
}

/// Outcome of a lock request that left the pending state.
#[derive(Clone, Debug)]
pub struct Settled<T> {
    /// Request id.
    pub id: RequestId,
    /// Requested resources.
    pub resources: ResourceSet,
    /// `Ok` if the resources were granted.
    pub result: Result<(), LockError>,
    /// Payload attached when the request was made.
    pub payload: T,
}

/// A request for a set of resources.
pub struct LockRequest<T> {
    id: RequestId,
    resources: ResourceSet,
    deadline: Option<Instant>,
    state: RequestState,
    payload: Option<T>,
}

impl<T> fmt::Debug for LockRequest<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LockRequest")
            .field("id", &self.id)
            .field("resources", &self.resources)
            .field("deadline", &self.deadline)
            .field("state", &self.state)
            .finish()
    }
}

impl<T> LockRequest<T> {
    /// Creates a pending request.
    pub fn new(id: RequestId, resources: ResourceSet, deadline: Option<Instant>, payload: T) -> Self {
        Self { id, resources, deadline, state: RequestState::Pending, payload: Some(payload) }
    }

    /// Request id.
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Requested resources.
    pub fn resources(&self) -> &ResourceSet {
        &self.resources
    }

    /// Instant after which the request times out.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Current state.
    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Marks the request as granted.
    ///
    /// Returns [None] if the request was already settled.
    pub fn resolve(&mut self) -> Option<Settled<T>> {
        self.settle(RequestState::Granted, Ok(()))
    }

    /// Marks the request as rejected with the specified error.
    ///
    /// Returns [None] if the request was already settled.
    pub fn reject(&mut self, err: LockError) -> Option<Settled<T>> {
        let state = match err {
            LockError::Aborted => RequestState::Aborted,
            _ => RequestState::Rejected,
        };
        self.settle(state, Err(err))
    }

    /// Marks the request as aborted.
    ///
    /// Returns [None] if the request was already settled.
    pub fn abort(&mut self) -> Option<Settled<T>> {
        self.reject(LockError::Aborted)
    }

    fn settle(&mut self, state: RequestState, result: Result<(), LockError>) -> Option<Settled<T>> {
        if self.state != RequestState::Pending {
            return None;
        }
        self.state = state;
        self.deadline = None;
        let payload = self.payload.take()?;
        Some(Settled { id: self.id.clone(), resources: self.resources.clone(), result, payload })
    }
}
