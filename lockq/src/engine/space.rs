use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    fmt,
};
use tokio::time::Instant;

use super::{LockError, LockOptions, LockRequest, RequestId, ResourceSet, Settled};

/// Lock manager of a single namespace.
///
/// Holds the set of locked resources and the queue of pending requests.
/// The space does not know who holds a resource; it only guarantees that
/// every resource is held by at most one granted request.
///
/// Each request carries a payload of type `T` that is handed back when the
/// request is settled.
pub struct LockSpace<T> {
    /// Resources held by some granted request.
    locked: HashSet<String>,
    /// Pending requests in order of arrival, keyed by sequence number.
    queue: BTreeMap<u64, LockRequest<T>>,
    /// Sequence numbers of pending requests by id.
    pending: HashMap<RequestId, u64>,
    /// Deadlines of pending requests.
    deadlines: BTreeSet<(Instant, u64)>,
    max_pending: Option<usize>,
    next_seq: u64,
    drain_scheduled: bool,
}

impl<T> fmt::Debug for LockSpace<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LockSpace")
            .field("locked", &self.locked.len())
            .field("pending", &self.pending.len())
            .field("max_pending", &self.max_pending)
            .finish()
    }
}

impl<T> Default for LockSpace<T> {
    fn default() -> Self {
        Self::new(None)
    }
}

impl<T> LockSpace<T> {
    /// Creates an empty lock space.
    ///
    /// At most `max_pending` requests are queued at any time; [None] means unbounded.
    pub fn new(max_pending: Option<usize>) -> Self {
        Self {
            locked: HashSet::new(),
            queue: BTreeMap::new(),
            pending: HashMap::new(),
            deadlines: BTreeSet::new(),
            max_pending,
            next_seq: 0,
            drain_scheduled: false,
        }
    }

    /// Locks all resources if none of them is locked.
    fn acquire(locked: &mut HashSet<String>, resources: &ResourceSet) -> bool {
        if resources.iter().any(|r| locked.contains(r)) {
            return false;
        }
        locked.extend(resources.iter().cloned());
        true
    }

    /// Atomically locks all specified resources without waiting.
    ///
    /// Returns `false` and locks nothing if any of the resources is already locked.
    pub fn try_lock(&mut self, resources: &ResourceSet) -> bool {
        Self::acquire(&mut self.locked, resources)
    }

    /// Requests a lock on all specified resources.
    ///
    /// The request is settled immediately if the resources are free (granted) or
    /// the queue is full (rejected with [LockError::CapacityExceeded]); in both
    /// cases the outcome is returned. Otherwise the request is queued and settled
    /// later by [drain](Self::drain), [expire](Self::expire) or [abort](Self::abort).
    ///
    /// The request id is returned in all cases.
    pub fn lock(
        &mut self, resources: ResourceSet, options: &LockOptions, payload: T,
    ) -> (RequestId, Option<Settled<T>>) {
        let id = RequestId::generate(&options.id_prefix, |cand| self.pending.contains_key(cand));
        let deadline = options.timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        let mut request = LockRequest::new(id.clone(), resources, deadline, payload);

        if self.try_lock(request.resources()) {
            log::trace!("lock request {} granted without waiting", &id);
            return (id, request.resolve());
        }

        if let Some(max_pending) = self.max_pending {
            if self.queue.len() >= max_pending {
                log::debug!("lock request {} rejected: {} requests pending", &id, self.queue.len());
                return (id, request.reject(LockError::CapacityExceeded { max_pending }));
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(deadline) = deadline {
            self.deadlines.insert((deadline, seq));
        }
        self.pending.insert(id.clone(), seq);
        self.queue.insert(seq, request);
        log::trace!("lock request {} queued at position {}", &id, self.queue.len());

        (id, None)
    }

    /// Unlocks the specified resources and schedules a drain of the queue.
    ///
    /// Returns `false` if any of the resources was not locked; the others are
    /// unlocked nevertheless.
    pub fn release(&mut self, resources: &ResourceSet) -> bool {
        let mut all_locked = true;
        let mut any_unlocked = false;
        for resource in resources {
            if self.locked.remove(resource) {
                any_unlocked = true;
            } else {
                all_locked = false;
            }
        }

        if any_unlocked && !self.queue.is_empty() {
            self.drain_scheduled = true;
        }

        all_locked
    }

    /// Whether a drain has been scheduled by [release](Self::release).
    pub fn needs_drain(&self) -> bool {
        self.drain_scheduled
    }

    /// Grants queued requests whose resources are free.
    ///
    /// The queue is scanned once in arrival order. Resources granted to an
    /// earlier request count as locked for all later requests of the same pass,
    /// but a blocked request does not hold up unrelated requests behind it.
    pub fn drain(&mut self) -> Vec<Settled<T>> {
        self.drain_scheduled = false;

        let mut granted = Vec::new();
        for (&seq, request) in &self.queue {
            if Self::acquire(&mut self.locked, request.resources()) {
                granted.push(seq);
            }
        }

        granted.into_iter().filter_map(|seq| self.detach(seq)?.resolve()).collect()
    }

    /// Aborts a pending request.
    ///
    /// Returns [None] if no request with this id is pending, in particular if it
    /// has already been granted.
    pub fn abort(&mut self, id: &str) -> Option<Settled<T>> {
        let seq = *self.pending.get(id)?;
        self.detach(seq)?.abort()
    }

    /// Rejects all pending requests whose deadline is not after `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<Settled<T>> {
        let due: Vec<u64> =
            self.deadlines.iter().take_while(|(deadline, _)| *deadline <= now).map(|(_, seq)| *seq).collect();

        due.into_iter()
            .filter_map(|seq| {
                let settled = self.detach(seq)?.reject(LockError::Timeout)?;
                log::debug!("lock request {} timed out", &settled.id);
                Some(settled)
            })
            .collect()
    }

    /// Earliest deadline of all pending requests.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.first().map(|(deadline, _)| *deadline)
    }

    /// Removes a request from the queue and all indexes.
    fn detach(&mut self, seq: u64) -> Option<LockRequest<T>> {
        let request = self.queue.remove(&seq)?;
        self.pending.remove(request.id());
        if let Some(deadline) = request.deadline() {
            self.deadlines.remove(&(deadline, seq));
        }
        Some(request)
    }

    /// True if nothing is locked and no request is pending.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.pending.is_empty() && self.locked.is_empty()
    }

    /// Whether the resource is currently locked.
    pub fn is_locked(&self, resource: &str) -> bool {
        self.locked.contains(resource)
    }

    /// Number of locked resources.
    pub fn locked_len(&self) -> usize {
        self.locked.len()
    }

    /// Whether a request with this id is pending.
    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    /// Number of pending requests.
    pub fn pending_len(&self) -> usize {
        self.queue.len()
    }

    /// Ids of pending requests in order of arrival.
    pub fn queued_ids(&self) -> impl Iterator<Item = &RequestId> {
        self.queue.values().map(|request| request.id())
    }

    /// Configured maximum number of pending requests.
    pub fn max_pending(&self) -> Option<usize> {
        self.max_pending
    }
}
