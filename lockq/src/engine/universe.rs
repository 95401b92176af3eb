use std::{
    collections::{BTreeSet, HashMap, HashSet},
    fmt, mem,
    time::Duration,
};
use tokio::time::Instant;

use super::{
    ClientId, DoubleKeyedMap, DoubleKeyedSet, LockError, LockOptions, LockSpace, Namespace, RequestId,
    ResourceSet, Settled,
};

/// Payload of a request queued in a lock space on behalf of a client.
struct ClientRequest<N> {
    client: ClientId,
    notify: N,
}

/// Ownership ledger of a client.
#[derive(Default)]
struct ClientRecord {
    /// Resources granted to the client.
    locked: DoubleKeyedSet<Namespace, String>,
    /// Pending requests of the client with their resources.
    requests: DoubleKeyedMap<Namespace, RequestId, ResourceSet>,
}

/// A lock request made through [LockUniverse::lock] has been settled.
///
/// Notices are collected by the universe and must be taken using
/// [LockUniverse::take_notices] for delivery.
#[derive(Debug)]
pub struct Notice<N> {
    /// Client that made the request.
    pub client: ClientId,
    /// Namespace of the request.
    pub namespace: Namespace,
    /// Request id.
    pub request_id: RequestId,
    /// `Ok` if the lock was granted.
    pub result: Result<(), LockError>,
    /// Notifier provided when the request was made.
    pub notify: N,
}

/// Pending timer of a namespace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Wakeup {
    /// A pending request times out.
    Expire,
    /// The idle namespace is removed.
    Collect,
}

/// Lock manager for many namespaces and clients.
///
/// Namespaces are created on first use and removed after they have been
/// empty for the idle timeout. For each client the universe records the
/// resources it owns and the requests it has pending, so that everything
/// belonging to a client can be released at once using
/// [release_client](Self::release_client).
///
/// Lock requests carry a notifier of type `N`, which is handed back in a
/// [Notice] once the request is settled.
pub struct LockUniverse<N> {
    max_pending: Option<usize>,
    idle_timeout: Duration,
    spaces: HashMap<Namespace, LockSpace<ClientRequest<N>>>,
    clients: HashMap<ClientId, ClientRecord>,
    wakeups: HashMap<Namespace, (Instant, Wakeup)>,
    schedule: BTreeSet<(Instant, Namespace)>,
    drains: HashSet<Namespace>,
    notices: Vec<Notice<N>>,
}

impl<N> fmt::Debug for LockUniverse<N> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LockUniverse")
            .field("spaces", &self.spaces.len())
            .field("clients", &self.clients.len())
            .field("max_pending", &self.max_pending)
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

impl<N> LockUniverse<N> {
    /// Creates an empty lock universe.
    ///
    /// Each namespace queues at most `max_pending` requests and is removed
    /// after being empty for `idle_timeout`.
    pub fn new(max_pending: Option<usize>, idle_timeout: Duration) -> Self {
        Self {
            max_pending,
            idle_timeout,
            spaces: HashMap::new(),
            clients: HashMap::new(),
            wakeups: HashMap::new(),
            schedule: BTreeSet::new(),
            drains: HashSet::new(),
            notices: Vec::new(),
        }
    }

    fn space_mut(&mut self, namespace: &Namespace) -> &mut LockSpace<ClientRequest<N>> {
        let max_pending = self.max_pending;
        self.spaces.entry(namespace.clone()).or_insert_with(|| LockSpace::new(max_pending))
    }

    fn client_mut(&mut self, client: &str) -> &mut ClientRecord {
        self.clients.entry(client.to_string()).or_default()
    }

    /// Atomically locks all resources for the client without waiting.
    pub fn try_lock(
        &mut self, client: &str, namespace: Namespace, resources: impl IntoIterator<Item = String>,
    ) -> bool {
        let resources: ResourceSet = resources.into_iter().collect();

        let acquired = self.space_mut(&namespace).try_lock(&resources);
        if acquired {
            let record = self.client_mut(client);
            for resource in resources {
                record.locked.insert(namespace.clone(), resource);
            }
        }

        self.refresh(&namespace);
        acquired
    }

    /// Requests a lock on all resources for the client.
    ///
    /// The outcome is reported through a [Notice] carrying `notify`, even if the
    /// request is settled immediately. Granted resources are recorded as owned by
    /// the client before the notice is issued.
    ///
    /// The returned request id is prefixed by the client id.
    pub fn lock(
        &mut self, client: &str, namespace: Namespace, resources: impl IntoIterator<Item = String>,
        timeout: Option<Duration>, notify: N,
    ) -> RequestId {
        let resources: ResourceSet = resources.into_iter().collect();
        let options = LockOptions { timeout, id_prefix: format!("{}_", client) };
        let payload = ClientRequest { client: client.to_string(), notify };

        let (id, settled) = self.space_mut(&namespace).lock(resources.clone(), &options, payload);
        match settled {
            Some(settled) => self.settle(&namespace, settled),
            None => {
                self.client_mut(client).requests.insert(namespace.clone(), id.clone(), resources);
            }
        }

        self.refresh(&namespace);
        id
    }

    /// Releases the resources owned by the client.
    ///
    /// Resources not owned by the client are left untouched.
    /// Returns `true` if all specified resources were owned by the client and locked.
    /// A single resource the client does not own makes the result `false`, even
    /// though the owned ones are still released.
    pub fn release(
        &mut self, client: &str, namespace: Namespace, resources: impl IntoIterator<Item = String>,
    ) -> bool {
        let requested: ResourceSet = resources.into_iter().collect();
        let owned: ResourceSet = match self.clients.get(client) {
            Some(record) => {
                requested.iter().filter(|r| record.locked.contains(&namespace, r.as_str())).cloned().collect()
            }
            None => ResourceSet::new(),
        };
        if owned.len() != requested.len() {
            log::debug!(
                "client {} released {} resources in {:?} it does not own",
                client,
                requested.len() - owned.len(),
                &namespace
            );
        }

        let space = self.space_mut(&namespace);
        let all_locked = space.release(&owned);
        let needs_drain = space.needs_drain();

        if let Some(record) = self.clients.get_mut(client) {
            for resource in &owned {
                record.locked.remove(&namespace, resource.as_str());
            }
        }

        if needs_drain {
            self.drains.insert(namespace.clone());
        }

        self.refresh(&namespace);
        all_locked && owned.len() == requested.len()
    }

    /// Aborts a pending request of the client.
    ///
    /// Returns `false` if the client has no such request pending.
    pub fn abort(&mut self, client: &str, namespace: Namespace, id: &str) -> bool {
        let tracked = match self.clients.get_mut(client) {
            Some(record) => record.requests.remove(&namespace, id).is_some(),
            None => false,
        };
        if !tracked {
            return false;
        }

        let settled = self.space_mut(&namespace).abort(id);
        let existed = settled.is_some();
        if let Some(settled) = settled {
            self.settle(&namespace, settled);
        }

        self.refresh(&namespace);
        existed
    }

    /// Aborts all pending requests and releases all resources of the client,
    /// then forgets about the client.
    pub fn release_client(&mut self, client: &str) {
        let Some(record) = self.clients.get(client) else { return };

        let requests: Vec<(Namespace, RequestId)> =
            record.requests.iter().map(|(namespace, id, _)| (namespace.clone(), id.clone())).collect();
        let owned: Vec<(Namespace, Vec<String>)> = record
            .locked
            .groups()
            .map(|(namespace, resources)| (namespace.clone(), resources.iter().cloned().collect()))
            .collect();
        log::debug!("releasing client {}: {} pending requests, {} namespaces", client, requests.len(), owned.len());

        for (namespace, id) in requests {
            self.abort(client, namespace, &id);
        }
        for (namespace, resources) in owned {
            self.release(client, namespace, resources);
        }

        self.clients.remove(client);
    }

    /// Records the outcome of a request and issues a notice.
    fn settle(&mut self, namespace: &Namespace, settled: Settled<ClientRequest<N>>) {
        let Settled { id, resources, result, payload: ClientRequest { client, notify } } = settled;

        if result.is_ok() {
            let record = self.client_mut(&client);
            for resource in resources {
                record.locked.insert(namespace.clone(), resource);
            }
            record.requests.remove(namespace, id.as_str());
        } else if let Some(record) = self.clients.get_mut(&client) {
            record.requests.remove(namespace, id.as_str());
        }

        match &result {
            Ok(()) => log::trace!("lock request {} in {:?} granted", &id, namespace),
            Err(err) => log::trace!("lock request {} in {:?} failed: {}", &id, namespace, err),
        }
        self.notices.push(Notice { client, namespace: namespace.clone(), request_id: id, result, notify });
    }

    /// Updates the timer of a namespace after it has been used.
    ///
    /// An empty namespace keeps an already armed collection timer.
    fn refresh(&mut self, namespace: &Namespace) {
        let current = self.wakeups.get(namespace).copied();
        let wakeup = match self.spaces.get(namespace) {
            Some(space) if space.is_empty() => match current {
                Some((at, Wakeup::Collect)) => Some((at, Wakeup::Collect)),
                _ => Some((Instant::now() + self.idle_timeout, Wakeup::Collect)),
            },
            Some(space) => space.next_deadline().map(|at| (at, Wakeup::Expire)),
            None => None,
        };
        if wakeup == current {
            return;
        }

        if let Some((at, _)) = self.wakeups.remove(namespace) {
            self.schedule.remove(&(at, namespace.clone()));
        }
        if let Some((at, kind)) = wakeup {
            self.schedule.insert((at, namespace.clone()));
            self.wakeups.insert(namespace.clone(), (at, kind));
        }
    }

    /// Instant of the next timer.
    ///
    /// [fire](Self::fire) must be called at this instant.
    pub fn next_wakeup(&self) -> Option<Instant> {
        self.schedule.first().map(|(at, _)| *at)
    }

    /// Processes all timers due at `now`.
    ///
    /// Pending requests past their deadline are rejected with [LockError::Timeout]
    /// and namespaces that stayed empty for the idle timeout are removed.
    pub fn fire(&mut self, now: Instant) {
        while let Some((at, namespace)) = self.schedule.first().cloned() {
            if at > now {
                break;
            }
            self.schedule.remove(&(at, namespace.clone()));
            let Some((_, kind)) = self.wakeups.remove(&namespace) else { continue };

            match kind {
                Wakeup::Collect if self.spaces.get(&namespace).map(LockSpace::is_empty).unwrap_or_default() => {
                    self.spaces.remove(&namespace);
                    log::debug!("collected idle namespace {:?}", &namespace);
                }
                Wakeup::Collect => self.refresh(&namespace),
                Wakeup::Expire => {
                    let expired = match self.spaces.get_mut(&namespace) {
                        Some(space) => space.expire(now),
                        None => Vec::new(),
                    };
                    for settled in expired {
                        self.settle(&namespace, settled);
                    }
                    self.refresh(&namespace);
                }
            }
        }
    }

    /// Whether queue drains scheduled by releases are outstanding.
    pub fn has_deferred(&self) -> bool {
        !self.drains.is_empty()
    }

    /// Runs the queue drains scheduled by releases.
    ///
    /// This must be called after the releasing operation has completed.
    pub fn run_deferred(&mut self) {
        for namespace in mem::take(&mut self.drains) {
            let granted = match self.spaces.get_mut(&namespace) {
                Some(space) if space.needs_drain() => space.drain(),
                _ => continue,
            };
            for settled in granted {
                self.settle(&namespace, settled);
            }
            self.refresh(&namespace);
        }
    }

    /// Takes all notices issued since the last call.
    pub fn take_notices(&mut self) -> Vec<Notice<N>> {
        mem::take(&mut self.notices)
    }

    /// Whether the namespace currently exists.
    pub fn has_namespace(&self, namespace: &Namespace) -> bool {
        self.spaces.contains_key(namespace)
    }

    /// Number of existing namespaces.
    pub fn namespace_count(&self) -> usize {
        self.spaces.len()
    }

    /// Whether the resource is locked in the namespace.
    pub fn is_locked(&self, namespace: &Namespace, resource: &str) -> bool {
        self.spaces.get(namespace).map(|space| space.is_locked(resource)).unwrap_or_default()
    }

    /// Number of pending requests in the namespace.
    pub fn pending_len(&self, namespace: &Namespace) -> usize {
        self.spaces.get(namespace).map(|space| space.pending_len()).unwrap_or_default()
    }

    /// Whether the client is known.
    pub fn has_client(&self, client: &str) -> bool {
        self.clients.contains_key(client)
    }

    /// Resources owned by the client in the namespace, sorted.
    pub fn owned(&self, client: &str, namespace: &Namespace) -> Vec<String> {
        let mut owned: Vec<String> = self
            .clients
            .get(client)
            .and_then(|record| record.locked.get(namespace))
            .map(|resources| resources.iter().cloned().collect())
            .unwrap_or_default();
        owned.sort();
        owned
    }

    /// Pending requests of the client.
    pub fn pending_requests(&self, client: &str) -> Vec<(Namespace, RequestId, ResourceSet)> {
        match self.clients.get(client) {
            Some(record) => record
                .requests
                .iter()
                .map(|(namespace, id, resources)| (namespace.clone(), id.clone(), resources.clone()))
                .collect(),
            None => Vec::new(),
        }
    }
}
