//! Lock broker running a [LockUniverse] on a single task.
//!
//! All operations are sent as commands to the broker task, which processes them
//! one after another. After each command or timer event the broker runs the
//! queue drains scheduled by releases and then delivers the outcomes of all
//! settled lock requests. Thus a lock outcome is never delivered before the
//! reply of the operation that caused it.

use futures::{future, FutureExt};
use std::{
    error::Error,
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{sleep_until, Instant},
};

use crate::{
    engine::{LockError, LockUniverse, Namespace, RequestId},
    Cfg,
};

/// Delivers the outcome of a lock request.
type Notify = oneshot::Sender<Result<(), LockError>>;

/// The broker task has terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerClosed;

impl fmt::Display for BrokerClosed {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "lock broker closed")
    }
}

impl Error for BrokerClosed {}

/// Command to the broker task.
enum Command {
    TryLock {
        client: String,
        namespace: Namespace,
        resources: Vec<String>,
        reply_tx: oneshot::Sender<bool>,
    },
    Lock {
        client: String,
        namespace: Namespace,
        resources: Vec<String>,
        timeout: Option<Duration>,
        notify: Notify,
        reply_tx: oneshot::Sender<RequestId>,
    },
    Release {
        client: String,
        namespace: Namespace,
        resources: Vec<String>,
        reply_tx: oneshot::Sender<bool>,
    },
    Abort {
        client: String,
        namespace: Namespace,
        request_id: String,
        reply_tx: oneshot::Sender<bool>,
    },
    ReleaseClient {
        client: String,
    },
}

/// Outcome of a lock request made through [Broker::lock].
///
/// Resolves exactly once, either when the lock is granted or when the request
/// is rejected, times out or is aborted.
#[must_use = "the outcome of a lock request should be awaited"]
pub struct Grant(oneshot::Receiver<Result<(), LockError>>);

impl fmt::Debug for Grant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Grant").finish()
    }
}

impl Future for Grant {
    type Output = Result<(), LockError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        self.0.poll_unpin(cx).map(|res| res.unwrap_or(Err(LockError::Terminated)))
    }
}

/// Handle to a lock broker.
///
/// Clones share the same broker.
/// The broker task terminates when all handles have been dropped.
#[derive(Clone)]
pub struct Broker {
    tx: mpsc::UnboundedSender<Command>,
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Broker").field("closed", &self.tx.is_closed()).finish()
    }
}

impl Broker {
    /// Spawns a new lock broker with the specified configuration.
    ///
    /// # Panics
    /// Panics if the configuration is invalid or when not called from within a Tokio runtime.
    pub fn new(cfg: &Cfg) -> Self {
        Self::spawn(cfg).0
    }

    /// Spawns a new lock broker and also returns the handle of its task.
    ///
    /// # Panics
    /// Panics if the configuration is invalid or when not called from within a Tokio runtime.
    pub fn spawn(cfg: &Cfg) -> (Self, JoinHandle<()>) {
        cfg.check();

        let universe = LockUniverse::new(cfg.max_pending, cfg.idle_timeout);
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(Self::run(universe, rx));

        (Self { tx }, task)
    }

    /// Event loop of the broker task.
    async fn run(mut universe: LockUniverse<Notify>, mut rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            let wakeup = universe.next_wakeup();

            tokio::select! {
                biased;

                () = Self::sleep_until_opt(wakeup) => universe.fire(Instant::now()),

                cmd = rx.recv() => match cmd {
                    Some(cmd) => Self::handle(&mut universe, cmd),
                    None => break,
                },
            }

            universe.run_deferred();
            for notice in universe.take_notices() {
                let _ = notice.notify.send(notice.result);
            }
        }

        log::debug!("lock broker terminated");
    }

    async fn sleep_until_opt(wakeup: Option<Instant>) {
        match wakeup {
            Some(at) => sleep_until(at).await,
            None => future::pending().await,
        }
    }

    fn handle(universe: &mut LockUniverse<Notify>, cmd: Command) {
        match cmd {
            Command::TryLock { client, namespace, resources, reply_tx } => {
                let _ = reply_tx.send(universe.try_lock(&client, namespace, resources));
            }
            Command::Lock { client, namespace, resources, timeout, notify, reply_tx } => {
                let _ = reply_tx.send(universe.lock(&client, namespace, resources, timeout, notify));
            }
            Command::Release { client, namespace, resources, reply_tx } => {
                let _ = reply_tx.send(universe.release(&client, namespace, resources));
            }
            Command::Abort { client, namespace, request_id, reply_tx } => {
                let _ = reply_tx.send(universe.abort(&client, namespace, &request_id));
            }
            Command::ReleaseClient { client } => universe.release_client(&client),
        }
    }

    fn send(&self, cmd: Command) -> Result<(), BrokerClosed> {
        self.tx.send(cmd).map_err(|_| BrokerClosed)
    }

    /// Atomically locks all resources for the client without waiting.
    ///
    /// Returns whether the lock was acquired.
    pub async fn try_lock(
        &self, client: &str, namespace: Namespace, resources: Vec<String>,
    ) -> Result<bool, BrokerClosed> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::TryLock { client: client.to_string(), namespace, resources, reply_tx })?;
        reply_rx.await.map_err(|_| BrokerClosed)
    }

    /// Requests a lock on all resources for the client.
    ///
    /// Returns the request id, which can be used to [abort](Self::abort) the request,
    /// and the [Grant] that resolves with the outcome of the request.
    pub async fn lock(
        &self, client: &str, namespace: Namespace, resources: Vec<String>, timeout: Option<Duration>,
    ) -> Result<(RequestId, Grant), BrokerClosed> {
        let (notify, grant_rx) = oneshot::channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Lock { client: client.to_string(), namespace, resources, timeout, notify, reply_tx })?;
        let id = reply_rx.await.map_err(|_| BrokerClosed)?;
        Ok((id, Grant(grant_rx)))
    }

    /// Releases resources owned by the client.
    ///
    /// Returns `true` if all resources were owned by the client and locked.
    pub async fn release(
        &self, client: &str, namespace: Namespace, resources: Vec<String>,
    ) -> Result<bool, BrokerClosed> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Release { client: client.to_string(), namespace, resources, reply_tx })?;
        reply_rx.await.map_err(|_| BrokerClosed)
    }

    /// Aborts a pending lock request of the client.
    ///
    /// Returns whether the request was pending.
    pub async fn abort(&self, client: &str, namespace: Namespace, request_id: &str) -> Result<bool, BrokerClosed> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Abort {
            client: client.to_string(),
            namespace,
            request_id: request_id.to_string(),
            reply_tx,
        })?;
        reply_rx.await.map_err(|_| BrokerClosed)
    }

    /// Aborts all pending requests and releases all resources of the client.
    pub fn release_client(&self, client: &str) -> Result<(), BrokerClosed> {
        self.send(Command::ReleaseClient { client: client.to_string() })
    }

    /// Whether the broker task has terminated.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
