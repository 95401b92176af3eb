//! Client for a lock server.
//!
//! A [Client] owns a single TCP connection, which is served by a background task.
//! Operations may be issued concurrently from clones of the same client; the
//! connection task matches acknowledgements to operations by frame id and lock
//! outcomes to [pending locks](PendingLock) by namespace and request id.
//!
//! # Example
//!
//! ```no_run
//! use lockq::client::{Client, ClientCfg, ClientError};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), ClientError> {
//! let client = Client::connect("127.0.0.1:3000", ClientCfg::default()).await?;
//! let sum = client
//!     .locked(["account/1", "account/2"], Some(Duration::from_secs(5)), || async {
//!         // ... work on both accounts ...
//!         Ok::<_, ClientError>(3)
//!     })
//!     .await?;
//! # let _ = sum;
//! # Ok(())
//! # }
//! ```

use bytes::{Bytes, BytesMut};
use futures::{Sink, Stream};
use serde::Serialize;
use std::{collections::HashMap, error::Error, fmt, future::Future, io, mem, time::Duration};
use tokio::{
    net::{TcpStream, ToSocketAddrs},
    sync::{mpsc, oneshot},
};

use crate::{
    engine::{Namespace, RequestId},
    proto::{AbortArgs, Ack, AuthenticateArgs, Event, LockArgs, LockResponse, Op, Request, ResourcesArgs},
    transport::{self, TransportError},
};

/// Client configuration.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientCfg {
    /// Name of the client, shown in the server log.
    pub name: Option<String>,
    /// Token presented to the server for authentication.
    pub token: Option<String>,
    /// Namespace all operations act on.
    ///
    /// By default this is the default namespace.
    pub namespace: Namespace,
    /// Maximum length of a received protocol frame in bytes.
    ///
    /// By default this is 64 kB.
    pub max_frame_length: usize,
    #[doc(hidden)]
    pub _non_exhaustive: (),
}

impl Default for ClientCfg {
    fn default() -> Self {
        Self { name: None, token: None, namespace: None, max_frame_length: 65_536, _non_exhaustive: () }
    }
}

/// Client error.
#[derive(Debug)]
pub enum ClientError {
    /// An IO error occurred on the connection.
    Io(io::Error),
    /// A frame could not be encoded or decoded.
    Codec(serde_json::Error),
    /// The server refused the authentication token.
    Unauthorized(String),
    /// The server refused an operation.
    Rejected(String),
    /// A lock request was not granted.
    LockFailed(String),
    /// The connection to the server has been closed.
    Disconnected,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io error: {}", err),
            Self::Codec(err) => write!(f, "codec error: {}", err),
            Self::Unauthorized(msg) => write!(f, "unauthorized: {}", msg),
            Self::Rejected(msg) => write!(f, "operation rejected: {}", msg),
            Self::LockFailed(msg) => write!(f, "lock failed: {}", msg),
            Self::Disconnected => write!(f, "disconnected from lock server"),
        }
    }
}

impl Error for ClientError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Codec(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err)
    }
}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Io(err) => Self::Io(err),
            TransportError::Json(err) => Self::Codec(err),
        }
    }
}

/// Command handed to the connection task.
enum Command {
    /// Send an operation and report its acknowledgement.
    Call(Call),
    /// Abort a lock request whose outcome is no longer awaited.
    Abandon { namespace: Namespace, request_id: RequestId },
    /// Release resources of a granted lock that is no longer held by anyone.
    Release { namespace: Namespace, resources: Vec<String> },
}

struct Call {
    request: Request,
    reply_tx: oneshot::Sender<Ack>,
    /// For lock requests: receives the outcome once the request id is known.
    waiter: Option<LockWaiter>,
}

/// Receiver of the outcome of a lock request.
struct LockWaiter {
    namespace: Namespace,
    resources: Vec<String>,
    response_tx: oneshot::Sender<LockResponse>,
}

/// Operation sent to the server and waiting for its acknowledgement.
struct Outstanding {
    reply_tx: oneshot::Sender<Ack>,
    waiter: Option<LockWaiter>,
}

/// Client of a lock server.
///
/// Clones share the same connection.
/// The connection is closed when all clones and all [pending locks](PendingLock)
/// have been dropped.
#[derive(Clone)]
pub struct Client {
    tx: mpsc::UnboundedSender<Command>,
    namespace: Namespace,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Client").field("namespace", &self.namespace).field("closed", &self.tx.is_closed()).finish()
    }
}

/// A lock request that has been accepted by the server.
///
/// Dropping it before the outcome has been received aborts the request.
/// If the lock has been granted in the meantime, it is released.
#[must_use = "the outcome of a lock request should be awaited"]
pub struct PendingLock {
    request_id: RequestId,
    namespace: Namespace,
    resources: Vec<String>,
    response_rx: oneshot::Receiver<LockResponse>,
    tx: mpsc::UnboundedSender<Command>,
    settled: bool,
}

impl fmt::Debug for PendingLock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PendingLock").field("request_id", &self.request_id).finish()
    }
}

impl PendingLock {
    /// Id of the request, used to [abort](Client::abort) it.
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Waits until the lock is granted.
    ///
    /// Fails with [ClientError::LockFailed] if the request timed out, was
    /// aborted or was rejected by the server.
    pub async fn granted(mut self) -> Result<(), ClientError> {
        let response = (&mut self.response_rx).await;
        self.settled = true;
        let response = response.map_err(|_| ClientError::Disconnected)?;
        if response.success {
            Ok(())
        } else {
            Err(ClientError::LockFailed(response.message.unwrap_or_default()))
        }
    }
}

impl Drop for PendingLock {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        self.response_rx.close();
        let command = match self.response_rx.try_recv() {
            Ok(response) if response.success => {
                Command::Release { namespace: self.namespace.clone(), resources: mem::take(&mut self.resources) }
            }
            Ok(_) => return,
            Err(_) => Command::Abandon { namespace: self.namespace.clone(), request_id: self.request_id.clone() },
        };
        let _ = self.tx.send(command);
    }
}

/// Resources locked on behalf of [Client::locked].
///
/// Released when dropped before being disarmed.
struct HeldLock {
    tx: mpsc::UnboundedSender<Command>,
    namespace: Namespace,
    resources: Vec<String>,
}

impl HeldLock {
    fn disarm(mut self) -> Vec<String> {
        mem::take(&mut self.resources)
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        if !self.resources.is_empty() {
            let command =
                Command::Release { namespace: self.namespace.clone(), resources: mem::take(&mut self.resources) };
            let _ = self.tx.send(command);
        }
    }
}

impl Client {
    /// Connects to the lock server at the specified address and authenticates.
    pub async fn connect(addr: impl ToSocketAddrs, cfg: ClientCfg) -> Result<Self, ClientError> {
        let socket = TcpStream::connect(addr).await?;
        socket.set_nodelay(true)?;
        let (socket_rx, socket_tx) = socket.into_split();
        let mut stream = transport::reader(socket_rx, cfg.max_frame_length);
        let mut sink = transport::writer(socket_tx, cfg.max_frame_length);

        let auth = AuthenticateArgs { name: cfg.name.clone(), token: cfg.token.clone() };
        transport::send(&mut sink, &Request::new(Op::Authenticate, None, &auth)?).await?;
        loop {
            let frame = match transport::recv_frame(&mut stream).await {
                Some(frame) => frame?,
                None => return Err(ClientError::Disconnected),
            };
            match transport::decode::<Event>(&frame)? {
                Event::Authenticated => break,
                Event::Unauthorized { message } => return Err(ClientError::Unauthorized(message)),
                other => log::debug!("ignoring {:?} before authentication", other),
            }
        }
        log::debug!("connected to lock server as {:?}", &cfg.name);

        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection {
            sink,
            next_id: 0,
            outstanding: HashMap::new(),
            waiters: HashMap::new(),
            early: HashMap::new(),
        };
        tokio::spawn(async move {
            if let Err(err) = conn.run(stream, rx).await {
                log::debug!("lock server connection failed: {}", err);
            }
        });

        Ok(Self { tx, namespace: cfg.namespace })
    }

    /// Namespace the operations of this client act on.
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn call(&self, request: Request, waiter: Option<LockWaiter>) -> Result<Ack, ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(Command::Call(Call { request, reply_tx, waiter })).map_err(|_| ClientError::Disconnected)?;
        let ack = reply_rx.await.map_err(|_| ClientError::Disconnected)?;
        if !ack.success {
            return Err(ClientError::Rejected(ack.error.unwrap_or_default()));
        }
        Ok(ack)
    }

    fn resources_args<I>(&self, resources: I) -> ResourcesArgs
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let resources = resources.into_iter().map(Into::into).collect();
        ResourcesArgs { namespace: self.namespace.clone(), resources }
    }

    /// Atomically locks all resources if none of them is locked.
    ///
    /// Returns whether the lock was acquired.
    pub async fn try_lock<I>(&self, resources: I) -> Result<bool, ClientError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let request = Request::new(Op::TryLock, None, &self.resources_args(resources))?;
        let ack = self.call(request, None).await?;
        expect_field(ack.lock_acquired, "lockAcquired")
    }

    /// Requests a lock on all resources.
    ///
    /// The returned [PendingLock] resolves once the server has granted the lock
    /// or the timeout has elapsed. Dropping this future or the [PendingLock]
    /// abandons the request.
    pub async fn lock<I>(&self, resources: I, timeout: Option<Duration>) -> Result<PendingLock, ClientError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let ResourcesArgs { namespace, resources } = self.resources_args(resources);
        let timeout = timeout.map(|timeout| u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        let args = LockArgs { namespace: namespace.clone(), resources: resources.clone(), timeout };
        let request = Request::new(Op::Lock, None, &args)?;

        let (response_tx, response_rx) = oneshot::channel();
        let waiter = LockWaiter { namespace: namespace.clone(), resources: resources.clone(), response_tx };
        let ack = self.call(request, Some(waiter)).await?;
        let request_id = expect_field(ack.request_id, "requestId")?;

        Ok(PendingLock { request_id, namespace, resources, response_rx, tx: self.tx.clone(), settled: false })
    }

    /// Releases resources held by this client.
    ///
    /// Returns `true` if all resources were held by this client.
    pub async fn release<I>(&self, resources: I) -> Result<bool, ClientError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let request = Request::new(Op::Release, None, &self.resources_args(resources))?;
        let ack = self.call(request, None).await?;
        expect_field(ack.all_released_resources_were_locked, "allReleasedResourcesWereLocked")
    }

    /// Aborts a pending lock request of this client.
    ///
    /// Returns whether the request was still pending.
    pub async fn abort(&self, request_id: &RequestId) -> Result<bool, ClientError> {
        let args = AbortArgs { namespace: self.namespace.clone(), request_id: request_id.to_string() };
        let request = Request::new(Op::Abort, None, &args)?;
        let ack = self.call(request, None).await?;
        expect_field(ack.request_existed, "requestExisted")
    }

    /// Locks the resources, runs `f` and releases the resources afterwards.
    ///
    /// The resources are released regardless of the outcome of `f`, also when
    /// the returned future is dropped while waiting for the lock or running `f`.
    /// If both `f` and the release fail, the error of `f` is returned.
    pub async fn locked<I, F, Fut, T, E>(&self, resources: I, timeout: Option<Duration>, f: F) -> Result<T, E>
    where
        I: IntoIterator,
        I::Item: Into<String>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ClientError>,
    {
        let resources: Vec<String> = resources.into_iter().map(Into::into).collect();
        self.lock(resources.clone(), timeout).await?.granted().await?;
        let held = HeldLock { tx: self.tx.clone(), namespace: self.namespace.clone(), resources };

        let result = f().await;
        let released = self.release(held.disarm()).await;

        match (result, released) {
            (Err(err), _) => Err(err),
            (Ok(_), Err(err)) => Err(err.into()),
            (Ok(value), Ok(_)) => Ok(value),
        }
    }
}

fn expect_field<T>(value: Option<T>, name: &str) -> Result<T, ClientError> {
    value.ok_or_else(|| ClientError::Rejected(format!("acknowledgement lacks {}", name)))
}

/// Connection task state.
struct Connection<Write> {
    sink: Write,
    next_id: u64,
    outstanding: HashMap<u64, Outstanding>,
    waiters: HashMap<(Namespace, RequestId), LockWaiter>,
    /// Lock outcomes that arrived before their request was acknowledged.
    early: HashMap<(Namespace, RequestId), LockResponse>,
}

impl<Write> Connection<Write>
where
    Write: Sink<Bytes, Error = io::Error> + Unpin,
{
    async fn run<S>(mut self, mut stream: S, mut rx: mpsc::UnboundedReceiver<Command>) -> Result<(), TransportError>
    where
        S: Stream<Item = Result<BytesMut, io::Error>> + Unpin,
    {
        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Call(call)) => self.send(call).await?,
                    Some(Command::Abandon { namespace, request_id }) => self.abandon(namespace, request_id).await?,
                    Some(Command::Release { namespace, resources }) => self.release(namespace, resources).await?,
                    None => return Ok(()),
                },

                frame = transport::recv_frame(&mut stream) => match frame {
                    Some(frame) => self.handle_frame(&frame?).await?,
                    None => {
                        log::debug!("lock server closed connection");
                        return Ok(());
                    }
                },
            }
        }
    }

    async fn send(&mut self, call: Call) -> Result<(), TransportError> {
        let Call { mut request, reply_tx, waiter } = call;

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        request.id = Some(id);

        self.outstanding.insert(id, Outstanding { reply_tx, waiter });
        transport::send(&mut self.sink, &request).await
    }

    /// Sends an operation whose acknowledgement nobody waits for.
    async fn send_detached(&mut self, op: Op, args: &impl Serialize) -> Result<(), TransportError> {
        let (reply_tx, _) = oneshot::channel();
        let request = Request::new(op, None, args)?;
        self.send(Call { request, reply_tx, waiter: None }).await
    }

    async fn abandon(&mut self, namespace: Namespace, request_id: RequestId) -> Result<(), TransportError> {
        if !self.waiters.contains_key(&(namespace.clone(), request_id.clone())) {
            return Ok(());
        }

        log::debug!("aborting abandoned lock request {}", &request_id);
        let args = AbortArgs { namespace, request_id: request_id.to_string() };
        self.send_detached(Op::Abort, &args).await
    }

    async fn release(&mut self, namespace: Namespace, resources: Vec<String>) -> Result<(), TransportError> {
        log::debug!("releasing {} abandoned resources in {:?}", resources.len(), &namespace);
        self.send_detached(Op::Release, &ResourcesArgs { namespace, resources }).await
    }

    async fn handle_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let event: Event = match transport::decode(frame) {
            Ok(event) => event,
            Err(err) => {
                log::warn!("lock server sent invalid frame: {}", err);
                return Ok(());
            }
        };

        match event {
            Event::Ack(ack) => {
                let Some(Outstanding { reply_tx, waiter }) = self.outstanding.remove(&ack.id) else {
                    log::warn!("lock server acknowledged unknown frame {}", ack.id);
                    return Ok(());
                };
                if let (Some(waiter), Some(request_id)) = (waiter, ack.request_id.clone()) {
                    self.await_response(waiter, request_id).await?;
                }
                let _ = reply_tx.send(ack);
            }
            Event::LockResponse(response) => {
                let key = (response.namespace.clone(), response.request_id.clone());
                match self.waiters.remove(&key) {
                    Some(waiter) => self.deliver(waiter, response).await?,
                    None => {
                        self.early.insert(key, response);
                    }
                }
            }
            other => log::debug!("ignoring {:?}", other),
        }
        Ok(())
    }

    async fn await_response(&mut self, waiter: LockWaiter, request_id: RequestId) -> Result<(), TransportError> {
        let key = (waiter.namespace.clone(), request_id);
        if let Some(response) = self.early.remove(&key) {
            return self.deliver(waiter, response).await;
        }

        // The lock call was dropped before its acknowledgement arrived.
        let abandoned = waiter.response_tx.is_closed();
        self.waiters.insert(key.clone(), waiter);
        if abandoned {
            let (namespace, request_id) = key;
            self.abandon(namespace, request_id).await?;
        }
        Ok(())
    }

    /// Hands the outcome of a lock request to its waiter.
    ///
    /// A granted lock nobody waits for anymore is released.
    async fn deliver(&mut self, waiter: LockWaiter, response: LockResponse) -> Result<(), TransportError> {
        let LockWaiter { namespace, resources, response_tx } = waiter;
        match response_tx.send(response) {
            Err(response) if response.success => self.release(namespace, resources).await,
            _ => Ok(()),
        }
    }
}
