use bytes::{Bytes, BytesMut};
use futures::{future::BoxFuture, stream::FuturesUnordered, FutureExt, Sink, Stream, StreamExt};
use serde_json::{Map, Value};
use std::{error::Error, fmt, io, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    time::sleep,
};
use uuid::Uuid;

use crate::{
    broker::{Broker, BrokerClosed},
    engine::{ClientId, LockError, Namespace, RequestId},
    proto::{self, AbortArgs, Ack, AuthenticateArgs, Event, LockArgs, LockResponse, Op, Request, ResourcesArgs},
    transport::{self, TransportError},
    Cfg,
};

/// Message sent when authentication fails.
const INVALID_TOKEN: &str = "Invalid token.";

/// Outcome of a lock request made by the session.
type PendingGrant = BoxFuture<'static, (Namespace, RequestId, Result<(), LockError>)>;

/// Reason for terminating a session.
#[derive(Debug)]
enum SessionError {
    Transport(TransportError),
    BrokerClosed,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Transport(err) => write!(f, "{}", err),
            Self::BrokerClosed => write!(f, "lock broker closed"),
        }
    }
}

impl Error for SessionError {}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err)
    }
}

impl From<BrokerClosed> for SessionError {
    fn from(_: BrokerClosed) -> Self {
        Self::BrokerClosed
    }
}

/// State of a client connection.
struct Session<Write> {
    client: ClientId,
    name: Option<String>,
    authenticated: bool,
    broker: Broker,
    cfg: Arc<Cfg>,
    sink: Write,
    grants: FuturesUnordered<PendingGrant>,
}

/// Serves a client connection until it is closed.
///
/// All resources of the client are released when the connection ends.
pub(crate) async fn serve<Read, Write>(broker: Broker, cfg: Arc<Cfg>, input: Read, output: Write, peer: String)
where
    Read: AsyncRead + Unpin,
    Write: AsyncWrite + Unpin,
{
    let client = Uuid::new_v4().to_string();
    log::info!("client {} connected from {}", &client, &peer);

    let mut stream = transport::reader(input, cfg.max_frame_length);
    let sink = transport::writer(output, cfg.max_frame_length);
    let authenticated = cfg.token.is_none();
    let mut session =
        Session { client, name: None, authenticated, broker, cfg, sink, grants: FuturesUnordered::new() };

    match session.run(&mut stream).await {
        Ok(()) => log::info!("client {} disconnected", &session.client),
        Err(err) => log::info!("client {} disconnected: {}", &session.client, err),
    }

    let _ = session.broker.release_client(&session.client);
}

impl<Write> Session<Write>
where
    Write: Sink<Bytes, Error = io::Error> + Unpin,
{
    async fn run<S>(&mut self, stream: &mut S) -> Result<(), SessionError>
    where
        S: Stream<Item = Result<BytesMut, io::Error>> + Unpin,
    {
        let auth_timeout = sleep(self.cfg.auth_timeout);
        tokio::pin!(auth_timeout);

        loop {
            tokio::select! {
                () = &mut auth_timeout, if !self.authenticated => {
                    log::info!("disconnecting unauthenticated client {}", &self.client);
                    return Ok(());
                }

                Some((namespace, request_id, result)) = self.grants.next(), if !self.grants.is_empty() => {
                    let response = LockResponse {
                        success: result.is_ok(),
                        namespace,
                        request_id,
                        message: result.err().map(|err| err.to_string()),
                    };
                    self.send(&Event::LockResponse(response)).await?;
                }

                frame = transport::recv_frame(stream) => match frame {
                    Some(Ok(frame)) => self.handle_frame(&frame).await?,
                    Some(Err(err)) => return Err(err.into()),
                    None => return Ok(()),
                },
            }
        }
    }

    async fn send(&mut self, event: &Event) -> Result<(), SessionError> {
        transport::send(&mut self.sink, event).await?;
        Ok(())
    }

    async fn handle_frame(&mut self, frame: &[u8]) -> Result<(), SessionError> {
        let Request { op, id, args } = match transport::decode::<Request>(frame) {
            Ok(request) => request,
            Err(err) => {
                log::warn!("client {} sent invalid frame: {}", &self.client, err);
                return Ok(());
            }
        };

        let ack = match (op, id) {
            (Op::Authenticate, _) => return self.authenticate(args).await,
            (op, _) if !self.authenticated => {
                log::trace!("dropping {} from unauthenticated client {}", op, &self.client);
                return Ok(());
            }
            (op, None) => {
                log::warn!("client {} sent {} without id", &self.client, op);
                return Ok(());
            }
            (Op::TryLock, Some(id)) => self.try_lock(id, args).await?,
            (Op::Lock, Some(id)) => self.lock(id, args).await?,
            (Op::Release, Some(id)) => self.release(id, args).await?,
            (Op::Abort, Some(id)) => self.abort(id, args).await?,
        };
        self.send(&Event::Ack(ack)).await
    }

    async fn authenticate(&mut self, args: Map<String, Value>) -> Result<(), SessionError> {
        let AuthenticateArgs { name, token } = proto::validate(args).unwrap_or_default();
        if let Some(name) = name {
            log::info!("client {} registered as \"{}\"", &self.client, &name);
            self.name = Some(name);
        }
        let authorized = match &self.cfg.token {
            Some(expected) => token.as_ref() == Some(expected),
            None => true,
        };
        let name = self.name.clone().unwrap_or_else(|| "no name".to_string());

        if authorized {
            log::info!("client {} - \"{}\" authenticated", &self.client, name);
            self.authenticated = true;
            self.send(&Event::Authenticated).await
        } else {
            log::warn!("client {} - \"{}\" is unauthorized", &self.client, name);
            self.send(&Event::Unauthorized { message: INVALID_TOKEN.to_string() }).await
        }
    }

    async fn try_lock(&mut self, id: u64, args: Map<String, Value>) -> Result<Ack, BrokerClosed> {
        let ResourcesArgs { namespace, resources } = match proto::validate(args) {
            Ok(args) => args,
            Err(err) => return Ok(Ack::error(id, err)),
        };
        let acquired = self.broker.try_lock(&self.client, namespace, resources).await?;
        Ok(Ack::lock_acquired(id, acquired))
    }

    async fn lock(&mut self, id: u64, args: Map<String, Value>) -> Result<Ack, BrokerClosed> {
        let LockArgs { namespace, resources, timeout } = match proto::validate(args) {
            Ok(args) => args,
            Err(err) => return Ok(Ack::error(id, err)),
        };
        let timeout = timeout.map(Duration::from_millis);
        let (request_id, grant) = self.broker.lock(&self.client, namespace.clone(), resources, timeout).await?;

        let response_id = request_id.clone();
        self.grants.push(async move { (namespace, response_id, grant.await) }.boxed());

        Ok(Ack::request_id(id, request_id))
    }

    async fn release(&mut self, id: u64, args: Map<String, Value>) -> Result<Ack, BrokerClosed> {
        let ResourcesArgs { namespace, resources } = match proto::validate(args) {
            Ok(args) => args,
            Err(err) => return Ok(Ack::error(id, err)),
        };
        let all_locked = self.broker.release(&self.client, namespace, resources).await?;
        Ok(Ack::released(id, all_locked))
    }

    async fn abort(&mut self, id: u64, args: Map<String, Value>) -> Result<Ack, BrokerClosed> {
        let AbortArgs { namespace, request_id } = match proto::validate(args) {
            Ok(args) => args,
            Err(err) => return Ok(Ack::error(id, err)),
        };
        let existed = self.broker.abort(&self.client, namespace, &request_id).await?;
        Ok(Ack::request_existed(id, existed))
    }
}
