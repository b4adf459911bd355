//! Host: one identity, one listener, its connections and its worlds.
//!
//! All host state lives in a single actor task. [`Host`] is a cheap handle that sends it commands;
//! the transport pumps and world actors report back through channels.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use abyss_core::{
    AbyssError, AbyssUrl, ErrorQueue, Identity, Message, ObjectSet, PathResolver, PeerId,
    WorldCore, WorldId,
};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::abyst::{self, AbystClient, AbystRequest, AbystResponse, AbystService, NotFoundService};
use crate::config::NodeConfig;
use crate::transport::{self, ConnectionHandle, Direction, Established, Liveness, TransportEvent};
use crate::world::{self, World, WorldInput};

type Reply<T> = oneshot::Sender<Result<T, AbyssError>>;

pub(crate) enum HostCommand {
    Dial {
        url: AbyssUrl,
        reply: Option<Reply<()>>,
    },
    DialDone {
        peer: PeerId,
        result: Result<Established, AbyssError>,
    },
    CloseConnection {
        peer: PeerId,
    },
    Connections {
        reply: oneshot::Sender<Vec<ConnectionInfo>>,
    },
    Send {
        peer: PeerId,
        msg: Message,
    },
    OpenWorld {
        path: String,
        reply: Reply<World>,
    },
    Join {
        url: AbyssUrl,
        session: WorldId,
        reply: Reply<World>,
    },
    CancelJoin {
        session: WorldId,
    },
    WorldTerminated {
        id: WorldId,
    },
    AbystRequest {
        peer: PeerId,
        session: u64,
        request: AbystRequest,
        reply: Reply<AbystResponse>,
    },
    AbystClose {
        peer: PeerId,
        session: u64,
    },
    /// (served sessions, client sessions) currently tracked.
    #[cfg(test)]
    AbystSessions {
        reply: oneshot::Sender<(usize, usize)>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Established,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub peer: PeerId,
    pub remote: Option<SocketAddr>,
    pub direction: Direction,
    pub state: ConnectionState,
}

/// Builds and starts a [`Host`].
pub struct HostBuilder {
    identity: Identity,
    resolver: Arc<PathResolver>,
    config: NodeConfig,
    errors: ErrorQueue,
    service: Arc<dyn AbystService>,
}

impl HostBuilder {
    pub fn new(identity: Identity, resolver: Arc<PathResolver>) -> Self {
        Self {
            identity,
            resolver,
            config: NodeConfig::default(),
            errors: ErrorQueue::new(),
            service: Arc::new(NotFoundService),
        }
    }

    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    /// Queue that receives this host's background failures.
    pub fn errors(mut self, errors: ErrorQueue) -> Self {
        self.errors = errors;
        self
    }

    /// Serving side for inbound abyst requests.
    pub fn service(mut self, service: Arc<dyn AbystService>) -> Self {
        self.service = service;
        self
    }

    /// Bind the listener and start the host actor. Must run inside a tokio runtime.
    pub async fn bind(self) -> Result<Host, AbyssError> {
        let listener = TcpListener::bind(self.config.listen_addr)
            .await
            .map_err(|e| AbyssError::Unreachable(format!("bind {}: {}", self.config.listen_addr, e)))?;
        let bound = listener
            .local_addr()
            .map_err(|e| AbyssError::Unreachable(e.to_string()))?;
        let addresses = if self.config.advertise_addrs.is_empty() {
            vec![advertised(bound)]
        } else {
            self.config.advertise_addrs.clone()
        };
        let identity = Arc::new(self.identity);
        let local_url = AbyssUrl::new(identity.peer_id(), addresses);

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (established_tx, established_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let listener_task = tokio::spawn(transport::accept_loop(
            listener,
            identity.clone(),
            self.config.handshake_timeout(),
            established_tx,
            self.errors.clone(),
        ));

        let shared = Arc::new(Shared {
            peer: identity.peer_id(),
            local_url: local_url.clone(),
            resolver: self.resolver.clone(),
            errors: self.errors.clone(),
            next_abyst_session: AtomicU64::new(1),
        });
        let actor = HostActor {
            identity,
            local_url,
            resolver: self.resolver,
            errors: self.errors,
            service: self.service,
            handshake_timeout: self.config.handshake_timeout(),
            liveness: Liveness {
                keepalive: self.config.keepalive_interval(),
                idle_timeout: self.config.idle_timeout(),
            },
            commands: commands.clone(),
            transport_tx,
            listener: listener_task,
            connections: HashMap::new(),
            next_conn: 1,
            known_addrs: HashMap::new(),
            dialing: HashMap::new(),
            worlds: HashMap::new(),
            joins: HashMap::new(),
            abyst_seq: HashMap::new(),
            abyst_pending: HashMap::new(),
            abyst_served: HashMap::new(),
        };
        tracing::info!(url = %shared.local_url, "host listening on {}", bound);
        tokio::spawn(actor.run(command_rx, established_rx, transport_rx));
        Ok(Host { shared, commands })
    }
}

/// An unspecified bind address is advertised as loopback.
fn advertised(bound: SocketAddr) -> SocketAddr {
    if bound.ip().is_unspecified() {
        let ip = match bound {
            SocketAddr::V4(_) => std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            SocketAddr::V6(_) => std::net::IpAddr::V6(std::net::Ipv6Addr::LOCALHOST),
        };
        SocketAddr::new(ip, bound.port())
    } else {
        bound
    }
}

struct Shared {
    peer: PeerId,
    local_url: AbyssUrl,
    resolver: Arc<PathResolver>,
    errors: ErrorQueue,
    next_abyst_session: AtomicU64,
}

/// Handle to a running host. Clones refer to the same host.
#[derive(Clone)]
pub struct Host {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<HostCommand>,
}

impl Host {
    pub fn peer_id(&self) -> PeerId {
        self.shared.peer
    }

    /// `abyss:<peer-hash>:<addresses>`.
    pub fn local_url(&self) -> &AbyssUrl {
        &self.shared.local_url
    }

    pub fn resolver(&self) -> &Arc<PathResolver> {
        &self.shared.resolver
    }

    pub fn errors(&self) -> &ErrorQueue {
        &self.shared.errors
    }

    fn send(&self, cmd: HostCommand) -> Result<(), AbyssError> {
        self.commands.send(cmd).map_err(|_| AbyssError::Closed)
    }

    /// Start connecting to `url` and return immediately; a failure lands in the error queue.
    pub fn open_outbound_connection(&self, url: &AbyssUrl) -> Result<(), AbyssError> {
        self.send(HostCommand::Dial {
            url: url.clone(),
            reply: None,
        })
    }

    /// Connect to `url`, waiting at most `timeout`. Succeeds at once if already connected.
    pub async fn connect(&self, url: &AbyssUrl, timeout: Duration) -> Result<(), AbyssError> {
        match tokio::time::timeout(timeout, self.dial(url)).await {
            Ok(result) => result,
            Err(_) => Err(AbyssError::Timeout),
        }
    }

    async fn dial(&self, url: &AbyssUrl) -> Result<(), AbyssError> {
        let (reply, rx) = oneshot::channel();
        self.send(HostCommand::Dial {
            url: url.clone(),
            reply: Some(reply),
        })?;
        rx.await.map_err(|_| AbyssError::Closed)?
    }

    /// Drop the connection to `peer`. Worlds on it see an abrupt leave.
    pub fn close_connection(&self, peer: PeerId) -> Result<(), AbyssError> {
        self.send(HostCommand::CloseConnection { peer })
    }

    pub async fn connections(&self) -> Result<Vec<ConnectionInfo>, AbyssError> {
        let (reply, rx) = oneshot::channel();
        self.send(HostCommand::Connections { reply })?;
        rx.await.map_err(|_| AbyssError::Closed)
    }

    /// Host a new world at `path`. The path is mapped in the resolver until the world closes.
    pub async fn open_world(&self, path: &str) -> Result<World, AbyssError> {
        let (reply, rx) = oneshot::channel();
        self.send(HostCommand::OpenWorld {
            path: path.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| AbyssError::Closed)?
    }

    /// Join the world at `url`. `Timeout` if the host could not be reached in time,
    /// `JoinTimeout` if it was reached but did not answer the join in time.
    pub async fn join_world(&self, url: &AbyssUrl, timeout: Duration) -> Result<World, AbyssError> {
        let deadline = tokio::time::Instant::now() + timeout;
        match tokio::time::timeout_at(deadline, self.dial(url)).await {
            Ok(result) => result?,
            Err(_) => return Err(AbyssError::Timeout),
        }
        let session = WorldId::generate();
        let (reply, rx) = oneshot::channel();
        self.send(HostCommand::Join {
            url: url.clone(),
            session,
            reply,
        })?;
        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AbyssError::Closed),
            Err(_) => {
                let _ = self.send(HostCommand::CancelJoin { session });
                Err(AbyssError::JoinTimeout)
            }
        }
    }

    /// Open an abyst session with the peer whose hash is `peer_hash`, connecting first if its
    /// address is known. `PeerUnknown` if it is neither connected nor known.
    pub async fn abyst_client(&self, peer_hash: &str, timeout: Duration) -> Result<AbystClient, AbyssError> {
        let peer: PeerId = peer_hash
            .parse()
            .map_err(|_| AbyssError::PeerUnknown(peer_hash.to_string()))?;
        self.connect(&AbyssUrl::new(peer, Vec::new()), timeout).await?;
        let session = self.shared.next_abyst_session.fetch_add(1, Ordering::Relaxed);
        Ok(AbystClient::new(peer, session, self.commands.clone()))
    }

    #[cfg(test)]
    async fn abyst_sessions(&self) -> (usize, usize) {
        let (reply, rx) = oneshot::channel();
        let _ = self.send(HostCommand::AbystSessions { reply });
        rx.await.unwrap_or_default()
    }

    /// Close every world gracefully, drop all connections and stop the actor.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(HostCommand::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Host({})", self.shared.local_url)
    }
}

struct Connection {
    id: u64,
    dialer: PeerId,
    remote: SocketAddr,
    direction: Direction,
    handle: ConnectionHandle,
}

struct WorldEntry {
    input: mpsc::UnboundedSender<WorldInput>,
    /// Resolver path, for hosted worlds.
    path: Option<String>,
}

struct PendingJoin {
    peer: PeerId,
    url: AbyssUrl,
    reply: Reply<World>,
}

struct HostActor {
    identity: Arc<Identity>,
    local_url: AbyssUrl,
    resolver: Arc<PathResolver>,
    errors: ErrorQueue,
    service: Arc<dyn AbystService>,
    handshake_timeout: Duration,
    liveness: Liveness,
    commands: mpsc::UnboundedSender<HostCommand>,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    listener: JoinHandle<()>,
    connections: HashMap<PeerId, Connection>,
    next_conn: u64,
    known_addrs: HashMap<PeerId, Vec<SocketAddr>>,
    dialing: HashMap<PeerId, Vec<Option<Reply<()>>>>,
    worlds: HashMap<WorldId, WorldEntry>,
    joins: HashMap<WorldId, PendingJoin>,
    abyst_seq: HashMap<(PeerId, u64), u64>,
    abyst_pending: HashMap<(PeerId, u64, u64), Reply<AbystResponse>>,
    abyst_served: HashMap<(PeerId, u64), mpsc::UnboundedSender<(u64, AbystRequest)>>,
}

impl HostActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<HostCommand>,
        mut established: mpsc::UnboundedReceiver<Established>,
        mut transport: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        loop {
            tokio::select! {
                Some(cmd) = commands.recv() => {
                    if let HostCommand::Shutdown { reply } = cmd {
                        self.shutdown(&mut commands).await;
                        let _ = reply.send(());
                        break;
                    }
                    self.on_command(cmd);
                }
                Some(conn) = established.recv() => self.on_established(conn),
                Some(event) = transport.recv() => self.on_transport(event),
                else => break,
            }
        }
        tracing::debug!(peer = %self.local_url.peer, "host actor stopped");
    }

    fn on_command(&mut self, cmd: HostCommand) {
        match cmd {
            HostCommand::Dial { url, reply } => self.dial(url, reply),
            HostCommand::DialDone { peer, result } => match result {
                Ok(conn) => self.on_established(conn),
                Err(e) => self.dial_failed(peer, e),
            },
            HostCommand::CloseConnection { peer } => {
                if let Some(conn) = self.connections.remove(&peer) {
                    tracing::info!(%peer, "closing connection");
                    conn.handle.abort_reader();
                    self.connection_lost(peer);
                }
            }
            HostCommand::Connections { reply } => {
                let mut out: Vec<ConnectionInfo> = self
                    .connections
                    .iter()
                    .map(|(peer, c)| ConnectionInfo {
                        peer: *peer,
                        remote: Some(c.remote),
                        direction: c.direction,
                        state: ConnectionState::Established,
                    })
                    .collect();
                out.extend(self.dialing.keys().map(|peer| ConnectionInfo {
                    peer: *peer,
                    remote: self.known_addrs.get(peer).and_then(|a| a.first().copied()),
                    direction: Direction::Outbound,
                    state: ConnectionState::Connecting,
                }));
                let _ = reply.send(out);
            }
            HostCommand::Send { peer, msg } => self.send_to(peer, msg),
            HostCommand::OpenWorld { path, reply } => {
                let path = abyss_core::path::normalize(&path);
                let id = self.resolver.set_mapping(&path);
                let url = self.local_url.with_path(&path);
                let core = WorldCore::hosting(id, self.identity.peer_id(), url.to_string());
                let (world, input) = world::spawn(core, Vec::new(), url, self.commands.clone());
                self.worlds.insert(
                    id,
                    WorldEntry {
                        input,
                        path: Some(path.clone()),
                    },
                );
                tracing::info!(world = %id, %path, "hosting world");
                let _ = reply.send(Ok(world));
            }
            HostCommand::Join {
                url,
                session,
                reply,
            } => {
                if !self.connections.contains_key(&url.peer) {
                    let _ = reply.send(Err(AbyssError::Closed));
                    return;
                }
                self.send_to(
                    url.peer,
                    Message::JoinRequest {
                        sender_session: session,
                        path: url.path.clone(),
                    },
                );
                tracing::debug!(%url, %session, "join requested");
                self.joins.insert(
                    session,
                    PendingJoin {
                        peer: url.peer,
                        url,
                        reply,
                    },
                );
            }
            HostCommand::CancelJoin { session } => {
                if self.joins.remove(&session).is_some() {
                    tracing::debug!(%session, "join abandoned");
                }
            }
            HostCommand::WorldTerminated { id } => {
                if let Some(entry) = self.worlds.remove(&id) {
                    if let Some(path) = entry.path {
                        self.resolver.delete_mapping_if(&path, id);
                    }
                    tracing::info!(world = %id, "world closed");
                }
            }
            HostCommand::AbystRequest {
                peer,
                session,
                request,
                reply,
            } => {
                if !self.connections.contains_key(&peer) {
                    let _ = reply.send(Err(AbyssError::Closed));
                    return;
                }
                let seq = self.abyst_seq.entry((peer, session)).or_insert(0);
                let this = *seq;
                *seq += 1;
                self.abyst_pending.insert((peer, session, this), reply);
                self.send_to(
                    peer,
                    Message::AbystRequest {
                        session,
                        seq: this,
                        method: request.method,
                        path: request.path,
                        body: request.body,
                    },
                );
            }
            HostCommand::AbystClose { peer, session } => {
                self.abyst_seq.remove(&(peer, session));
                let pending: Vec<(PeerId, u64, u64)> = self
                    .abyst_pending
                    .keys()
                    .filter(|(p, s, _)| *p == peer && *s == session)
                    .copied()
                    .collect();
                for key in pending {
                    if let Some(reply) = self.abyst_pending.remove(&key) {
                        let _ = reply.send(Err(AbyssError::Closed));
                    }
                }
                if self.connections.contains_key(&peer) {
                    self.send_to(peer, Message::AbystClose { session });
                }
            }
            #[cfg(test)]
            HostCommand::AbystSessions { reply } => {
                let _ = reply.send((self.abyst_served.len(), self.abyst_seq.len()));
            }
            HostCommand::Shutdown { reply } => {
                // Handled in run.
                let _ = reply.send(());
            }
        }
    }

    fn dial(&mut self, url: AbyssUrl, reply: Option<Reply<()>>) {
        let peer = url.peer;
        if peer == self.identity.peer_id() {
            let e = AbyssError::InvalidArgument("cannot connect to self".into());
            respond_or_queue(&self.errors, reply, Err(e), "connect");
            return;
        }
        if !url.addresses.is_empty() {
            self.known_addrs.insert(peer, url.addresses.clone());
        }
        if self.connections.contains_key(&peer) {
            respond_or_queue(&self.errors, reply, Ok(()), "connect");
            return;
        }
        if let Some(waiters) = self.dialing.get_mut(&peer) {
            waiters.push(reply);
            return;
        }
        let Some(addrs) = self.known_addrs.get(&peer).cloned() else {
            let e = AbyssError::PeerUnknown(peer.to_hash());
            respond_or_queue(&self.errors, reply, Err(e), "connect");
            return;
        };
        self.dialing.insert(peer, vec![reply]);
        let identity = self.identity.clone();
        let commands = self.commands.clone();
        let timeout = self.handshake_timeout;
        tracing::debug!(%peer, ?addrs, "dialing");
        tokio::spawn(async move {
            let result = transport::connect(&addrs, &identity, peer, timeout).await;
            let _ = commands.send(HostCommand::DialDone { peer, result });
        });
    }

    fn dial_failed(&mut self, peer: PeerId, error: AbyssError) {
        tracing::warn!(%peer, %error, "connect failed");
        let waiters = self.dialing.remove(&peer).unwrap_or_default();
        let mut delivered = false;
        for reply in waiters.into_iter().flatten() {
            delivered |= reply.send(Err(error.clone())).is_ok();
        }
        if !delivered {
            self.errors.push("connect", error);
        }
    }

    fn on_established(&mut self, conn: Established) {
        let peer = conn.peer;
        let dialer = conn.dialer(self.identity.peer_id());
        if let Some(existing) = self.connections.get(&peer) {
            // Simultaneous dials: both sides keep the connection dialed by the smaller id.
            let keep_new = existing.dialer == dialer || dialer < existing.dialer;
            if !keep_new {
                tracing::debug!(%peer, "dropping duplicate connection");
                self.finish_dial(peer);
                return;
            }
            if let Some(old) = self.connections.remove(&peer) {
                old.handle.abort_reader();
            }
        }
        let id = self.next_conn;
        self.next_conn += 1;
        let remote = conn.remote;
        let direction = conn.direction;
        let handle = transport::spawn_pumps(conn, id, self.transport_tx.clone(), self.liveness);
        tracing::info!(%peer, %remote, ?direction, "connection established");
        self.connections.insert(
            peer,
            Connection {
                id,
                dialer,
                remote,
                direction,
                handle,
            },
        );
        self.finish_dial(peer);
    }

    fn finish_dial(&mut self, peer: PeerId) {
        for reply in self.dialing.remove(&peer).unwrap_or_default().into_iter().flatten() {
            let _ = reply.send(Ok(()));
        }
    }

    fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message { conn, peer, msg } => {
                if self.connections.get(&peer).map(|c| c.id) != Some(conn) {
                    return;
                }
                self.on_message(peer, msg);
            }
            TransportEvent::Closed { conn, peer } => {
                if self.connections.get(&peer).map(|c| c.id) != Some(conn) {
                    return;
                }
                self.connections.remove(&peer);
                tracing::info!(%peer, "connection lost");
                self.connection_lost(peer);
            }
        }
    }

    fn connection_lost(&mut self, peer: PeerId) {
        for entry in self.worlds.values() {
            let _ = entry.input.send(WorldInput::Disconnected(peer));
        }
        let sessions: Vec<WorldId> = self
            .joins
            .iter()
            .filter(|(_, j)| j.peer == peer)
            .map(|(s, _)| *s)
            .collect();
        for session in sessions {
            if let Some(join) = self.joins.remove(&session) {
                let _ = join.reply.send(Err(AbyssError::Closed));
            }
        }
        let pending: Vec<(PeerId, u64, u64)> = self
            .abyst_pending
            .keys()
            .filter(|(p, _, _)| *p == peer)
            .copied()
            .collect();
        for key in pending {
            if let Some(reply) = self.abyst_pending.remove(&key) {
                let _ = reply.send(Err(AbyssError::Closed));
            }
        }
        self.abyst_seq.retain(|(p, _), _| *p != peer);
        self.abyst_served.retain(|(p, _), _| *p != peer);
    }

    fn send_to(&self, peer: PeerId, msg: Message) {
        match self.connections.get(&peer) {
            Some(conn) => {
                let _ = conn.handle.outbound.send(msg);
            }
            None => tracing::debug!(%peer, kind = msg.kind(), "no connection, dropping message"),
        }
    }

    fn on_message(&mut self, peer: PeerId, msg: Message) {
        match msg {
            Message::JoinRequest {
                sender_session,
                path,
            } => {
                let target = self
                    .resolver
                    .resolve(&path)
                    .filter(|id| matches!(self.worlds.get(id), Some(WorldEntry { path: Some(_), .. })));
                match target.and_then(|id| self.worlds.get(&id)) {
                    Some(entry) => {
                        let _ = entry.input.send(WorldInput::JoinRequest {
                            peer,
                            session: sender_session,
                        });
                    }
                    None => {
                        tracing::debug!(%peer, %path, "join for unknown world");
                        self.send_to(
                            peer,
                            Message::JoinDecline {
                                recver_session: sender_session,
                                code: abyss_core::world::DECLINE_NOT_FOUND,
                                text: "world not found".into(),
                            },
                        );
                    }
                }
            }
            Message::JoinAccept {
                recver_session,
                sender_session,
                world_url,
                objects,
                hash,
            } => {
                let join = match self.joins.remove(&recver_session) {
                    Some(join) if join.peer == peer => join,
                    other => {
                        if let Some(join) = other {
                            self.joins.insert(recver_session, join);
                        }
                        // Nobody is waiting: leave at once so the host does not keep a phantom.
                        tracing::debug!(%peer, session = %recver_session, "late join accept");
                        self.send_to(
                            peer,
                            Message::Leave {
                                recver_session: sender_session,
                                sender_session: recver_session,
                                hash: ObjectSet::new().hash(),
                            },
                        );
                        return;
                    }
                };
                let url = world_url.parse::<AbyssUrl>().unwrap_or(join.url);
                let (core, initial) = WorldCore::joined(
                    recver_session,
                    self.identity.peer_id(),
                    url.to_string(),
                    peer,
                    sender_session,
                    objects,
                    hash,
                );
                let (world, input) = world::spawn(core, initial, url, self.commands.clone());
                self.worlds.insert(recver_session, WorldEntry { input, path: None });
                tracing::info!(world = %recver_session, host = %peer, "joined world");
                // A caller that gave up drops the world, which leaves gracefully.
                let _ = join.reply.send(Ok(world));
            }
            Message::JoinDecline {
                recver_session,
                code,
                text,
            } => {
                if let Some(join) = self.joins.remove(&recver_session) {
                    tracing::info!(%peer, code, %text, "join declined");
                    let _ = join.reply.send(Err(AbyssError::JoinRejected {
                        code,
                        message: text,
                    }));
                }
            }
            msg @ (Message::Leave { .. } | Message::ObjectAppend { .. } | Message::ObjectDelete { .. }) => {
                let session = msg.recver_session();
                match session.and_then(|s| self.worlds.get(&s)) {
                    Some(entry) => {
                        let _ = entry.input.send(WorldInput::Peer { peer, msg });
                    }
                    None => tracing::debug!(%peer, kind = msg.kind(), "message for unknown world"),
                }
            }
            Message::AbystRequest {
                session,
                seq,
                method,
                path,
                body,
            } => {
                let service = self.service.clone();
                let commands = self.commands.clone();
                let server = self
                    .abyst_served
                    .entry((peer, session))
                    .or_insert_with(|| abyst::spawn_session(peer, session, service, commands));
                let _ = server.send((seq, AbystRequest { method, path, body }));
            }
            Message::AbystResponse {
                session,
                seq,
                status,
                headers,
                body,
            } => match self.abyst_pending.remove(&(peer, session, seq)) {
                Some(reply) => {
                    let _ = reply.send(Ok(AbystResponse {
                        status,
                        headers,
                        body,
                    }));
                }
                None => tracing::debug!(%peer, session, seq, "unmatched abyst response"),
            },
            Message::AbystClose { session } => {
                // Dropping the sender ends the server task once its queue is drained.
                if self.abyst_served.remove(&(peer, session)).is_some() {
                    tracing::debug!(%peer, session, "abyst session closed");
                }
            }
            Message::Hello { .. } | Message::Auth { .. } | Message::Heartbeat => {
                tracing::warn!(%peer, kind = msg.kind(), "handshake message on live connection");
            }
        }
    }

    async fn shutdown(&mut self, commands: &mut mpsc::UnboundedReceiver<HostCommand>) {
        self.listener.abort();
        let mut closing = Vec::new();
        for entry in self.worlds.values() {
            let (reply, rx) = oneshot::channel();
            if entry.input.send(WorldInput::Close { reply: Some(reply) }).is_ok() {
                closing.push(rx);
            }
        }
        for rx in closing {
            let _ = rx.await;
        }
        // Flush what the worlds queued on their way out (leave notices, declines).
        while let Ok(cmd) = commands.try_recv() {
            match cmd {
                HostCommand::Send { peer, msg } => self.send_to(peer, msg),
                HostCommand::WorldTerminated { id } => self.on_command(HostCommand::WorldTerminated { id }),
                _ => {}
            }
        }
        for (_, join) in self.joins.drain() {
            let _ = join.reply.send(Err(AbyssError::Closed));
        }
        for (_, conn) in self.connections.drain() {
            conn.handle.abort_reader();
        }
        for (_, waiters) in self.dialing.drain() {
            for reply in waiters.into_iter().flatten() {
                let _ = reply.send(Err(AbyssError::Closed));
            }
        }
        tracing::info!(url = %self.local_url, "host shut down");
    }
}

fn respond_or_queue(
    errors: &ErrorQueue,
    reply: Option<Reply<()>>,
    result: Result<(), AbyssError>,
    context: &'static str,
) {
    match reply {
        Some(reply) => {
            if let Err(Err(e)) = reply.send(result) {
                errors.push(context, e);
            }
        }
        None => {
            if let Err(e) = result {
                errors.push(context, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> NodeConfig {
        NodeConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            ..NodeConfig::default()
        }
    }

    async fn host() -> Host {
        HostBuilder::new(Identity::generate(), Arc::new(PathResolver::new()))
            .config(loopback())
            .bind()
            .await
            .unwrap()
    }

    #[test]
    fn unspecified_bind_advertises_loopback() {
        let addr = advertised("0.0.0.0:1605".parse().unwrap());
        assert_eq!(addr, "127.0.0.1:1605".parse().unwrap());
        let addr = advertised("10.1.2.3:7".parse().unwrap());
        assert_eq!(addr, "10.1.2.3:7".parse().unwrap());
    }

    #[tokio::test]
    async fn local_url_names_identity_and_address() {
        let h = host().await;
        let url = h.local_url();
        assert_eq!(url.peer, h.peer_id());
        assert_eq!(url.addresses.len(), 1);
        assert!(url.addresses[0].ip().is_loopback());
        h.shutdown().await;
    }

    #[tokio::test]
    async fn open_world_maps_path_until_closed() {
        let h = host().await;
        let world = h.open_world("rooms/1").await.unwrap();
        assert_eq!(world.url().path, "/rooms/1");
        assert_eq!(h.resolver().resolve("/rooms/1"), Some(world.id()));
        world.close().await;
        // The actor processes the termination after the close reply.
        for _ in 0..50 {
            if h.resolver().resolve("/rooms/1").is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.resolver().resolve("/rooms/1"), None);
        h.shutdown().await;
    }

    #[tokio::test]
    async fn connect_to_self_rejected() {
        let h = host().await;
        let err = h
            .connect(&h.local_url().clone(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AbyssError::InvalidArgument(_)));
        h.shutdown().await;
    }

    #[tokio::test]
    async fn abyst_client_for_unknown_peer() {
        let h = host().await;
        let stranger = Identity::generate().peer_id().to_hash();
        let err = h.abyst_client(&stranger, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, AbyssError::PeerUnknown(stranger));
        let err = h.abyst_client("not-a-hash", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, AbyssError::PeerUnknown(_)));
        h.shutdown().await;
    }

    #[tokio::test]
    async fn dropped_abyst_client_releases_both_ends() {
        let a = host().await;
        let b = host().await;
        b.connect(a.local_url(), Duration::from_secs(2)).await.unwrap();
        let hash = a.peer_id().to_hash();
        let client = b.abyst_client(&hash, Duration::from_secs(2)).await.unwrap();
        let copy = client.clone();
        assert_eq!(client.get("/x").await.unwrap().status, 404);
        assert_eq!(a.abyst_sessions().await, (1, 0));
        assert_eq!(b.abyst_sessions().await, (0, 1));

        drop(client);
        // One clone is still alive.
        assert_eq!(b.abyst_sessions().await, (0, 1));
        drop(copy);
        assert_eq!(b.abyst_sessions().await, (0, 0));
        let mut served = 1;
        for _ in 0..100 {
            served = a.abyst_sessions().await.0;
            if served == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(served, 0);

        // A fresh session on the same connection still works.
        let again = b.abyst_client(&hash, Duration::from_secs(2)).await.unwrap();
        assert_eq!(again.get("/y").await.unwrap().status, 404);
        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn commands_after_shutdown_are_closed() {
        let h = host().await;
        h.shutdown().await;
        assert_eq!(h.open_world("/x").await.unwrap_err(), AbyssError::Closed);
        assert_eq!(h.connections().await.unwrap_err(), AbyssError::Closed);
    }
}
