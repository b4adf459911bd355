//! TCP transport: authenticated handshake, then encrypted frame pumps (one reader task, one writer
//! task per connection).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use abyss_core::identity::{
    auth_message, derive_session_keys, handshake_transcript, EphemeralKey, HelloParts, Role,
};
use abyss_core::wire::{decode_message, encode_frame, frame, frame_len, open_message, seal_message, LEN_SIZE};
use abyss_core::{AbyssError, ErrorQueue, Identity, Message, PeerId, PROTOCOL_VERSION};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Who opened the TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// A connection that finished the handshake and has its directional keys.
pub struct Established {
    pub peer: PeerId,
    pub remote: SocketAddr,
    pub direction: Direction,
    stream: TcpStream,
    send_key: [u8; 32],
    recv_key: [u8; 32],
}

impl Established {
    /// Peer id of the side that dialed.
    pub fn dialer(&self, local: PeerId) -> PeerId {
        match self.direction {
            Direction::Outbound => local,
            Direction::Inbound => self.peer,
        }
    }
}

impl std::fmt::Debug for Established {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Established")
            .field("peer", &self.peer)
            .field("remote", &self.remote)
            .field("direction", &self.direction)
            .finish()
    }
}

/// What the pumps report to the host.
#[derive(Debug)]
pub enum TransportEvent {
    Message { conn: u64, peer: PeerId, msg: Message },
    Closed { conn: u64, peer: PeerId },
}

#[derive(Debug, Clone, Copy)]
pub struct Liveness {
    pub keepalive: Duration,
    pub idle_timeout: Duration,
}

/// Running connection: queue messages on `outbound`; dropping it ends the writer.
pub struct ConnectionHandle {
    pub outbound: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
}

impl ConnectionHandle {
    /// Stop reading. Messages already queued on `outbound` are still written.
    pub fn abort_reader(&self) {
        self.reader.abort();
    }
}

/// Dial `addrs` in order and authenticate the first that answers. The peer must prove it owns
/// `expected`.
pub async fn connect(
    addrs: &[SocketAddr],
    identity: &Identity,
    expected: PeerId,
    handshake_timeout: Duration,
) -> Result<Established, AbyssError> {
    let mut last = AbyssError::Unreachable(format!("no address for {}", expected));
    for addr in addrs {
        let stream = match TcpStream::connect(addr).await {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!(%addr, error = %e, "dial failed");
                last = AbyssError::Unreachable(format!("{}: {}", addr, e));
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        return match tokio::time::timeout(
            handshake_timeout,
            handshake(stream, identity, Role::Dialer, Some(expected)),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(AbyssError::Timeout),
        };
    }
    Err(last)
}

/// Accept inbound connections until the listener fails or the task is aborted. Authenticated
/// connections go to `established`; failed handshakes go to the error queue.
pub async fn accept_loop(
    listener: TcpListener,
    identity: Arc<Identity>,
    handshake_timeout: Duration,
    established: mpsc::UnboundedSender<Established>,
    errors: ErrorQueue,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "listener failed");
                errors.push("accept", AbyssError::Unreachable(e.to_string()));
                break;
            }
        };
        let identity = identity.clone();
        let established = established.clone();
        let errors = errors.clone();
        tokio::spawn(async move {
            let _ = stream.set_nodelay(true);
            let result = tokio::time::timeout(
                handshake_timeout,
                handshake(stream, &identity, Role::Acceptor, None),
            )
            .await
            .unwrap_or(Err(AbyssError::Timeout));
            match result {
                Ok(conn) => {
                    tracing::debug!(peer = %conn.peer, %addr, "inbound connection authenticated");
                    let _ = established.send(conn);
                }
                Err(e) => {
                    tracing::warn!(%addr, error = %e, "inbound handshake failed");
                    errors.push("accept", e);
                }
            }
        });
    }
}

async fn handshake(
    mut stream: TcpStream,
    identity: &Identity,
    role: Role,
    expected: Option<PeerId>,
) -> Result<Established, AbyssError> {
    let remote = stream.peer_addr().map_err(handshake_io)?;
    let ephemeral = EphemeralKey::generate();
    let hello = Message::Hello {
        protocol_version: PROTOCOL_VERSION,
        public_key: identity.public_key().clone(),
        ephemeral: *ephemeral.public(),
    };

    // Dialer speaks first.
    let theirs = match role {
        Role::Dialer => {
            write_plain(&mut stream, &hello).await?;
            read_plain(&mut stream).await?
        }
        Role::Acceptor => {
            let theirs = read_plain(&mut stream).await?;
            write_plain(&mut stream, &hello).await?;
            theirs
        }
    };
    let (peer_key, peer_ephemeral) = match theirs {
        Message::Hello {
            protocol_version,
            public_key,
            ephemeral,
        } => {
            if protocol_version != PROTOCOL_VERSION {
                return Err(AbyssError::HandshakeFailed(format!(
                    "unsupported protocol version {}",
                    protocol_version
                )));
            }
            (public_key, ephemeral)
        }
        other => {
            return Err(AbyssError::HandshakeFailed(format!(
                "expected hello, got {}",
                other.kind()
            )))
        }
    };
    let peer = PeerId::from_public_key(peer_key.as_bytes());
    if let Some(expected) = expected {
        if peer != expected {
            return Err(AbyssError::HandshakeFailed(format!(
                "dialed {} but peer proved {}",
                expected, peer
            )));
        }
    }

    let ours = HelloParts {
        public_key: identity.public_key(),
        ephemeral: ephemeral.public(),
    };
    let theirs = HelloParts {
        public_key: &peer_key,
        ephemeral: &peer_ephemeral,
    };
    let (transcript, peer_role) = match role {
        Role::Dialer => (handshake_transcript(&ours, &theirs), Role::Acceptor),
        Role::Acceptor => (handshake_transcript(&theirs, &ours), Role::Dialer),
    };

    let auth = Message::Auth {
        signature: identity.sign(&auth_message(&transcript, role)),
    };
    write_plain(&mut stream, &auth).await?;
    match read_plain(&mut stream).await? {
        Message::Auth { signature } => peer_key
            .verify(&auth_message(&transcript, peer_role), &signature)
            .map_err(|e| AbyssError::HandshakeFailed(e.to_string()))?,
        other => {
            return Err(AbyssError::HandshakeFailed(format!(
                "expected auth, got {}",
                other.kind()
            )))
        }
    }

    let shared = ephemeral.agree(&peer_ephemeral);
    let (send_key, recv_key) = derive_session_keys(&shared, &transcript).split(role);
    Ok(Established {
        peer,
        remote,
        direction: match role {
            Role::Dialer => Direction::Outbound,
            Role::Acceptor => Direction::Inbound,
        },
        stream,
        send_key,
        recv_key,
    })
}

fn handshake_io(e: std::io::Error) -> AbyssError {
    AbyssError::HandshakeFailed(e.to_string())
}

async fn write_plain<W: AsyncWrite + Unpin>(w: &mut W, msg: &Message) -> Result<(), AbyssError> {
    let bytes = encode_frame(msg)?;
    w.write_all(&bytes).await.map_err(handshake_io)?;
    w.flush().await.map_err(handshake_io)
}

async fn read_plain<R: AsyncRead + Unpin>(r: &mut R) -> Result<Message, AbyssError> {
    let body = read_body(r).await.map_err(handshake_io)?;
    decode_message(&body).map_err(|e| AbyssError::HandshakeFailed(e.to_string()))
}

async fn read_body<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<Vec<u8>> {
    let mut header = [0u8; LEN_SIZE];
    r.read_exact(&mut header).await?;
    let len = frame_len(header)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    Ok(body)
}

/// Start the reader and writer tasks for an authenticated connection.
pub fn spawn_pumps(
    conn: Established,
    id: u64,
    events: mpsc::UnboundedSender<TransportEvent>,
    liveness: Liveness,
) -> ConnectionHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let (reader, writer) = conn.stream.into_split();
    let peer = conn.peer;
    tokio::spawn(run_writer(writer, conn.send_key, rx, liveness.keepalive, peer));
    let reader = tokio::spawn(run_reader(
        reader,
        conn.recv_key,
        id,
        peer,
        events,
        liveness.idle_timeout,
    ));
    ConnectionHandle {
        outbound: tx,
        reader,
    }
}

async fn run_writer(
    mut writer: OwnedWriteHalf,
    key: [u8; 32],
    mut rx: mpsc::UnboundedReceiver<Message>,
    keepalive: Duration,
    peer: PeerId,
) {
    let mut nonce: u64 = 0;
    loop {
        let msg = match tokio::time::timeout(keepalive, rx.recv()).await {
            Ok(Some(msg)) => msg,
            Ok(None) => break,
            Err(_) => Message::Heartbeat,
        };
        let framed = match seal_message(&key, nonce, &msg).and_then(|body| frame(&body)) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(%peer, kind = msg.kind(), error = %e, "dropping unsendable message");
                continue;
            }
        };
        nonce = nonce.wrapping_add(1);
        if let Err(e) = writer.write_all(&framed).await {
            tracing::debug!(%peer, error = %e, "write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn run_reader(
    mut reader: OwnedReadHalf,
    key: [u8; 32],
    id: u64,
    peer: PeerId,
    events: mpsc::UnboundedSender<TransportEvent>,
    idle_timeout: Duration,
) {
    let mut nonce: u64 = 0;
    loop {
        let body = match tokio::time::timeout(idle_timeout, read_body(&mut reader)).await {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => {
                tracing::debug!(%peer, error = %e, "connection read ended");
                break;
            }
            Err(_) => {
                tracing::info!(%peer, "connection idle timeout");
                break;
            }
        };
        let msg = match open_message(&key, nonce, &body) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "bad frame, closing connection");
                break;
            }
        };
        nonce = nonce.wrapping_add(1);
        if matches!(msg, Message::Heartbeat) {
            continue;
        }
        if events
            .send(TransportEvent::Message { conn: id, peer, msg })
            .is_err()
        {
            return;
        }
    }
    let _ = events.send(TransportEvent::Closed { conn: id, peer });
}
