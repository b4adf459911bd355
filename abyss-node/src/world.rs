//! World actors and the handles that talk to them.
//!
//! Each world runs as one task that owns its [`WorldCore`]. Handles send it commands; the task
//! performs the resulting actions and pushes events onto the world's queue.

use std::sync::Arc;

use abyss_core::world::Membership;
use abyss_core::{
    AbyssError, AbyssUrl, ContentHash, LeaveReason, Message, ObjectId, PeerId, RequestId,
    SharedObject, WorldAction, WorldCore, WorldEvent, WorldId, WorldRole,
};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::host::HostCommand;

type Reply<T> = oneshot::Sender<Result<T, AbyssError>>;

pub(crate) enum WorldInput {
    JoinRequest {
        peer: PeerId,
        session: WorldId,
    },
    Peer {
        peer: PeerId,
        msg: Message,
    },
    Disconnected(PeerId),
    Accept {
        request: RequestId,
        reply: Reply<()>,
    },
    Decline {
        request: RequestId,
        code: i32,
        text: String,
        reply: Reply<()>,
    },
    Append {
        target: Option<PeerId>,
        objects: Vec<SharedObject>,
        reply: Reply<()>,
    },
    Delete {
        target: Option<PeerId>,
        ids: Vec<ObjectId>,
        reply: Reply<()>,
    },
    Snapshot {
        reply: oneshot::Sender<WorldSnapshot>,
    },
    PeerHash {
        peer: PeerId,
        reply: Reply<ContentHash>,
    },
    Close {
        reply: Option<oneshot::Sender<()>>,
    },
}

/// Point-in-time view of a world's state.
#[derive(Debug, Clone, PartialEq)]
pub struct WorldSnapshot {
    pub hash: ContentHash,
    pub objects: Vec<SharedObject>,
    pub peers: Vec<(PeerId, ContentHash)>,
    pub pending_requests: usize,
}

/// Start the actor for `core`. `session` is the id the host routes incoming messages by.
pub(crate) fn spawn(
    core: WorldCore,
    initial: Vec<WorldAction>,
    url: AbyssUrl,
    host: mpsc::UnboundedSender<HostCommand>,
) -> (World, mpsc::UnboundedSender<WorldInput>) {
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let world = World {
        inner: Arc::new(WorldInner {
            id: core.id(),
            role: core.role(),
            url,
            input: input_tx.clone(),
            events: Mutex::new(event_rx),
        }),
    };
    let actor = WorldActor {
        core,
        host,
        events: event_tx,
    };
    tokio::spawn(actor.run(input_rx, initial));
    (world, input_tx)
}

struct WorldActor {
    core: WorldCore,
    host: mpsc::UnboundedSender<HostCommand>,
    events: mpsc::UnboundedSender<WorldEvent>,
}

impl WorldActor {
    async fn run(mut self, mut input: mpsc::UnboundedReceiver<WorldInput>, initial: Vec<WorldAction>) {
        let id = self.core.id();
        let mut done = self.perform(initial);
        while !done {
            let Some(cmd) = input.recv().await else {
                // Every handle and the host are gone.
                let actions = self.core.close();
                self.perform(actions);
                break;
            };
            done = self.handle(cmd);
        }
        tracing::debug!(world = %id, "world actor stopped");
        let _ = self.host.send(HostCommand::WorldTerminated { id });
    }

    /// Returns true once the world has terminated.
    fn handle(&mut self, cmd: WorldInput) -> bool {
        match cmd {
            WorldInput::JoinRequest { peer, session } => {
                let actions = self.core.on_join_request(peer, session);
                self.perform(actions)
            }
            WorldInput::Peer { peer, msg } => {
                let kind = msg.kind();
                match self.core.on_message(peer, msg) {
                    Ok(actions) => self.perform(actions),
                    Err(e) => {
                        tracing::debug!(world = %self.core.id(), %peer, kind, error = %e, "ignoring world message");
                        false
                    }
                }
            }
            WorldInput::Disconnected(peer) => {
                let actions = self.core.on_disconnect(peer);
                self.perform(actions)
            }
            WorldInput::Accept { request, reply } => {
                let result = self.core.accept(request).map_err(AbyssError::from);
                self.finish(result, reply)
            }
            WorldInput::Decline {
                request,
                code,
                text,
                reply,
            } => {
                let result = self
                    .core
                    .decline(request, code, &text)
                    .map_err(AbyssError::from);
                self.finish(result, reply)
            }
            WorldInput::Append {
                target,
                objects,
                reply,
            } => {
                let result = self
                    .core
                    .append_local(target, objects)
                    .map_err(AbyssError::from);
                self.finish(result, reply)
            }
            WorldInput::Delete { target, ids, reply } => {
                let result = self.core.delete_local(target, ids).map_err(AbyssError::from);
                self.finish(result, reply)
            }
            WorldInput::Snapshot { reply } => {
                let _ = reply.send(WorldSnapshot {
                    hash: self.core.hash(),
                    objects: self.core.objects().snapshot(),
                    peers: self.core.members(),
                    pending_requests: self.core.pending_requests(),
                });
                false
            }
            WorldInput::PeerHash { peer, reply } => {
                let hash = match self.core.membership(&peer) {
                    Some(Membership::Active) => self.core.peer_hash(&peer).ok_or(AbyssError::NotFound),
                    _ => Err(AbyssError::NotFound),
                };
                let _ = reply.send(hash);
                false
            }
            WorldInput::Close { reply } => {
                let actions = self.core.close();
                self.perform(actions);
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
                true
            }
        }
    }

    fn finish(&mut self, result: Result<Vec<WorldAction>, AbyssError>, reply: Reply<()>) -> bool {
        match result {
            Ok(actions) => {
                let done = self.perform(actions);
                let _ = reply.send(Ok(()));
                done
            }
            Err(e) => {
                let _ = reply.send(Err(e));
                false
            }
        }
    }

    fn perform(&mut self, actions: Vec<WorldAction>) -> bool {
        let mut terminated = false;
        for action in actions {
            match action {
                WorldAction::Send(peer, msg) => {
                    let _ = self.host.send(HostCommand::Send { peer, msg });
                }
                WorldAction::Emit(event) => {
                    let _ = self.events.send(event);
                }
                WorldAction::Terminate => terminated = true,
            }
        }
        terminated
    }
}

struct WorldInner {
    id: WorldId,
    role: WorldRole,
    url: AbyssUrl,
    input: mpsc::UnboundedSender<WorldInput>,
    events: Mutex<mpsc::UnboundedReceiver<WorldEvent>>,
}

impl Drop for WorldInner {
    fn drop(&mut self) {
        // Last handle released: leave gracefully.
        let _ = self.input.send(WorldInput::Close { reply: None });
    }
}

/// Handle to a hosted or joined world. Clones share one event queue.
#[derive(Clone)]
pub struct World {
    inner: Arc<WorldInner>,
}

/// One item from a world's event queue.
#[derive(Debug)]
pub enum Event {
    PeerRequest(WorldPeerRequest),
    PeerJoined(WorldPeer),
    PeerLeft(PeerLeave),
    ObjectsChanged(ObjectsChanged),
}

impl World {
    pub fn id(&self) -> WorldId {
        self.inner.id
    }

    pub fn url(&self) -> &AbyssUrl {
        &self.inner.url
    }

    pub fn role(&self) -> WorldRole {
        self.inner.role
    }

    pub fn is_hosting(&self) -> bool {
        self.inner.role == WorldRole::Hosting
    }

    /// Next event, in the order the world produced them. Fails with `WorldClosed` once the world
    /// has terminated and every queued event has been taken.
    pub async fn wait_event(&self) -> Result<Event, AbyssError> {
        let event = self
            .inner
            .events
            .lock()
            .await
            .recv()
            .await
            .ok_or(AbyssError::WorldClosed)?;
        let input = self.inner.input.clone();
        Ok(match event {
            WorldEvent::PeerRequest { request, peer } => Event::PeerRequest(WorldPeerRequest {
                request,
                peer,
                input,
            }),
            WorldEvent::PeerJoined { peer, .. } => Event::PeerJoined(WorldPeer { peer, input }),
            WorldEvent::PeerLeft { peer, reason } => Event::PeerLeft(PeerLeave { peer, reason }),
            WorldEvent::ObjectsChanged {
                peer,
                origin,
                added,
                removed,
            } => Event::ObjectsChanged(ObjectsChanged {
                peer: WorldPeer { peer, input },
                origin,
                added,
                removed,
            }),
        })
    }

    pub async fn snapshot(&self) -> Result<WorldSnapshot, AbyssError> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .input
            .send(WorldInput::Snapshot { reply })
            .map_err(|_| AbyssError::Closed)?;
        rx.await.map_err(|_| AbyssError::Closed)
    }

    pub async fn hash(&self) -> Result<ContentHash, AbyssError> {
        Ok(self.snapshot().await?.hash)
    }

    /// Append locally and send to every active peer (a member sends to its host only).
    pub async fn append_objects(&self, objects: Vec<SharedObject>) -> Result<(), AbyssError> {
        call(&self.inner.input, |reply| WorldInput::Append {
            target: None,
            objects,
            reply,
        })
        .await
    }

    pub async fn delete_objects(&self, ids: Vec<ObjectId>) -> Result<(), AbyssError> {
        call(&self.inner.input, |reply| WorldInput::Delete {
            target: None,
            ids,
            reply,
        })
        .await
    }

    /// Leave gracefully: peers get a leave notice with the final hash, pending requests are
    /// declined. Idempotent.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .inner
            .input
            .send(WorldInput::Close { reply: Some(reply) })
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("url", &self.inner.url.to_string())
            .finish()
    }
}

/// A pending join. Accept or decline it once.
#[derive(Clone)]
pub struct WorldPeerRequest {
    request: RequestId,
    peer: PeerId,
    input: mpsc::UnboundedSender<WorldInput>,
}

impl WorldPeerRequest {
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn id(&self) -> RequestId {
        self.request
    }

    /// Admit the requester. Fails with `NotFound` if the request was already resolved or the
    /// requester disconnected.
    pub async fn accept(&self) -> Result<WorldPeer, AbyssError> {
        let request = self.request;
        call(&self.input, |reply| WorldInput::Accept { request, reply }).await?;
        Ok(WorldPeer {
            peer: self.peer,
            input: self.input.clone(),
        })
    }

    /// Reject the requester; `code` and `text` reach it verbatim.
    pub async fn decline(&self, code: i32, text: &str) -> Result<(), AbyssError> {
        let request = self.request;
        let text = text.to_string();
        call(&self.input, |reply| WorldInput::Decline {
            request,
            code,
            text,
            reply,
        })
        .await
    }
}

impl std::fmt::Debug for WorldPeerRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WorldPeerRequest({}, {:?})", self.request, self.peer)
    }
}

/// An admitted peer of a world.
#[derive(Clone)]
pub struct WorldPeer {
    peer: PeerId,
    input: mpsc::UnboundedSender<WorldInput>,
}

impl WorldPeer {
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Hash the peer last reported. `NotFound` once it has left.
    pub async fn hash(&self) -> Result<ContentHash, AbyssError> {
        let peer = self.peer;
        let (reply, rx) = oneshot::channel();
        self.input
            .send(WorldInput::PeerHash { peer, reply })
            .map_err(|_| AbyssError::Closed)?;
        rx.await.map_err(|_| AbyssError::Closed)?
    }

    /// Append locally and send the batch to this peer only.
    pub async fn append_objects(&self, objects: Vec<SharedObject>) -> Result<(), AbyssError> {
        let target = Some(self.peer);
        call(&self.input, |reply| WorldInput::Append {
            target,
            objects,
            reply,
        })
        .await
    }

    pub async fn delete_objects(&self, ids: Vec<ObjectId>) -> Result<(), AbyssError> {
        let target = Some(self.peer);
        call(&self.input, |reply| WorldInput::Delete { target, ids, reply }).await
    }
}

impl std::fmt::Debug for WorldPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WorldPeer({:?})", self.peer)
    }
}

/// A departed peer and how it left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerLeave {
    pub peer: PeerId,
    pub reason: LeaveReason,
}

impl PeerLeave {
    pub fn is_graceful(&self) -> bool {
        matches!(self.reason, LeaveReason::Graceful { .. })
    }

    /// Hash bound into a graceful leave; `None` for a dropped connection.
    pub fn hash(&self) -> Option<ContentHash> {
        self.reason.hash()
    }
}

/// Objects a peer appended or deleted, as received.
#[derive(Debug, Clone)]
pub struct ObjectsChanged {
    pub peer: WorldPeer,
    pub origin: PeerId,
    pub added: Vec<SharedObject>,
    pub removed: Vec<ObjectId>,
}

async fn call(
    input: &mpsc::UnboundedSender<WorldInput>,
    build: impl FnOnce(Reply<()>) -> WorldInput,
) -> Result<(), AbyssError> {
    let (reply, rx) = oneshot::channel();
    input.send(build(reply)).map_err(|_| AbyssError::Closed)?;
    rx.await.map_err(|_| AbyssError::Closed)?
}
