//! World membership and object sync, host-driven: the node passes peer messages and local commands
//! in, the world returns actions (messages to send, events to surface, termination).
//!
//! Topology is a star. The hosting world admits members and relays every batch it receives to all
//! other members; a member talks only to its host.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AbyssError;
use crate::identity::PeerId;
use crate::objects::{ContentHash, ObjectId, ObjectSet, SharedObject};
use crate::protocol::Message;

/// Decline code sent when a world is closed with requests still pending.
pub const DECLINE_WORLD_CLOSED: i32 = 503;
/// Decline code for a join from a peer that is already a member.
pub const DECLINE_ALREADY_JOINED: i32 = 409;
/// Decline code when the requested path maps to no hosted world.
pub const DECLINE_NOT_FOUND: i32 = 404;

/// World session id. Each side of a membership has its own.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorldId(Uuid);

impl WorldId {
    pub fn generate() -> Self {
        WorldId(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        WorldId(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for WorldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for WorldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorldId({})", self.0)
    }
}

/// Identifies one pending join within a world.
pub type RequestId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorldRole {
    Hosting,
    Member { host: PeerId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Pending,
    Active,
}

/// Why a peer left. Only a graceful leave carries the hash the peer held when it left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    Graceful { hash: ContentHash },
    Abrupt,
}

impl LeaveReason {
    pub fn hash(&self) -> Option<ContentHash> {
        match self {
            LeaveReason::Graceful { hash } => Some(*hash),
            LeaveReason::Abrupt => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorldEvent {
    PeerRequest {
        request: RequestId,
        peer: PeerId,
    },
    PeerJoined {
        peer: PeerId,
        hash: ContentHash,
    },
    PeerLeft {
        peer: PeerId,
        reason: LeaveReason,
    },
    /// `peer` delivered the batch; `origin` authored it.
    ObjectsChanged {
        peer: PeerId,
        origin: PeerId,
        added: Vec<SharedObject>,
        removed: Vec<ObjectId>,
    },
}

/// Action for the node to perform, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum WorldAction {
    Send(PeerId, Message),
    Emit(WorldEvent),
    /// The world is over; drop it and close its event queue.
    Terminate,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorldError {
    #[error("no such pending request")]
    UnknownRequest,
    #[error("peer is not a member of this world")]
    UnknownPeer,
    #[error("world is terminated")]
    Terminated,
}

impl From<WorldError> for AbyssError {
    fn from(e: WorldError) -> Self {
        match e {
            WorldError::UnknownRequest | WorldError::UnknownPeer => AbyssError::NotFound,
            WorldError::Terminated => AbyssError::WorldClosed,
        }
    }
}

struct Member {
    session: WorldId,
    hash: ContentHash,
}

struct PendingJoin {
    peer: PeerId,
    session: WorldId,
}

/// State of one world on one node.
pub struct WorldCore {
    id: WorldId,
    local: PeerId,
    url: String,
    role: WorldRole,
    objects: ObjectSet,
    members: BTreeMap<PeerId, Member>,
    requests: BTreeMap<RequestId, PendingJoin>,
    next_request: RequestId,
    terminated: bool,
}

impl WorldCore {
    /// A world this node hosts, starting empty.
    pub fn hosting(id: WorldId, local: PeerId, url: String) -> Self {
        Self {
            id,
            local,
            url,
            role: WorldRole::Hosting,
            objects: ObjectSet::new(),
            members: BTreeMap::new(),
            requests: BTreeMap::new(),
            next_request: 1,
            terminated: false,
        }
    }

    /// A world joined through `host`'s accept: applies the snapshot and reports the host as the
    /// first peer.
    pub fn joined(
        id: WorldId,
        local: PeerId,
        url: String,
        host: PeerId,
        host_session: WorldId,
        snapshot: Vec<SharedObject>,
        host_hash: ContentHash,
    ) -> (Self, Vec<WorldAction>) {
        let mut world = Self {
            id,
            local,
            url,
            role: WorldRole::Member { host },
            objects: ObjectSet::from_objects(&snapshot),
            members: BTreeMap::new(),
            requests: BTreeMap::new(),
            next_request: 1,
            terminated: false,
        };
        world.members.insert(
            host,
            Member {
                session: host_session,
                hash: host_hash,
            },
        );
        if !world.objects.verify(&host_hash) {
            tracing::warn!(world = %id, host = %host, "join snapshot does not match host hash");
        }
        let mut actions = vec![WorldAction::Emit(WorldEvent::PeerJoined {
            peer: host,
            hash: host_hash,
        })];
        if !snapshot.is_empty() {
            actions.push(WorldAction::Emit(WorldEvent::ObjectsChanged {
                peer: host,
                origin: host,
                added: snapshot,
                removed: Vec::new(),
            }));
        }
        (world, actions)
    }

    pub fn id(&self) -> WorldId {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn role(&self) -> WorldRole {
        self.role
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn hash(&self) -> ContentHash {
        self.objects.hash()
    }

    pub fn objects(&self) -> &ObjectSet {
        &self.objects
    }

    /// Active members and the hash each last reported.
    pub fn members(&self) -> Vec<(PeerId, ContentHash)> {
        self.members.iter().map(|(p, m)| (*p, m.hash)).collect()
    }

    pub fn peer_hash(&self, peer: &PeerId) -> Option<ContentHash> {
        self.members.get(peer).map(|m| m.hash)
    }

    pub fn membership(&self, peer: &PeerId) -> Option<Membership> {
        if self.members.contains_key(peer) {
            Some(Membership::Active)
        } else if self.requests.values().any(|r| r.peer == *peer) {
            Some(Membership::Pending)
        } else {
            None
        }
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    /// Inbound join request routed to this world.
    pub fn on_join_request(&mut self, peer: PeerId, session: WorldId) -> Vec<WorldAction> {
        let decline = |code: i32, text: &str| {
            vec![WorldAction::Send(
                peer,
                Message::JoinDecline {
                    recver_session: session,
                    code,
                    text: text.to_string(),
                },
            )]
        };
        if self.terminated {
            return decline(DECLINE_WORLD_CLOSED, "world closed");
        }
        if self.role != WorldRole::Hosting {
            return decline(DECLINE_NOT_FOUND, "world not found");
        }
        if self.members.contains_key(&peer) {
            return decline(DECLINE_ALREADY_JOINED, "already joined");
        }
        // One outstanding request per peer, so a peer is never admitted twice.
        if self.requests.values().any(|r| r.peer == peer) {
            return decline(DECLINE_ALREADY_JOINED, "join already pending");
        }
        let request = self.next_request;
        self.next_request += 1;
        self.requests.insert(request, PendingJoin { peer, session });
        vec![WorldAction::Emit(WorldEvent::PeerRequest { request, peer })]
    }

    /// Admit a pending requester: it becomes an active member and receives the snapshot.
    pub fn accept(&mut self, request: RequestId) -> Result<Vec<WorldAction>, WorldError> {
        self.ensure_live()?;
        let pending = self
            .requests
            .remove(&request)
            .ok_or(WorldError::UnknownRequest)?;
        let hash = self.objects.hash();
        self.members.insert(
            pending.peer,
            Member {
                session: pending.session,
                hash,
            },
        );
        Ok(vec![
            WorldAction::Send(
                pending.peer,
                Message::JoinAccept {
                    recver_session: pending.session,
                    sender_session: self.id,
                    world_url: self.url.clone(),
                    objects: self.objects.snapshot(),
                    hash,
                },
            ),
            WorldAction::Emit(WorldEvent::PeerJoined {
                peer: pending.peer,
                hash,
            }),
        ])
    }

    /// Reject a pending requester with `code` and `text`, passed through unchanged.
    pub fn decline(
        &mut self,
        request: RequestId,
        code: i32,
        text: &str,
    ) -> Result<Vec<WorldAction>, WorldError> {
        self.ensure_live()?;
        let pending = self
            .requests
            .remove(&request)
            .ok_or(WorldError::UnknownRequest)?;
        Ok(vec![WorldAction::Send(
            pending.peer,
            Message::JoinDecline {
                recver_session: pending.session,
                code,
                text: text.to_string(),
            },
        )])
    }

    /// Local append: apply, then send to `target` or, when `None`, to every active member.
    pub fn append_local(
        &mut self,
        target: Option<PeerId>,
        objects: Vec<SharedObject>,
    ) -> Result<Vec<WorldAction>, WorldError> {
        self.ensure_live()?;
        let targets = self.targets(target)?;
        self.objects.append(&objects);
        let hash = self.objects.hash();
        let origin = self.local;
        Ok(self.fan_out(&targets, |recver_session, sender_session| {
            Message::ObjectAppend {
                recver_session,
                sender_session,
                origin,
                objects: objects.clone(),
                hash,
            }
        }))
    }

    /// Local delete: apply, then send to `target` or every active member.
    pub fn delete_local(
        &mut self,
        target: Option<PeerId>,
        ids: Vec<ObjectId>,
    ) -> Result<Vec<WorldAction>, WorldError> {
        self.ensure_live()?;
        let targets = self.targets(target)?;
        self.objects.delete(&ids);
        let hash = self.objects.hash();
        let origin = self.local;
        Ok(self.fan_out(&targets, |recver_session, sender_session| {
            Message::ObjectDelete {
                recver_session,
                sender_session,
                origin,
                ids: ids.clone(),
                hash,
            }
        }))
    }

    /// World-scoped message from `peer` (object batches and leaves).
    pub fn on_message(&mut self, peer: PeerId, msg: Message) -> Result<Vec<WorldAction>, WorldError> {
        self.ensure_live()?;
        match msg {
            Message::ObjectAppend {
                sender_session,
                origin,
                objects,
                hash,
                ..
            } => {
                self.check_sender(peer, sender_session)?;
                self.objects.append(&objects);
                self.record_hash(peer, hash);
                let mut actions = vec![WorldAction::Emit(WorldEvent::ObjectsChanged {
                    peer,
                    origin,
                    added: objects.clone(),
                    removed: Vec::new(),
                })];
                if self.role == WorldRole::Hosting {
                    let relay_hash = self.objects.hash();
                    let others = self.others(peer);
                    actions.extend(self.fan_out(&others, |recver_session, sender_session| {
                        Message::ObjectAppend {
                            recver_session,
                            sender_session,
                            origin,
                            objects: objects.clone(),
                            hash: relay_hash,
                        }
                    }));
                }
                Ok(actions)
            }
            Message::ObjectDelete {
                sender_session,
                origin,
                ids,
                hash,
                ..
            } => {
                self.check_sender(peer, sender_session)?;
                self.objects.delete(&ids);
                self.record_hash(peer, hash);
                let mut actions = vec![WorldAction::Emit(WorldEvent::ObjectsChanged {
                    peer,
                    origin,
                    added: Vec::new(),
                    removed: ids.clone(),
                })];
                if self.role == WorldRole::Hosting {
                    let relay_hash = self.objects.hash();
                    let others = self.others(peer);
                    actions.extend(self.fan_out(&others, |recver_session, sender_session| {
                        Message::ObjectDelete {
                            recver_session,
                            sender_session,
                            origin,
                            ids: ids.clone(),
                            hash: relay_hash,
                        }
                    }));
                }
                Ok(actions)
            }
            Message::Leave {
                sender_session,
                hash,
                ..
            } => {
                if self.members.contains_key(&peer) {
                    self.check_sender(peer, sender_session)?;
                }
                Ok(self.remove_peer(peer, LeaveReason::Graceful { hash }))
            }
            _ => Err(WorldError::UnknownPeer),
        }
    }

    /// The connection to `peer` is gone: abrupt leave, and its pending requests are dropped.
    pub fn on_disconnect(&mut self, peer: PeerId) -> Vec<WorldAction> {
        if self.terminated {
            return Vec::new();
        }
        self.remove_peer(peer, LeaveReason::Abrupt)
    }

    /// Graceful teardown: leave notices with the final hash to every member, declines for every
    /// pending request, then termination.
    pub fn close(&mut self) -> Vec<WorldAction> {
        if self.terminated {
            return Vec::new();
        }
        self.terminated = true;
        let hash = self.objects.hash();
        let mut actions = Vec::new();
        for (peer, member) in std::mem::take(&mut self.members) {
            actions.push(WorldAction::Send(
                peer,
                Message::Leave {
                    recver_session: member.session,
                    sender_session: self.id,
                    hash,
                },
            ));
        }
        for (_, pending) in std::mem::take(&mut self.requests) {
            actions.push(WorldAction::Send(
                pending.peer,
                Message::JoinDecline {
                    recver_session: pending.session,
                    code: DECLINE_WORLD_CLOSED,
                    text: "world closed".to_string(),
                },
            ));
        }
        actions.push(WorldAction::Terminate);
        actions
    }

    fn ensure_live(&self) -> Result<(), WorldError> {
        if self.terminated {
            Err(WorldError::Terminated)
        } else {
            Ok(())
        }
    }

    fn targets(&self, target: Option<PeerId>) -> Result<Vec<PeerId>, WorldError> {
        match target {
            Some(peer) if self.members.contains_key(&peer) => Ok(vec![peer]),
            Some(_) => Err(WorldError::UnknownPeer),
            None => Ok(self.members.keys().copied().collect()),
        }
    }

    fn others(&self, except: PeerId) -> Vec<PeerId> {
        self.members
            .keys()
            .copied()
            .filter(|p| *p != except)
            .collect()
    }

    fn fan_out(
        &self,
        targets: &[PeerId],
        build: impl Fn(WorldId, WorldId) -> Message,
    ) -> Vec<WorldAction> {
        targets
            .iter()
            .filter_map(|peer| {
                self.members
                    .get(peer)
                    .map(|m| WorldAction::Send(*peer, build(m.session, self.id)))
            })
            .collect()
    }

    fn check_sender(&self, peer: PeerId, sender_session: WorldId) -> Result<(), WorldError> {
        match self.members.get(&peer) {
            Some(m) if m.session == sender_session => Ok(()),
            _ => Err(WorldError::UnknownPeer),
        }
    }

    fn record_hash(&mut self, peer: PeerId, hash: ContentHash) {
        if let Some(m) = self.members.get_mut(&peer) {
            m.hash = hash;
        }
    }

    fn remove_peer(&mut self, peer: PeerId, reason: LeaveReason) -> Vec<WorldAction> {
        self.requests.retain(|_, r| r.peer != peer);
        if self.members.remove(&peer).is_none() {
            return Vec::new();
        }
        let mut actions = vec![WorldAction::Emit(WorldEvent::PeerLeft { peer, reason })];
        if self.role == (WorldRole::Member { host: peer }) {
            // Without its host a member world cannot sync any further.
            self.terminated = true;
            self.requests.clear();
            actions.push(WorldAction::Terminate);
        }
        actions
    }
}
