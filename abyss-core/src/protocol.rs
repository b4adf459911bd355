//! Abyss wire protocol: message types and version.

use serde::{Deserialize, Serialize};

use crate::identity::{bytes_64, PeerId, PublicKey};
use crate::objects::{ContentHash, ObjectId, SharedObject};
use crate::world::WorldId;

/// Current protocol version. Checked in the handshake hello.
pub const PROTOCOL_VERSION: u8 = 1;

/// Request methods of the abyst request/response protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
}

impl Method {
    /// Numeric code used by the embedding surface (0 = GET).
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Method::Get),
            1 => Some(Method::Head),
            2 => Some(Method::Post),
            3 => Some(Method::Put),
            4 => Some(Method::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

/// All wire message types. Encoding is bincode; framing is length-prefix (see wire module).
///
/// World messages name the receiver's world session in `recver_session` and the sender's in
/// `sender_session`; a join request names the target world by path instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Handshake, plaintext: root public key and ephemeral X25519 key.
    Hello {
        protocol_version: u8,
        public_key: PublicKey,
        ephemeral: [u8; 32],
    },
    /// Handshake, plaintext: signature over the transcript proving root key possession.
    Auth {
        #[serde(with = "bytes_64")]
        signature: [u8; 64],
    },
    /// Liveness when the connection is otherwise idle.
    Heartbeat,
    /// Ask the host to admit the sender into the world mapped at `path`.
    JoinRequest {
        sender_session: WorldId,
        path: String,
    },
    /// Admission: world URL, full object snapshot and the host's hash over it.
    JoinAccept {
        recver_session: WorldId,
        sender_session: WorldId,
        world_url: String,
        objects: Vec<SharedObject>,
        hash: ContentHash,
    },
    /// Rejection with an application chosen code and message.
    JoinDecline {
        recver_session: WorldId,
        code: i32,
        text: String,
    },
    /// Graceful departure, binding the sender's final object state.
    Leave {
        recver_session: WorldId,
        sender_session: WorldId,
        hash: ContentHash,
    },
    /// Add-or-replace batch. `origin` is the peer that authored it (differs from the sender when
    /// the host relays); `hash` is the sender's hash after applying it.
    ObjectAppend {
        recver_session: WorldId,
        sender_session: WorldId,
        origin: PeerId,
        objects: Vec<SharedObject>,
        hash: ContentHash,
    },
    /// Remove-by-id batch; same attribution as `ObjectAppend`.
    ObjectDelete {
        recver_session: WorldId,
        sender_session: WorldId,
        origin: PeerId,
        ids: Vec<ObjectId>,
        hash: ContentHash,
    },
    /// Abyst request. `seq` increases by one per request within `session`.
    AbystRequest {
        session: u64,
        seq: u64,
        method: Method,
        path: String,
        body: Vec<u8>,
    },
    /// Abyst response for (`session`, `seq`).
    AbystResponse {
        session: u64,
        seq: u64,
        status: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    },
    /// The client released `session`; the server drops its state for it.
    AbystClose { session: u64 },
}

impl Message {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "hello",
            Message::Auth { .. } => "auth",
            Message::Heartbeat => "heartbeat",
            Message::JoinRequest { .. } => "join-request",
            Message::JoinAccept { .. } => "join-accept",
            Message::JoinDecline { .. } => "join-decline",
            Message::Leave { .. } => "leave",
            Message::ObjectAppend { .. } => "object-append",
            Message::ObjectDelete { .. } => "object-delete",
            Message::AbystRequest { .. } => "abyst-request",
            Message::AbystResponse { .. } => "abyst-response",
            Message::AbystClose { .. } => "abyst-close",
        }
    }

    /// Receiving world session for world-scoped messages.
    pub fn recver_session(&self) -> Option<WorldId> {
        match self {
            Message::JoinAccept { recver_session, .. }
            | Message::JoinDecline { recver_session, .. }
            | Message::Leave { recver_session, .. }
            | Message::ObjectAppend { recver_session, .. }
            | Message::ObjectDelete { recver_session, .. } => Some(*recver_session),
            _ => None,
        }
    }
}
