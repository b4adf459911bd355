//! Abyss protocol core.
//! Host-driven: no I/O; the node passes messages and commands in and receives actions.

pub mod aurl;
pub mod error;
pub mod errqueue;
pub mod handle;
pub mod identity;
pub mod objects;
pub mod path;
pub mod protocol;
pub mod wire;
pub mod world;

pub use aurl::AbyssUrl;
pub use error::{AbyssError, Result};
pub use errqueue::{ErrorQueue, ErrorRecord};
pub use handle::{Handle, HandleTable};
pub use identity::{Identity, PeerId, PublicKey};
pub use objects::{ContentHash, ObjectId, ObjectSet, SharedObject};
pub use path::PathResolver;
pub use protocol::{Message, Method, PROTOCOL_VERSION};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
pub use world::{LeaveReason, RequestId, WorldAction, WorldCore, WorldEvent, WorldId, WorldRole};
