//! Abyss node: tokio transport, host and world actors, abyst, and the embeddable engine.

pub mod abyst;
pub mod config;
pub mod engine;
pub mod host;
pub mod transport;
pub mod world;

pub use abyst::{AbystClient, AbystRequest, AbystResponse, AbystService, StaticAbystService};
pub use config::NodeConfig;
pub use engine::{Engine, EventKind};
pub use host::{ConnectionInfo, ConnectionState, Host, HostBuilder};
pub use world::{Event, ObjectsChanged, PeerLeave, World, WorldPeer, WorldPeerRequest, WorldSnapshot};
