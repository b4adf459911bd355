//! Blocking, handle-based surface for embedding a node in a foreign process.
//!
//! Every resource is referenced by a generation-checked [`Handle`]. Calls block the calling thread
//! on a private tokio runtime. Failures of calls that create resources are also pushed to the error
//! queue so a poller that only watches the queue sees them.

use std::sync::Arc;
use std::time::Duration;

use abyss_core::objects::{parse_append_payload, parse_delete_payload, render_ids, render_objects};
use abyss_core::{AbyssError, AbyssUrl, ErrorQueue, Handle, HandleTable, Identity, Method, PathResolver};
use parking_lot::Mutex;

use crate::abyst::{AbystClient, AbystResponse};
use crate::config::NodeConfig;
use crate::host::{Host, HostBuilder};
use crate::world::{Event, ObjectsChanged, PeerLeave, World, WorldPeer, WorldPeerRequest};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Kind of a world event returned by [`Engine::world_wait_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Handle is a peer request.
    PeerRequest,
    /// Handle is a world peer.
    PeerJoined,
    /// Handle is a peer leave.
    PeerLeft,
    /// Handle is an object change.
    ObjectsChanged,
}

#[derive(Clone)]
enum Resource {
    PathResolver(Arc<PathResolver>),
    Host(Host),
    World(World),
    PeerRequest(WorldPeerRequest),
    Peer(WorldPeer),
    PeerLeave(PeerLeave),
    ObjectsChanged(ObjectsChanged),
    AbystClient(AbystClient),
    AbystResponse(AbystResponse),
}

pub struct Engine {
    runtime: tokio::runtime::Runtime,
    handles: Mutex<HandleTable<Resource>>,
    errors: ErrorQueue,
    config: NodeConfig,
}

macro_rules! pick {
    ($variant:ident) => {
        |r: &Resource| match r {
            Resource::$variant(x) => Some(x.clone()),
            _ => None,
        }
    };
}

impl Engine {
    pub fn new() -> Result<Self, AbyssError> {
        Self::with_config(NodeConfig::default())
    }

    /// Hosts created by this engine use `config` (listen address, timeouts).
    pub fn with_config(config: NodeConfig) -> Result<Self, AbyssError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("abyss-engine")
            .build()
            .map_err(|e| AbyssError::InvalidArgument(format!("runtime: {}", e)))?;
        Ok(Self {
            runtime,
            handles: Mutex::new(HandleTable::new()),
            errors: ErrorQueue::new(),
            config,
        })
    }

    pub fn version(&self) -> &'static str {
        VERSION
    }

    pub fn errors(&self) -> &ErrorQueue {
        &self.errors
    }

    /// Oldest queued error as diagnostic text; each record is returned once.
    pub fn pop_error(&self) -> Option<String> {
        self.errors.pop().map(|r| r.body())
    }

    fn allocate(&self, resource: Resource) -> Handle {
        self.handles.lock().allocate(resource)
    }

    fn get<T>(&self, handle: Handle, pick: impl Fn(&Resource) -> Option<T>) -> Result<T, AbyssError> {
        let handles = self.handles.lock();
        pick(handles.resolve(handle)?).ok_or(AbyssError::NotFound)
    }

    /// Report a failed resource-creating call through the queue as well.
    fn track<T>(&self, context: &'static str, result: Result<T, AbyssError>) -> Result<T, AbyssError> {
        if let Err(e) = &result {
            self.errors.push(context, e.clone());
        }
        result
    }

    /// Release a handle. Hosts shut down and worlds leave gracefully. Releasing twice is a no-op.
    pub fn close_handle(&self, handle: Handle) {
        let released = self.handles.lock().release(handle);
        match released {
            Some(Resource::Host(host)) => self.runtime.block_on(host.shutdown()),
            Some(Resource::World(world)) => self.runtime.block_on(world.close()),
            _ => {}
        }
    }

    pub fn new_path_resolver(&self) -> Handle {
        self.allocate(Resource::PathResolver(Arc::new(PathResolver::new())))
    }

    /// Map `path` to a new world id and return the id.
    pub fn path_resolver_set_mapping(&self, resolver: Handle, path: &str) -> Result<String, AbyssError> {
        let resolver = self.get(resolver, pick!(PathResolver))?;
        Ok(resolver.set_mapping(path).to_string())
    }

    pub fn path_resolver_delete_mapping(&self, resolver: Handle, path: &str) -> Result<(), AbyssError> {
        self.get(resolver, pick!(PathResolver))?.delete_mapping(path);
        Ok(())
    }

    /// Start a host with the PEM private key in `key_pem`, routing joins through `resolver`.
    pub fn new_host(&self, key_pem: &[u8], resolver: Handle) -> Result<Handle, AbyssError> {
        let result = (|| -> Result<Handle, AbyssError> {
            let resolver = self.get(resolver, pick!(PathResolver))?;
            let identity = Identity::from_pem(key_pem)?;
            let host = self.runtime.block_on(
                HostBuilder::new(identity, resolver)
                    .config(self.config.clone())
                    .errors(self.errors.clone())
                    .bind(),
            )?;
            Ok(self.allocate(Resource::Host(host)))
        })();
        self.track("new host", result)
    }

    pub fn host_local_url(&self, host: Handle) -> Result<String, AbyssError> {
        Ok(self.get(host, pick!(Host))?.local_url().to_string())
    }

    /// Non-blocking; a failure to connect arrives in the error queue.
    pub fn host_open_outbound_connection(&self, host: Handle, url: &str) -> Result<(), AbyssError> {
        let result = (|| -> Result<(), AbyssError> {
            let host = self.get(host, pick!(Host))?;
            host.open_outbound_connection(&url.parse::<AbyssUrl>()?)
        })();
        self.track("open outbound connection", result)
    }

    /// Host a world at `path` (a bare path or a full URL of this host).
    pub fn host_open_world(&self, host: Handle, path: &str) -> Result<Handle, AbyssError> {
        let result = (|| -> Result<Handle, AbyssError> {
            let host = self.get(host, pick!(Host))?;
            let path = match path.parse::<AbyssUrl>() {
                Ok(url) if url.peer == host.peer_id() => url.path,
                Ok(_) => return Err(AbyssError::InvalidArgument("url names another host".into())),
                Err(_) => path.to_string(),
            };
            let world = self.runtime.block_on(host.open_world(&path))?;
            Ok(self.allocate(Resource::World(world)))
        })();
        self.track("open world", result)
    }

    pub fn host_join_world(&self, host: Handle, url: &str, timeout_ms: u64) -> Result<Handle, AbyssError> {
        let result = (|| -> Result<Handle, AbyssError> {
            let host = self.get(host, pick!(Host))?;
            let url: AbyssUrl = url.parse()?;
            let world = self
                .runtime
                .block_on(host.join_world(&url, Duration::from_millis(timeout_ms)))?;
            Ok(self.allocate(Resource::World(world)))
        })();
        self.track("join world", result)
    }

    pub fn world_url(&self, world: Handle) -> Result<String, AbyssError> {
        Ok(self.get(world, pick!(World))?.url().to_string())
    }

    /// This node's session id for the world: the resolver's world id when hosting, the join
    /// session when joined.
    pub fn world_session_id(&self, world: Handle) -> Result<String, AbyssError> {
        Ok(self.get(world, pick!(World))?.id().to_string())
    }

    pub fn world_hash(&self, world: Handle) -> Result<String, AbyssError> {
        let world = self.get(world, pick!(World))?;
        Ok(self.runtime.block_on(world.hash())?.to_hex())
    }

    /// Current objects as a JSON array.
    pub fn world_objects(&self, world: Handle) -> Result<String, AbyssError> {
        let world = self.get(world, pick!(World))?;
        let snapshot = self.runtime.block_on(world.snapshot())?;
        Ok(render_objects(&snapshot.objects))
    }

    /// Block until the world's next event. Fails with `WorldClosed` after the world is torn down.
    pub fn world_wait_event(&self, world: Handle) -> Result<(EventKind, Handle), AbyssError> {
        let world = self.get(world, pick!(World))?;
        let event = self.runtime.block_on(world.wait_event())?;
        Ok(match event {
            Event::PeerRequest(r) => (EventKind::PeerRequest, self.allocate(Resource::PeerRequest(r))),
            Event::PeerJoined(p) => (EventKind::PeerJoined, self.allocate(Resource::Peer(p))),
            Event::PeerLeft(l) => (EventKind::PeerLeft, self.allocate(Resource::PeerLeave(l))),
            Event::ObjectsChanged(c) => (
                EventKind::ObjectsChanged,
                self.allocate(Resource::ObjectsChanged(c)),
            ),
        })
    }

    /// JSON array of objects for `world`.
    pub fn world_append_objects(&self, world: Handle, json: &str) -> Result<(), AbyssError> {
        let world = self.get(world, pick!(World))?;
        let objects = parse_append_payload(json)?;
        self.runtime.block_on(world.append_objects(objects))
    }

    /// JSON array of ids for `world`.
    pub fn world_delete_objects(&self, world: Handle, json: &str) -> Result<(), AbyssError> {
        let world = self.get(world, pick!(World))?;
        let ids = parse_delete_payload(json)?;
        self.runtime.block_on(world.delete_objects(ids))
    }

    pub fn world_peer_request_peer(&self, request: Handle) -> Result<String, AbyssError> {
        Ok(self.get(request, pick!(PeerRequest))?.peer().to_hash())
    }

    /// Admit the requester and return a handle to the new peer.
    pub fn world_peer_request_accept(&self, request: Handle) -> Result<Handle, AbyssError> {
        let result = (|| -> Result<Handle, AbyssError> {
            let request = self.get(request, pick!(PeerRequest))?;
            let peer = self.runtime.block_on(request.accept())?;
            Ok(self.allocate(Resource::Peer(peer)))
        })();
        self.track("accept join", result)
    }

    pub fn world_peer_request_decline(&self, request: Handle, code: i32, text: &str) -> Result<(), AbyssError> {
        let request = self.get(request, pick!(PeerRequest))?;
        self.runtime.block_on(request.decline(code, text))
    }

    pub fn world_peer_id(&self, peer: Handle) -> Result<String, AbyssError> {
        Ok(self.get(peer, pick!(Peer))?.peer().to_hash())
    }

    /// Hash the peer last reported, hex.
    pub fn world_peer_hash(&self, peer: Handle) -> Result<String, AbyssError> {
        let peer = self.get(peer, pick!(Peer))?;
        Ok(self.runtime.block_on(peer.hash())?.to_hex())
    }

    pub fn world_peer_append_objects(&self, peer: Handle, json: &str) -> Result<(), AbyssError> {
        let peer = self.get(peer, pick!(Peer))?;
        let objects = parse_append_payload(json)?;
        self.runtime.block_on(peer.append_objects(objects))
    }

    pub fn world_peer_delete_objects(&self, peer: Handle, json: &str) -> Result<(), AbyssError> {
        let peer = self.get(peer, pick!(Peer))?;
        let ids = parse_delete_payload(json)?;
        self.runtime.block_on(peer.delete_objects(ids))
    }

    pub fn world_peer_leave_peer(&self, leave: Handle) -> Result<String, AbyssError> {
        Ok(self.get(leave, pick!(PeerLeave))?.peer.to_hash())
    }

    /// Leave hash, hex; `None` for an abrupt leave.
    pub fn world_peer_leave_hash(&self, leave: Handle) -> Result<Option<String>, AbyssError> {
        Ok(self.get(leave, pick!(PeerLeave))?.hash().map(|h| h.to_hex()))
    }

    /// Handle to the peer that delivered the change.
    pub fn objects_changed_peer(&self, change: Handle) -> Result<Handle, AbyssError> {
        let change = self.get(change, pick!(ObjectsChanged))?;
        Ok(self.allocate(Resource::Peer(change.peer)))
    }

    pub fn objects_changed_origin(&self, change: Handle) -> Result<String, AbyssError> {
        Ok(self.get(change, pick!(ObjectsChanged))?.origin.to_hash())
    }

    /// Added objects as a JSON array.
    pub fn objects_changed_added(&self, change: Handle) -> Result<String, AbyssError> {
        Ok(render_objects(&self.get(change, pick!(ObjectsChanged))?.added))
    }

    /// Removed ids as a JSON array.
    pub fn objects_changed_removed(&self, change: Handle) -> Result<String, AbyssError> {
        Ok(render_ids(&self.get(change, pick!(ObjectsChanged))?.removed))
    }

    pub fn host_abyst_client(&self, host: Handle, peer_hash: &str, timeout_ms: u64) -> Result<Handle, AbyssError> {
        let result = (|| -> Result<Handle, AbyssError> {
            let host = self.get(host, pick!(Host))?;
            let client = self
                .runtime
                .block_on(host.abyst_client(peer_hash, Duration::from_millis(timeout_ms)))?;
            Ok(self.allocate(Resource::AbystClient(client)))
        })();
        self.track("abyst client", result)
    }

    /// Send a request (method code 0 = GET ... 4 = DELETE) and block for the response.
    pub fn abyst_client_request(&self, client: Handle, method: i32, path: &str) -> Result<Handle, AbyssError> {
        let result = (|| -> Result<Handle, AbyssError> {
            let client = self.get(client, pick!(AbystClient))?;
            let method = Method::from_code(method)
                .ok_or_else(|| AbyssError::InvalidArgument(format!("method code {}", method)))?;
            let response = self.runtime.block_on(client.request(method, path, Vec::new()))?;
            Ok(self.allocate(Resource::AbystResponse(response)))
        })();
        self.track("abyst request", result)
    }

    pub fn abyst_response_status(&self, response: Handle) -> Result<u16, AbyssError> {
        Ok(self.get(response, pick!(AbystResponse))?.status)
    }

    pub fn abyst_response_headers(&self, response: Handle) -> Result<Vec<(String, String)>, AbyssError> {
        Ok(self.get(response, pick!(AbystResponse))?.headers)
    }

    pub fn abyst_response_body(&self, response: Handle) -> Result<Vec<u8>, AbyssError> {
        Ok(self.get(response, pick!(AbystResponse))?.body)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let resources = self.handles.lock().drain();
        for resource in resources {
            match resource {
                Resource::Host(host) => self.runtime.block_on(host.shutdown()),
                Resource::World(world) => self.runtime.block_on(world.close()),
                _ => {}
            }
        }
    }
}
