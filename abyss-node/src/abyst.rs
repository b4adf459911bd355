//! Abyst: method + path request/response over an authenticated peer connection.
//!
//! A client session numbers its requests; the serving host answers each session's requests one at a
//! time, so responses come back in request order.

use std::collections::HashMap;
use std::sync::Arc;

use abyss_core::{AbyssError, Method, PeerId};
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};

use crate::host::HostCommand;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbystRequest {
    pub method: Method,
    pub path: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbystResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl AbystResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn not_found() -> Self {
        Self::new(404)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// First header named `name`, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Serving side of abyst, installed on a host.
#[async_trait]
pub trait AbystService: Send + Sync {
    async fn handle(&self, peer: PeerId, request: AbystRequest) -> AbystResponse;
}

/// Answers every request with 404.
pub struct NotFoundService;

#[async_trait]
impl AbystService for NotFoundService {
    async fn handle(&self, _peer: PeerId, _request: AbystRequest) -> AbystResponse {
        AbystResponse::not_found()
    }
}

/// In-memory resources keyed by path.
#[derive(Default)]
pub struct StaticAbystService {
    resources: RwLock<HashMap<String, (String, Vec<u8>)>>,
}

impl StaticAbystService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: &str, content_type: &str, body: impl Into<Vec<u8>>) {
        self.resources.write().insert(
            abyss_core::path::normalize(path),
            (content_type.to_string(), body.into()),
        );
    }

    pub fn remove(&self, path: &str) -> bool {
        self.resources
            .write()
            .remove(&abyss_core::path::normalize(path))
            .is_some()
    }
}

#[async_trait]
impl AbystService for StaticAbystService {
    async fn handle(&self, _peer: PeerId, request: AbystRequest) -> AbystResponse {
        let path = abyss_core::path::normalize(&request.path);
        let resources = self.resources.read();
        let Some((content_type, body)) = resources.get(&path) else {
            return AbystResponse::not_found();
        };
        let response = AbystResponse::new(200)
            .with_header("content-type", content_type)
            .with_header("content-length", &body.len().to_string());
        match request.method {
            Method::Get => response.with_body(body.clone()),
            Method::Head => response,
            _ => AbystResponse::new(405).with_header("allow", "GET, HEAD"),
        }
    }
}

/// Client end of one abyst session with one peer. Clones share the session; it is closed on
/// both ends when the last clone is dropped.
#[derive(Clone, Debug)]
pub struct AbystClient {
    inner: Arc<ClientSession>,
}

#[derive(Debug)]
struct ClientSession {
    peer: PeerId,
    session: u64,
    commands: mpsc::UnboundedSender<HostCommand>,
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        let _ = self.commands.send(HostCommand::AbystClose {
            peer: self.peer,
            session: self.session,
        });
    }
}

impl AbystClient {
    pub(crate) fn new(peer: PeerId, session: u64, commands: mpsc::UnboundedSender<HostCommand>) -> Self {
        Self {
            inner: Arc::new(ClientSession {
                peer,
                session,
                commands,
            }),
        }
    }

    pub fn peer(&self) -> PeerId {
        self.inner.peer
    }

    pub fn session(&self) -> u64 {
        self.inner.session
    }

    /// Send one request and wait for its response. Fails with `Closed` if the connection goes
    /// away first.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Vec<u8>,
    ) -> Result<AbystResponse, AbyssError> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .commands
            .send(HostCommand::AbystRequest {
                peer: self.inner.peer,
                session: self.inner.session,
                request: AbystRequest {
                    method,
                    path: path.to_string(),
                    body,
                },
                reply,
            })
            .map_err(|_| AbyssError::Closed)?;
        rx.await.map_err(|_| AbyssError::Closed)?
    }

    pub async fn get(&self, path: &str) -> Result<AbystResponse, AbyssError> {
        self.request(Method::Get, path, Vec::new()).await
    }
}

/// Start the task serving one inbound session; requests sent on the returned channel are answered
/// in order.
pub(crate) fn spawn_session(
    peer: PeerId,
    session: u64,
    service: Arc<dyn AbystService>,
    commands: mpsc::UnboundedSender<HostCommand>,
) -> mpsc::UnboundedSender<(u64, AbystRequest)> {
    let (tx, mut rx) = mpsc::unbounded_channel::<(u64, AbystRequest)>();
    tokio::spawn(async move {
        while let Some((seq, request)) = rx.recv().await {
            tracing::debug!(%peer, session, seq, method = request.method.as_str(), path = %request.path, "abyst request");
            let response = service.handle(peer, request).await;
            let msg = abyss_core::Message::AbystResponse {
                session,
                seq,
                status: response.status,
                headers: response.headers,
                body: response.body,
            };
            if commands.send(HostCommand::Send { peer, msg }).is_err() {
                break;
            }
        }
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(method: Method, path: &str) -> AbystRequest {
        AbystRequest {
            method,
            path: path.into(),
            body: Vec::new(),
        }
    }

    #[tokio::test]
    async fn static_service_serves_get_and_head() {
        let svc = StaticAbystService::new();
        svc.insert("/docs/readme", "text/plain", "hello");
        let peer = abyss_core::Identity::generate().peer_id();

        let get = svc.handle(peer, req(Method::Get, "docs//readme")).await;
        assert_eq!(get.status, 200);
        assert_eq!(get.body, b"hello");
        assert_eq!(get.header("Content-Type"), Some("text/plain"));

        let head = svc.handle(peer, req(Method::Head, "/docs/readme")).await;
        assert_eq!(head.status, 200);
        assert!(head.body.is_empty());
        assert_eq!(head.header("content-length"), Some("5"));

        assert_eq!(svc.handle(peer, req(Method::Post, "/docs/readme")).await.status, 405);
        assert_eq!(svc.handle(peer, req(Method::Get, "/missing")).await.status, 404);
        assert!(svc.remove("/docs/readme"));
        assert_eq!(svc.handle(peer, req(Method::Get, "/docs/readme")).await.status, 404);
    }

    #[tokio::test]
    async fn default_service_is_not_found() {
        let peer = abyss_core::Identity::generate().peer_id();
        let resp = NotFoundService.handle(peer, req(Method::Get, "/")).await;
        assert_eq!(resp, AbystResponse::not_found());
        assert!(!resp.is_success());
    }

    #[tokio::test]
    async fn session_answers_in_order() {
        let (commands, mut rx) = mpsc::unbounded_channel();
        let peer = abyss_core::Identity::generate().peer_id();
        let tx = spawn_session(peer, 9, Arc::new(NotFoundService), commands);
        for seq in 0..3 {
            tx.send((seq, req(Method::Get, "/"))).unwrap();
        }
        for expected in 0..3 {
            match rx.recv().await.unwrap() {
                HostCommand::Send {
                    msg: abyss_core::Message::AbystResponse { session, seq, status, .. },
                    ..
                } => {
                    assert_eq!((session, seq, status), (9, expected, 404));
                }
                _ => panic!("expected a response"),
            }
        }
    }
}
