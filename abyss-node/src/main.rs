// Abyss node daemon: host the configured worlds and serve joins until Ctrl+C / SIGTERM.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use abyss_core::{Identity, PathResolver};
use abyss_node::{config, Event, HostBuilder, NodeConfig, World};
use anyhow::Context;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut config_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("abyss-node {}", VERSION);
                return Ok(());
            }
            "--config" | "-c" => {
                config_path = Some(args.next().context("--config needs a path")?.into());
            }
            other => anyhow::bail!("unknown argument: {}", other),
        }
    }

    let cfg = match &config_path {
        Some(p) => config::load_from(p)?,
        None => config::load()?,
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: NodeConfig) -> anyhow::Result<()> {
    let identity = match &cfg.key_path {
        Some(path) => load_or_create_key(path)?,
        None => {
            tracing::warn!("no key_path configured, using a throwaway identity");
            Identity::generate()
        }
    };
    let resolver = Arc::new(PathResolver::new());
    let host = HostBuilder::new(identity, resolver)
        .config(cfg.clone())
        .bind()
        .await?;
    println!("{}", host.local_url());

    for path in &cfg.worlds {
        let world = host.open_world(path).await?;
        tracing::info!(url = %world.url(), "world open");
        tokio::spawn(watch(world, cfg.auto_accept));
    }

    let errors = host.errors().clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            tick.tick().await;
            while let Some(record) = errors.pop() {
                tracing::warn!(error = %record.body(), "background error");
            }
        }
    });

    shutdown_signal().await?;
    tracing::info!("shutting down");
    host.shutdown().await;
    Ok(())
}

/// Log a world's events, accepting joins when `auto_accept` is set.
async fn watch(world: World, auto_accept: bool) {
    let url = world.url().to_string();
    loop {
        match world.wait_event().await {
            Ok(Event::PeerRequest(request)) => {
                tracing::info!(%url, peer = %request.peer(), "join request");
                let result = if auto_accept {
                    request.accept().await.map(|_| ())
                } else {
                    request.decline(403, "not accepting members").await
                };
                if let Err(e) = result {
                    tracing::warn!(%url, error = %e, "resolving join request failed");
                }
            }
            Ok(Event::PeerJoined(peer)) => tracing::info!(%url, peer = %peer.peer(), "peer joined"),
            Ok(Event::PeerLeft(leave)) => {
                tracing::info!(%url, peer = %leave.peer, graceful = leave.is_graceful(), "peer left")
            }
            Ok(Event::ObjectsChanged(change)) => tracing::info!(
                %url,
                peer = %change.peer.peer(),
                origin = %change.origin,
                added = change.added.len(),
                removed = change.removed.len(),
                "objects changed"
            ),
            Err(_) => break,
        }
    }
}

fn load_or_create_key(path: &Path) -> anyhow::Result<Identity> {
    if path.exists() {
        let pem = std::fs::read(path).with_context(|| format!("read key {}", path.display()))?;
        return Identity::from_pem(&pem).with_context(|| format!("load key {}", path.display()));
    }
    let identity = Identity::generate();
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    write_private(path, identity.to_pem()?.as_bytes())
        .with_context(|| format!("write key {}", path.display()))?;
    tracing::info!(path = %path.display(), peer = %identity.peer_id(), "generated new identity");
    Ok(identity)
}

/// Create `path` readable by the owner only (0600 on Unix) and write `contents`.
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_is_private_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("node.pem");
        let first = load_or_create_key(&path).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        let again = load_or_create_key(&path).unwrap();
        assert_eq!(first.peer_id(), again.peer_id());
    }

    #[test]
    fn existing_file_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taken");
        std::fs::write(&path, b"keep").unwrap();
        assert!(write_private(&path, b"new").is_err());
        assert_eq!(std::fs::read(&path).unwrap(), b"keep");
    }
}
