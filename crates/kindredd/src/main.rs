//! kindredd: Kindred friend-to-friend node.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use kindred_core::config::KindredConfig;
use kindred_core::crypto::Keypair;
use kindred_core::wire::service_types;
use kindred_core::{PeerId, ServiceType};

use kindred_services::gxs::{GxsStore, MemoryStore};
use kindred_services::{
    ConnectionManager, GxsService, IdentityRegistry, ReplicatingHooks, ServiceRegistry, SyncConfig,
};

mod handshake;
mod net;

use handshake::LocalInfo;
use net::Node;

const STATUS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = KindredConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = KindredConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        KindredConfig::default()
    });

    let keypair = Arc::new(
        Keypair::load_or_generate(&config.identity.keypair_path)
            .context("failed to load node keypair")?,
    );
    tracing::info!(node = hex::encode(keypair.public), "keypair ready");

    let identities = IdentityRegistry::with_persistence(config.gxs.identities_path.clone());
    identities.apply_config(&config.identity.known_identities);
    tracing::info!(known = identities.len(), "identity registry loaded");

    // ── Services ─────────────────────────────────────────────────────────────
    let sync = SyncConfig::from_config(&config.gxs);
    let mut registry = ServiceRegistry::new();
    let mut stores: Vec<(&'static str, Arc<dyn GxsStore>)> = Vec::new();

    for service_type in config.services.enabled() {
        let name = service_types::name(service_type);
        let store = open_store(&config.gxs.store_path, name)?;
        stores.push((name, store.clone()));
        let hooks = match service_type {
            service_types::CHANNELS => ReplicatingHooks::channels(),
            _ => ReplicatingHooks::forums(),
        }
        .auto_subscribe(true);
        let service = GxsService::new(service_type, name, hooks, store, identities.clone(), sync);
        registry
            .register(Arc::new(service))
            .with_context(|| format!("registering {name}"))?;
    }
    let services: Vec<ServiceType> = registry.service_types();
    tracing::info!(
        forums = config.services.forums,
        channels = config.services.channels,
        "services enabled"
    );

    let manager = ConnectionManager::new(registry);

    // ── Friends ──────────────────────────────────────────────────────────────
    let friends: Vec<(PeerId, String)> = config
        .friends
        .peers
        .iter()
        .filter_map(|f| match PeerId::from_hex(&f.id) {
            Some(id) => Some((id, f.addr.clone())),
            None => {
                tracing::warn!(id = %f.id, "ignoring malformed friend id");
                None
            }
        })
        .collect();
    tracing::info!(friends = friends.len(), "friends loaded");

    let node = Node::new(
        manager.clone(),
        LocalInfo {
            keypair,
            services,
            bandwidth: config.network.bandwidth,
        },
        friends,
        config.network.max_frame_errors,
    );

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Tasks ────────────────────────────────────────────────────────────────
    let listener = TcpListener::bind(&config.network.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.network.listen_addr))?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    let listener_task = {
        let node = node.clone();
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = net::serve(listener, node, shutdown).await {
                tracing::error!(error = %e, "listener failed");
            }
        })
    };

    let dial_task = tokio::spawn(net::dial_loop(
        node.clone(),
        Duration::from_secs(config.network.redial_secs.max(1)),
        shutdown_tx.clone(),
    ));

    let status_task = tokio::spawn(status_loop(manager.clone(), stores, shutdown_tx.subscribe()));

    tracing::info!("kindredd running");

    futures::future::join_all([listener_task, dial_task, status_task]).await;
    manager.shutdown();
    tracing::info!("kindredd stopped");
    Ok(())
}

/// A persistent store under `dir`, or an in-memory one when `dir` is empty.
fn open_store(dir: &Path, name: &str) -> Result<Arc<dyn GxsStore>> {
    if dir.as_os_str().is_empty() {
        return Ok(Arc::new(MemoryStore::new()));
    }
    let path = dir.join(format!("{name}.json"));
    let store = MemoryStore::open(path.clone())
        .with_context(|| format!("failed to open store {}", path.display()))?;
    tracing::info!(service = name, path = %path.display(), "store opened");
    Ok(Arc::new(store))
}

async fn status_loop(
    manager: ConnectionManager,
    stores: Vec<(&'static str, Arc<dyn GxsStore>)>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(STATUS_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = interval.tick() => {}
        }
        let peers: Vec<String> = manager.peer_ids().iter().map(PeerId::short).collect();
        tracing::info!(connected = manager.connected(), peers = ?peers, "status");
        for (name, store) in &stores {
            match store.groups() {
                Ok(groups) => {
                    let subscribed = groups.iter().filter(|g| g.subscribed).count();
                    tracing::info!(service = *name, groups = groups.len(), subscribed, "store status");
                }
                Err(e) => tracing::warn!(service = *name, error = %e, "store status failed"),
            }
        }
    }
}
