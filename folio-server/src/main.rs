//! Folio sync server.
//!
//! ```text
//! folio-server            run the sync server (configured from FOLIO_* env)
//! folio-server relay ADDR run a standalone relay hub (fan-out and shared store)
//! ```
//!
//! Server processes that share documents point `FOLIO_RELAY_URL` and
//! `FOLIO_STORE_URL` at the same relay. The relay keeps the store in
//! RocksDB when `FOLIO_STORAGE_PATH` is set, in memory otherwise.
//!
//! Logging is controlled by `RUST_LOG` (e.g. `RUST_LOG=folio_sync=debug`).

use std::error::Error;
use std::sync::Arc;

use folio_sync::bridge::FanOutChannel;
use folio_sync::persistence::KeyValueStore;
use folio_sync::{
    Ed25519Verifier, FanOutBridge, LocalHub, MemoryStore, PersistenceGateway, RelayChannel,
    RelayServer, RemoteStore, RocksStore, ServerConfig, ServerError, SessionRegistry, SyncServer,
};

const DEFAULT_RELAY_ADDR: &str = "127.0.0.1:9190";

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        Some("relay") => {
            let addr = args.next().unwrap_or_else(|| DEFAULT_RELAY_ADDR.to_string());
            run_relay(&addr, ServerConfig::from_env()?).await
        }
        Some(other) => Err(format!("unknown command {other:?}; expected `relay` or nothing").into()),
        None => run_server(ServerConfig::from_env()?).await,
    }
}

async fn run_relay(addr: &str, config: ServerConfig) -> Result<(), Box<dyn Error>> {
    let relay = RelayServer::bind(addr).await?.with_store(local_store(&config)?);
    tokio::select! {
        result = relay.run() => result?,
        _ = tokio::signal::ctrl_c() => log::info!("relay shutting down"),
    }
    Ok(())
}

fn local_store(config: &ServerConfig) -> Result<Arc<dyn KeyValueStore>, Box<dyn Error>> {
    Ok(match &config.storage {
        Some(store_config) => {
            log::info!("using RocksDB store at {}", store_config.path.display());
            Arc::new(RocksStore::open(store_config.clone())?)
        }
        None => {
            log::warn!("FOLIO_STORAGE_PATH not set; documents live in memory only");
            Arc::new(MemoryStore::new())
        }
    })
}

async fn run_server(config: ServerConfig) -> Result<(), Box<dyn Error>> {
    let key = config.auth_public_key.as_deref().ok_or_else(|| {
        ServerError::Config("FOLIO_AUTH_PUBLIC_KEY must hold the token verifying key".into())
    })?;
    let verifier = Arc::new(Ed25519Verifier::from_base64(key)?);

    let store: Arc<dyn KeyValueStore> = match &config.store_url {
        Some(url) => {
            log::info!("using shared store at {url}");
            RemoteStore::connect(url, config.bridge.clone()).await?
        }
        None => local_store(&config)?,
    };

    let channel: Arc<dyn FanOutChannel> = match &config.relay_url {
        Some(url) => RelayChannel::connect(url, config.bridge.clone()).await?,
        None => {
            log::info!("no FOLIO_RELAY_URL; fan-out stays inside this process");
            Arc::new(LocalHub::default())
        }
    };

    let gateway = PersistenceGateway::new(store, config.retention);
    let bridge = FanOutBridge::start(channel, config.bridge.clone());
    let registry = SessionRegistry::new(gateway, bridge, config.session.clone());
    let maintenance = registry.spawn_maintenance(config.heartbeat_timeout);

    let server = SyncServer::bind(&config, Arc::clone(&registry), verifier).await?;

    let (stop_health, health_stopped) = tokio::sync::oneshot::channel::<()>();
    let health = match &config.health_addr {
        Some(addr) => {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            let registry = Arc::clone(&registry);
            Some(tokio::spawn(folio_sync::health::serve(
                listener,
                registry,
                async move {
                    let _ = health_stopped.await;
                },
            )))
        }
        None => None,
    };

    let result = tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            log::info!("shutting down");
            Ok(())
        }
    };

    maintenance.abort();
    registry.shutdown().await;
    let _ = stop_health.send(());
    if let Some(health) = health {
        match health.await {
            Ok(Err(e)) => log::warn!("health endpoint failed: {e}"),
            Err(e) => log::warn!("health task failed: {e}"),
            Ok(Ok(())) => {}
        }
    }
    let stats = server.stats();
    log::info!(
        "served {} connections, {} frames in, {} frames out",
        stats.total_connections,
        stats.frames_in,
        stats.frames_out
    );
    Ok(result?)
}
