//! Shared helpers for the integration tests.

#![allow(dead_code)]

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::{Signer, SigningKey};
use std::sync::Arc;
use std::time::Duration;

use folio_sync::auth::{unix_now, Claims};
use folio_sync::bridge::FanOutChannel;
use folio_sync::persistence::KeyValueStore;
use folio_sync::{
    BridgeConfig, Ed25519Verifier, FanOutBridge, PersistenceGateway, RetentionPolicy,
    ServerConfig, SessionRegistry, SyncServer,
};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&[42u8; 32])
}

pub fn verifier() -> Arc<Ed25519Verifier> {
    Arc::new(Ed25519Verifier::new(signing_key().verifying_key()))
}

/// Token for `user`, valid for an hour.
pub fn mint_token(user: &str) -> String {
    let now = unix_now();
    let claims = Claims {
        sub: user.to_string(),
        iat: now,
        nbf: None,
        exp: now + 3600,
    };
    let body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap());
    let sig = signing_key().sign(body.as_bytes());
    format!("{body}.{}", URL_SAFE_NO_PAD.encode(sig.to_bytes()))
}

/// A registry as one server process would build it.
pub fn registry(
    store: Arc<dyn KeyValueStore>,
    channel: Arc<dyn FanOutChannel>,
) -> Arc<SessionRegistry> {
    let config = ServerConfig::for_testing();
    let gateway = PersistenceGateway::new(store, RetentionPolicy::default());
    let bridge = FanOutBridge::start(channel, BridgeConfig::default());
    SessionRegistry::new(gateway, bridge, config.session)
}

/// Start a sync server for `registry` on an ephemeral port; returns its URL.
pub async fn start_server(registry: Arc<SessionRegistry>) -> String {
    let config = ServerConfig::for_testing();
    let server = SyncServer::bind(&config, registry, verifier()).await.unwrap();
    let url = format!("ws://{}", server.local_addr().unwrap());
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    url
}

/// Poll `check` until it holds or `WAIT` elapses.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check().await
}
