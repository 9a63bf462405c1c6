//! Per-connection protocol state machine.
//!
//! ```text
//!   connect
//!      │
//!      ▼            valid token             join(doc)
//! Unauthenticated ─────────────► Authenticated ─────────► Joined{doc, ...}
//!      │ bad token                    ▲                       │ leave(last doc)
//!      ▼                              └── leave(doc), others  ▼ or transport close
//!    Closed ◄─────────────────────────────────────────────── Closed
//! ```
//!
//! The handler is transport-agnostic: the socket task feeds it decoded
//! bytes and drains its outbox. Joined documents are tracked as a set, so a
//! connection may edit several documents at once.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::auth::{unix_now, AuthError, TokenVerifier, DEFAULT_LEEWAY};
use crate::broadcast::{Outbound, Peer};
use crate::protocol::{ClientMessage, ConnectionId, DocumentId, ProtocolError, ServerMessage};
use crate::registry::SessionRegistry;
use crate::session::{DocumentSession, Origin};

/// Authentication state of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Unauthenticated,
    Authenticated { user_id: String, expires_at: u64 },
    Closed,
}

/// What the transport should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Close,
}

#[derive(Debug, Clone)]
pub struct ConnectionLimits {
    pub outbox_capacity: usize,
    pub max_frame_bytes: usize,
    /// Rejected frames tolerated before the connection is closed.
    pub max_protocol_errors: u32,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            outbox_capacity: 256,
            max_frame_bytes: 4 * 1024 * 1024,
            max_protocol_errors: 16,
        }
    }
}

pub struct ConnectionHandler {
    connection_id: ConnectionId,
    registry: Arc<SessionRegistry>,
    verifier: Arc<dyn TokenVerifier>,
    outbox: mpsc::Sender<Outbound>,
    kill: Arc<Notify>,
    phase: Phase,
    joined: HashMap<DocumentId, Arc<DocumentSession>>,
    protocol_errors: u32,
    limits: ConnectionLimits,
}

impl ConnectionHandler {
    /// Create a handler and the outbox receiver its transport must drain.
    pub fn new(
        registry: Arc<SessionRegistry>,
        verifier: Arc<dyn TokenVerifier>,
        limits: ConnectionLimits,
    ) -> (Self, mpsc::Receiver<Outbound>) {
        let (outbox, rx) = mpsc::channel(limits.outbox_capacity.max(1));
        let handler = Self {
            connection_id: Uuid::new_v4(),
            registry,
            verifier,
            outbox,
            kill: Arc::new(Notify::new()),
            phase: Phase::Unauthenticated,
            joined: HashMap::new(),
            protocol_errors: 0,
            limits,
        };
        (handler, rx)
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn user_id(&self) -> Option<&str> {
        match &self.phase {
            Phase::Authenticated { user_id, .. } => Some(user_id),
            _ => None,
        }
    }

    /// Notified when a document drops this connection as a slow consumer.
    pub fn kill_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.kill)
    }

    pub fn joined_documents(&self) -> impl Iterator<Item = &str> {
        self.joined.keys().map(String::as_str)
    }

    pub fn is_joined(&self, document_id: &str) -> bool {
        self.joined.contains_key(document_id)
    }

    /// Verify `token` and move to `Authenticated`. A different user cannot
    /// take over an authenticated connection.
    pub fn authenticate(&mut self, token: &str) -> Result<String, ProtocolError> {
        let identity = self.verifier.verify(token)?;
        match &self.phase {
            Phase::Closed => return Err(ProtocolError::ConnectionClosed),
            Phase::Authenticated { user_id, .. } if *user_id != identity.user_id => {
                return Err(ProtocolError::Forbidden(format!(
                    "connection belongs to {user_id}"
                )));
            }
            _ => {}
        }
        log::info!(
            "connection {} authenticated as {}",
            self.connection_id,
            identity.user_id
        );
        self.phase = Phase::Authenticated {
            user_id: identity.user_id.clone(),
            expires_at: identity.expires_at,
        };
        self.send(&ServerMessage::Authenticated {
            user_id: identity.user_id.clone(),
        })?;
        Ok(identity.user_id)
    }

    /// Decode and act on one inbound frame.
    pub async fn handle_frame(&mut self, bytes: &[u8]) -> Control {
        if self.phase == Phase::Closed {
            return Control::Close;
        }
        let msg = match ClientMessage::decode(bytes, self.limits.max_frame_bytes) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("connection {} sent a malformed frame: {e}", self.connection_id);
                return self.reject(e);
            }
        };
        self.handle_message(msg).await
    }

    pub async fn handle_message(&mut self, msg: ClientMessage) -> Control {
        if let Err(e) = self.check_expiry() {
            log::warn!("connection {}: {e}", self.connection_id);
            let _ = self.send(&ServerMessage::error(&e));
            return Control::Close;
        }

        let result = match msg {
            ClientMessage::Ping => self.send(&ServerMessage::Pong),
            ClientMessage::Authenticate { token } => match self.authenticate(&token) {
                Ok(_) => Ok(()),
                Err(e @ ProtocolError::AuthFailed(_)) if self.user_id().is_none() => {
                    log::warn!("connection {} failed authentication: {e}", self.connection_id);
                    let _ = self.send(&ServerMessage::error(&e));
                    return Control::Close;
                }
                Err(e) => Err(e),
            },
            ClientMessage::Join { document_id } => self.join(document_id).await,
            ClientMessage::Update { document_id, delta } => {
                match self.session_for(&document_id) {
                    Ok(session) => session
                        .apply_update(Origin::Connection(self.connection_id), delta)
                        .await
                        .map_err(ProtocolError::from),
                    Err(e) => Err(e),
                }
            }
            ClientMessage::Awareness { document_id, delta } => {
                match self.session_for(&document_id) {
                    Ok(session) => session
                        .apply_awareness(Origin::Connection(self.connection_id), &delta)
                        .await
                        .map_err(ProtocolError::from),
                    Err(e) => Err(e),
                }
            }
            ClientMessage::Leave { document_id } => {
                return match self.leave(&document_id).await {
                    Ok(control) => control,
                    Err(e) => self.reject(e),
                };
            }
        };

        match result {
            Ok(()) => Control::Continue,
            Err(ProtocolError::ConnectionClosed) => Control::Close,
            Err(e) => self.reject(e),
        }
    }

    async fn join(&mut self, document_id: DocumentId) -> Result<(), ProtocolError> {
        let user_id = self
            .user_id()
            .ok_or(ProtocolError::Unauthenticated)?
            .to_string();
        let peer = Peer {
            connection_id: self.connection_id,
            user_id,
            outbox: self.outbox.clone(),
            kill: Arc::clone(&self.kill),
        };
        let session = self.registry.join(&document_id, peer).await?;
        self.joined.insert(document_id, session);
        Ok(())
    }

    /// Detach from one document. Leaving the last joined document ends the
    /// connection.
    async fn leave(&mut self, document_id: &str) -> Result<Control, ProtocolError> {
        if self.user_id().is_none() {
            return Err(ProtocolError::Unauthenticated);
        }
        let session = self
            .joined
            .remove(document_id)
            .ok_or_else(|| ProtocolError::NotJoined(document_id.to_string()))?;
        self.registry.leave(&session, self.connection_id).await?;
        if self.joined.is_empty() {
            log::info!(
                "connection {} left its last document; closing",
                self.connection_id
            );
            return Ok(Control::Close);
        }
        Ok(Control::Continue)
    }

    fn session_for(&self, document_id: &str) -> Result<Arc<DocumentSession>, ProtocolError> {
        if self.user_id().is_none() {
            return Err(ProtocolError::Unauthenticated);
        }
        self.joined
            .get(document_id)
            .cloned()
            .ok_or_else(|| ProtocolError::NotJoined(document_id.to_string()))
    }

    fn check_expiry(&self) -> Result<(), ProtocolError> {
        if let Phase::Authenticated { expires_at, .. } = &self.phase {
            if expires_at.saturating_add(DEFAULT_LEEWAY.as_secs()) <= unix_now() {
                return Err(AuthError::Expired.into());
            }
        }
        Ok(())
    }

    /// Report a protocol error to the client. Too many of them close the
    /// connection.
    fn reject(&mut self, err: ProtocolError) -> Control {
        self.protocol_errors += 1;
        log::debug!(
            "connection {} protocol error #{}: {err}",
            self.connection_id,
            self.protocol_errors
        );
        if self.send(&ServerMessage::error(&err)).is_err() {
            return Control::Close;
        }
        if self.protocol_errors >= self.limits.max_protocol_errors {
            log::warn!(
                "closing connection {} after {} protocol errors",
                self.connection_id,
                self.protocol_errors
            );
            return Control::Close;
        }
        Control::Continue
    }

    /// Queue a frame for this connection only. A full outbox means the
    /// client cannot keep up, which closes the connection.
    pub fn send(&self, msg: &ServerMessage) -> Result<(), ProtocolError> {
        let frame = Arc::new(msg.encode()?);
        match self.outbox.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                log::warn!("outbox of connection {} is full", self.connection_id);
                self.kill.notify_one();
                Err(ProtocolError::ConnectionClosed)
            }
            Err(TrySendError::Closed(_)) => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Detach from every joined document. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.phase == Phase::Closed && self.joined.is_empty() {
            return;
        }
        for (document_id, session) in self.joined.drain() {
            if let Err(e) = self.registry.leave(&session, self.connection_id).await {
                log::error!(
                    "detaching connection {} from {document_id} failed: {e}",
                    self.connection_id
                );
            }
        }
        self.phase = Phase::Closed;
        log::info!("connection {} closed", self.connection_id);
    }
}
