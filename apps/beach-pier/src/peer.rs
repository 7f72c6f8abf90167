use std::net::SocketAddr;

use axum::extract::ws::Message;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::envelope::Envelope;

/// Lifecycle of a single accepted session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Registered,
    Closed,
}

/// Result of queueing one outbound frame for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// The peer's outbound queue is full; the frame was dropped.
    Full,
    /// The peer's writer has already gone away.
    Closed,
}

/// Non-owning, cloneable handle used to queue frames for a peer's writer.
#[derive(Clone, Debug)]
pub struct PeerHandle {
    connection_id: Uuid,
    tx: mpsc::Sender<Message>,
}

impl PeerHandle {
    pub fn new(connection_id: Uuid, tx: mpsc::Sender<Message>) -> Self {
        Self { connection_id, tx }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Queues a frame without waiting on the peer's socket.
    pub fn deliver(&self, message: Message) -> Delivery {
        match self.tx.try_send(message) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    pub fn deliver_envelope(&self, envelope: &Envelope) -> Delivery {
        match envelope.to_json() {
            Ok(json) => self.deliver(Message::Text(json)),
            Err(err) => {
                tracing::error!(error = %err, "failed to encode outbound envelope");
                Delivery::Closed
            }
        }
    }
}

/// One live session as seen by its lifecycle loop.
///
/// The socket itself stays with the lifecycle task; this only carries the
/// declared identity, the state machine and the outbound handle.
#[derive(Debug)]
pub struct PeerConnection {
    handle: PeerHandle,
    remote_addr: Option<SocketAddr>,
    identity: Option<String>,
    state: ConnectionState,
}

impl PeerConnection {
    pub fn new(handle: PeerHandle, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            handle,
            remote_addr,
            identity: None,
            state: ConnectionState::Connecting,
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.handle.connection_id()
    }

    pub fn handle(&self) -> &PeerHandle {
        &self.handle
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// `connecting -> registered`. Returns false (and changes nothing) from
    /// any other state.
    pub fn mark_registered(&mut self, identity: String) -> bool {
        if self.state != ConnectionState::Connecting {
            return false;
        }
        self.identity = Some(identity);
        self.state = ConnectionState::Registered;
        true
    }

    /// Moves to `closed` and returns the identity that must be unregistered,
    /// if the session had registered one. Idempotent.
    pub fn close(&mut self) -> Option<String> {
        let was_registered = self.state == ConnectionState::Registered;
        self.state = ConnectionState::Closed;
        if was_registered {
            self.identity.clone()
        } else {
            None
        }
    }
}
