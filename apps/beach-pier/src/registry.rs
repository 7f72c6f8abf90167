use std::{
    collections::{hash_map::Entry, HashMap},
    sync::Arc,
};

use metrics::{counter, gauge};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::{
    envelope::Envelope,
    peer::{Delivery, PeerHandle},
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("identity {0:?} is already in use")]
    DuplicateIdentity(String),
    #[error("no peer registered as {0:?}")]
    NotFound(String),
}

/// Identity -> live connection map shared by every session.
///
/// The lock is only ever held for the map access itself; outbound frames are
/// queued after it has been released.
#[derive(Clone, Default)]
pub struct PeerRegistry {
    inner: Arc<parking_lot::RwLock<HashMap<String, PeerHandle>>>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
    pub closed: usize,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, identity: &str, handle: PeerHandle) -> Result<(), RegistryError> {
        let registered = {
            let mut guard = self.inner.write();
            match guard.entry(identity.to_string()) {
                Entry::Occupied(_) => {
                    return Err(RegistryError::DuplicateIdentity(identity.to_string()))
                }
                Entry::Vacant(entry) => {
                    entry.insert(handle);
                }
            }
            guard.len()
        };
        gauge!("beach_pier_peers_registered", registered as f64);
        Ok(())
    }

    /// Removes `identity` if it is still held by `connection_id`. Returns
    /// whether an entry was removed; absence is not an error.
    pub fn unregister(&self, identity: &str, connection_id: Uuid) -> bool {
        let (removed, registered) = {
            let mut guard = self.inner.write();
            let owned = guard
                .get(identity)
                .is_some_and(|handle| handle.connection_id() == connection_id);
            if owned {
                guard.remove(identity);
            }
            (owned, guard.len())
        };
        gauge!("beach_pier_peers_registered", registered as f64);
        removed
    }

    pub fn lookup(&self, identity: &str) -> Result<PeerHandle, RegistryError> {
        self.inner
            .read()
            .get(identity)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(identity.to_string()))
    }

    /// Point-in-time set of registered identities, sorted.
    pub fn snapshot(&self) -> Vec<String> {
        let mut identities: Vec<String> = self.inner.read().keys().cloned().collect();
        identities.sort_unstable();
        identities
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Sends the current `user-list` to every registered peer.
    ///
    /// Identities and handles are captured under one read of the lock so the
    /// list each peer receives matches the set of peers it was sent to.
    pub fn broadcast_roster(&self) -> BroadcastReport {
        let (identities, targets) = {
            let guard = self.inner.read();
            let mut identities: Vec<String> = guard.keys().cloned().collect();
            let targets: Vec<PeerHandle> = guard.values().cloned().collect();
            identities.sort_unstable();
            (identities, targets)
        };

        let mut report = BroadcastReport::default();
        let envelope = Envelope::user_list(identities);
        for target in targets {
            match target.deliver_envelope(&envelope) {
                Delivery::Queued => report.delivered += 1,
                Delivery::Full => {
                    report.dropped += 1;
                    counter!("beach_pier_outbound_dropped_total", 1, "reason" => "queue_full");
                }
                Delivery::Closed => {
                    report.closed += 1;
                    debug!(
                        connection_id = %target.connection_id(),
                        "skipping broadcast to closed peer"
                    );
                }
            }
        }
        counter!("beach_pier_broadcasts_total", 1);
        report
    }
}
