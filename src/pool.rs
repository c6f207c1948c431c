//! Per-descriptor pool of reusable remote filesystem connections.
//!
//! Growth is demand-driven with no hard cap; concurrency is bounded in
//! practice by the executor that every dial goes through. Leases are scoped:
//! acquisition and release pair up on all exit paths, including errors, via
//! the [`Lease`] drop guard.

use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::bridge::{BridgeStatus, FsBridge};
use crate::error::CacheError;
use crate::fs::{FilesystemDescriptor, RemoteConnector, RemoteFilesystem};

/// Lifecycle state of one pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Slot exists but was never successfully dialed.
    NonInitialized,
    /// Dialed and idle; the next acquire may claim it.
    FreeInitialized,
    /// Claimed by a live lease.
    BusyOk,
    /// A lease observed an error on it; the next acquire re-dials it.
    BusyBad,
}

struct Slot {
    state: Mutex<SlotInner>,
}

struct SlotInner {
    state: ConnState,
    session: Option<Arc<dyn RemoteFilesystem>>,
}

/// Scoped claim on one pooled connection. Dropping the lease returns the
/// connection to the pool; [`poison`](Lease::poison) marks it for re-dial
/// instead.
pub struct Lease {
    slot: Arc<Slot>,
    session: Arc<dyn RemoteFilesystem>,
    poisoned: bool,
}

impl Lease {
    /// The dialed session this lease grants access to.
    #[must_use]
    pub fn filesystem(&self) -> &Arc<dyn RemoteFilesystem> {
        &self.session
    }

    /// Mark the underlying connection bad; it will be re-dialed before the
    /// pool hands it out again.
    pub fn poison(&mut self) {
        self.poisoned = true;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut inner = match self.slot.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.state = if self.poisoned {
            ConnState::BusyBad
        } else {
            ConnState::FreeInitialized
        };
    }
}

/// Pool of connections to one descriptor's filesystem.
pub struct ConnectionPool {
    descriptor: FilesystemDescriptor,
    connector: Arc<dyn RemoteConnector>,
    slots: Mutex<Vec<Arc<Slot>>>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    #[must_use]
    pub fn new(descriptor: FilesystemDescriptor, connector: Arc<dyn RemoteConnector>) -> Self {
        Self {
            descriptor,
            connector,
            slots: Mutex::new(Vec::new()),
        }
    }

    /// The descriptor this pool serves.
    #[must_use]
    pub fn descriptor(&self) -> &FilesystemDescriptor {
        &self.descriptor
    }

    /// Number of slots currently in the pool (any state).
    #[must_use]
    pub fn len(&self) -> usize {
        match self.slots.lock() {
            Ok(slots) => slots.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claim a free connection, flipping it busy. Returns `None` when no slot
    /// in the wanted state exists.
    fn try_claim(&self, wanted: ConnState) -> Option<(Arc<Slot>, Option<Arc<dyn RemoteFilesystem>>)> {
        let slots = match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for slot in slots.iter() {
            let mut inner = match slot.state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if inner.state == wanted {
                inner.state = ConnState::BusyOk;
                return Some((Arc::clone(slot), inner.session.clone()));
            }
        }
        None
    }

    /// Acquire a lease following the pool discipline:
    ///
    /// 1. prefer a free, initialized connection;
    /// 2. else re-dial any abnormal (bad / never-initialized) connection;
    /// 3. else grow the pool by one and claim the newcomer;
    /// 4. if dialing keeps failing, surface [`CacheError::NotReachable`].
    pub async fn acquire(&self, bridge: &FsBridge) -> Result<Lease, CacheError> {
        // Step 1: a free connection is ready to go.
        if let Some((slot, Some(session))) = self.try_claim(ConnState::FreeInitialized) {
            return Ok(Lease {
                slot,
                session,
                poisoned: false,
            });
        }

        // Step 2: resurrect an abnormal connection, if any. The slot is
        // claimed (BusyOk) before dialing so no other acquirer grabs it.
        for abnormal in [ConnState::BusyBad, ConnState::NonInitialized] {
            if let Some((slot, _stale)) = self.try_claim(abnormal) {
                match self.dial(bridge).await {
                    Ok(session) => {
                        info!(descriptor = %self.descriptor, "re-dialed abnormal pool connection");
                        let mut inner = match slot.state.lock() {
                            Ok(guard) => guard,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        inner.session = Some(Arc::clone(&session));
                        drop(inner);
                        return Ok(Lease {
                            slot,
                            session,
                            poisoned: false,
                        });
                    }
                    Err(e) => {
                        // Leave the slot bad for the next acquirer and give up
                        // — no dial retries beyond what the bridge already did.
                        let mut inner = match slot.state.lock() {
                            Ok(guard) => guard,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        inner.state = ConnState::BusyBad;
                        drop(inner);
                        warn!(descriptor = %self.descriptor, error = %e, "re-dial failed");
                        return Err(e);
                    }
                }
            }
        }

        // Step 3: every slot is busy; grow the pool.
        info!(descriptor = %self.descriptor, "no free connection, dialing a new one");
        let session = self.dial(bridge).await?;
        let slot = Arc::new(Slot {
            state: Mutex::new(SlotInner {
                state: ConnState::BusyOk,
                session: Some(Arc::clone(&session)),
            }),
        });
        {
            let mut slots = match self.slots.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            slots.push(Arc::clone(&slot));
        }
        Ok(Lease {
            slot,
            session,
            poisoned: false,
        })
    }

    async fn dial(&self, bridge: &FsBridge) -> Result<Arc<dyn RemoteFilesystem>, CacheError> {
        let result = bridge.connect(&self.connector, &self.descriptor, "/").await;
        match (result.status, result.value) {
            (BridgeStatus::Ok, Some(session)) => Ok(session),
            _ => Err(CacheError::NotReachable(self.descriptor.uri())),
        }
    }
}
