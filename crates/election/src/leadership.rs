use async_trait::async_trait;
use blotter_store::LeaseStore;
use blotter_types::{Clock, Leadership, NodeIdentity};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Leadership gate backed by the lease row.
///
/// The cached mastership flag is checked first so non-masters never touch the
/// database; a master then rereads the lease so that a takeover the local
/// coordinator has not noticed yet still blocks the side effect.
pub struct LeaseLeadership<S> {
    store: Arc<S>,
    identity: NodeIdentity,
    lock_name: String,
    clock: Arc<dyn Clock>,
    mastership: watch::Receiver<bool>,
}

impl<S: LeaseStore> LeaseLeadership<S> {
    pub fn new(
        store: Arc<S>,
        identity: NodeIdentity,
        lock_name: String,
        clock: Arc<dyn Clock>,
        mastership: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            identity,
            lock_name,
            clock,
            mastership,
        }
    }
}

#[async_trait]
impl<S: LeaseStore + 'static> Leadership for LeaseLeadership<S> {
    async fn confirm(&self) -> bool {
        if !*self.mastership.borrow() {
            return false;
        }

        match self
            .store
            .get_current_master(&self.lock_name, self.clock.now())
            .await
        {
            Ok(Some(lease)) if lease.is_held_by(&self.identity) => true,
            Ok(other) => {
                debug!(
                    node = %self.identity,
                    holder = ?other.map(|l| l.held_by_user),
                    "Leadership not confirmed by lease"
                );
                false
            }
            Err(e) => {
                warn!(node = %self.identity, error = %e, "Leadership check failed");
                false
            }
        }
    }
}

/// Read side of the `MastershipChanged` signal
#[derive(Debug, Clone)]
pub struct MastershipHandle {
    rx: watch::Receiver<bool>,
}

impl MastershipHandle {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    pub fn is_master(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait for the next change and return the new value.
    ///
    /// Returns `None` once the coordinator is gone.
    pub async fn changed(&mut self) -> Option<bool> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }
}
