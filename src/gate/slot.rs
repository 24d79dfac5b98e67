use crate::error::SupervisorError;
use crate::host_api::storage::Partition;
use crate::types::PendingPermissionRequest;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, warn};
use uuid::Uuid;

/// Well-known key of the pending request in the Supervisor partition.
pub const ACTIVE_REQUEST_KEY: &str = "active_oauth_request";

/// Single-slot store for the pending permission request.
///
/// Holding a [`SlotGuard`] is the only way to have a record stored; a second
/// writer waits on the permit until the first guard is dropped.
pub struct PendingRequestStore {
    partition: Partition,
    permit: Semaphore,
}

impl PendingRequestStore {
    pub fn new(partition: Partition) -> Self {
        // A record left behind by a previous process has no one waiting on it.
        match partition.get(ACTIVE_REQUEST_KEY) {
            Ok(Some(_)) => {
                warn!("discarding stale pending permission request");
                if let Err(e) = partition.remove(ACTIVE_REQUEST_KEY) {
                    warn!(error = %e, "failed to remove stale permission request");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to read pending permission request"),
        }
        Self {
            partition,
            permit: Semaphore::new(1),
        }
    }

    /// Waits for the slot, then persists `request`.
    pub async fn create(
        &self,
        request: &PendingPermissionRequest,
    ) -> Result<SlotGuard<'_>, SupervisorError> {
        let permit = self
            .permit
            .acquire()
            .await
            .map_err(|_| SupervisorError::Storage("permission slot closed".into()))?;
        self.partition.set_json(ACTIVE_REQUEST_KEY, request)?;
        debug!(id = %request.id, "stored pending permission request");
        Ok(SlotGuard {
            store: self,
            _permit: permit,
        })
    }

    pub fn read(&self) -> Result<Option<PendingPermissionRequest>, SupervisorError> {
        self.partition.get_json(ACTIVE_REQUEST_KEY)
    }

    /// The stored record, if its id is `id`.
    pub fn read_matching(&self, id: &Uuid) -> Result<PendingPermissionRequest, SupervisorError> {
        match self.read()? {
            Some(record) if record.id == *id => Ok(record),
            Some(_) => Err(SupervisorError::ForgedRequest(format!(
                "request {} is not the pending request",
                id
            ))),
            None => Err(SupervisorError::ForgedRequest(format!(
                "no permission request is pending (got {})",
                id
            ))),
        }
    }

    pub fn delete(&self) -> Result<(), SupervisorError> {
        self.partition.remove(ACTIVE_REQUEST_KEY)
    }
}

/// Owns the slot; deletes the record when dropped.
pub struct SlotGuard<'a> {
    store: &'a PendingRequestStore,
    _permit: SemaphorePermit<'a>,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.store.delete() {
            warn!(error = %e, "failed to delete pending permission request");
        }
    }
}
