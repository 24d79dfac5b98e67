//! Permission Gate
//!
//! Suspends a gated call until the user decides on it.
//!
//! ```text
//!  NoRequest ──request_permission──► RequestPending ──accept/deny/expiry──► NoRequest
//!                                        │
//!                                        ├─ record stored under "active_oauth_request"
//!                                        └─ prompt surface opened for the callee
//! ```
//!
//! Only one request is pending at a time. A second request waits for the
//! slot instead of replacing the first, so a prompt can never be answered
//! on behalf of a request the user did not see.

mod grants;
mod slot;

pub use grants::GrantStore;
pub use slot::{PendingRequestStore, SlotGuard, ACTIVE_REQUEST_KEY};

use crate::error::SupervisorError;
use crate::host_api::storage::Partition;
use crate::types::{ApprovalDuration, PendingPermissionRequest, PromptParams, SUPERVISOR_SERVICE};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;

/// Where the user is asked. Opening returns as soon as the prompt is
/// showing; the answer arrives later through [`PermissionGate::accept`] or
/// [`PermissionGate::deny`].
#[async_trait]
pub trait PromptSurface: Send + Sync {
    async fn open(&self, params: PromptParams) -> Result<(), SupervisorError>;
}

/// Used when no prompt surface is attached: every gated call is denied.
pub struct NoPromptSurface;

#[async_trait]
impl PromptSurface for NoPromptSurface {
    async fn open(&self, _params: PromptParams) -> Result<(), SupervisorError> {
        Err(SupervisorError::Transport("no prompt surface attached".into()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionRequest {
    pub user: Option<String>,
    pub caller: String,
    pub callee: String,
    pub method: String,
    pub prompt: String,
    pub subpath: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Accept,
    Deny,
}

pub struct PermissionGate {
    pending: PendingRequestStore,
    grants: GrantStore,
    prompt: Arc<dyn PromptSurface>,
    waiting: Mutex<Option<(Uuid, oneshot::Sender<Decision>)>>,
    timeout: Duration,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl PermissionGate {
    pub fn new(partition: Partition, prompt: Arc<dyn PromptSurface>, timeout: Duration) -> Self {
        Self {
            pending: PendingRequestStore::new(partition.clone()),
            grants: GrantStore::new(partition),
            prompt,
            waiting: Mutex::new(None),
            timeout,
        }
    }

    pub fn grants(&self) -> &GrantStore {
        &self.grants
    }

    /// The stored pending request, if any.
    pub fn pending(&self) -> Result<Option<PendingPermissionRequest>, SupervisorError> {
        self.pending.read()
    }

    fn waiting(&self) -> MutexGuard<'_, Option<(Uuid, oneshot::Sender<Decision>)>> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_waiting(&self, id: Uuid) -> Option<oneshot::Sender<Decision>> {
        let mut waiting = self.waiting();
        match waiting.take() {
            Some((waiting_id, tx)) if waiting_id == id => Some(tx),
            other => {
                *waiting = other;
                None
            }
        }
    }

    /// Asks the user and waits for the answer. `Ok` means approved.
    pub async fn request_permission(
        &self,
        request: PermissionRequest,
    ) -> Result<(), SupervisorError> {
        let id = Uuid::new_v4();
        let record = PendingPermissionRequest {
            id,
            user: request.user.clone(),
            method: request.method.clone(),
            prompt: request.prompt.clone(),
            caller: request.caller.clone(),
            callee: request.callee.clone(),
            subpath: request.subpath.clone(),
            expiry: unix_now().saturating_add(self.timeout.as_secs().max(1)),
        };

        let guard = self.pending.create(&record).await?;
        let (tx, mut rx) = oneshot::channel();
        *self.waiting() = Some((id, tx));
        info!(
            %id,
            caller = %request.caller,
            callee = %request.callee,
            method = %request.method,
            "permission request pending"
        );

        let params = PromptParams {
            id,
            caller: request.caller.clone(),
            callee: request.callee.clone(),
            prompt: request.prompt.clone(),
            subpath: request.subpath.clone(),
        };
        if let Err(e) = self.prompt.open(params).await {
            self.take_waiting(id);
            drop(guard);
            warn!(%id, error = %e, "failed to open permission prompt");
            return Err(SupervisorError::PermissionDenied(format!(
                "prompt could not be opened: {}",
                e.message()
            )));
        }

        let decision = match tokio::time::timeout(self.timeout, &mut rx).await {
            Ok(decision) => decision.ok(),
            Err(_) => {
                if self.take_waiting(id).is_some() {
                    warn!(%id, "permission request expired");
                    None
                } else {
                    // Resolved while the timer fired.
                    rx.await.ok()
                }
            }
        };
        drop(guard);

        match decision {
            Some(Decision::Accept) => {
                info!(%id, "permission granted");
                Ok(())
            }
            Some(Decision::Deny) => {
                info!(%id, "permission denied");
                Err(SupervisorError::PermissionDenied(format!(
                    "{} may not call {} {}",
                    request.caller, request.callee, request.method
                )))
            }
            None => Err(SupervisorError::PermissionDenied(format!(
                "no decision for {} calling {} {}",
                request.caller, request.callee, request.method
            ))),
        }
    }

    /// Only the callee's own context (the prompt surface) or the Supervisor
    /// may read or resolve a request.
    fn check_resolver(
        record: &PendingPermissionRequest,
        resolver: &str,
    ) -> Result<(), SupervisorError> {
        if resolver == record.callee || resolver == SUPERVISOR_SERVICE {
            Ok(())
        } else {
            Err(SupervisorError::ForgedRequest(format!(
                "{} may not resolve requests for {}",
                resolver, record.callee
            )))
        }
    }

    pub fn get_pending(
        &self,
        id: Uuid,
        resolver: &str,
    ) -> Result<PendingPermissionRequest, SupervisorError> {
        let record = self.pending.read_matching(&id)?;
        Self::check_resolver(&record, resolver)?;
        Ok(record)
    }

    pub fn accept(
        &self,
        id: Uuid,
        duration: ApprovalDuration,
        resolver: &str,
    ) -> Result<(), SupervisorError> {
        self.resolve(id, resolver, Some(duration))
    }

    pub fn deny(&self, id: Uuid, resolver: &str) -> Result<(), SupervisorError> {
        self.resolve(id, resolver, None)
    }

    fn resolve(
        &self,
        id: Uuid,
        resolver: &str,
        accepted: Option<ApprovalDuration>,
    ) -> Result<(), SupervisorError> {
        let record = self.pending.read_matching(&id)?;
        Self::check_resolver(&record, resolver)?;
        let tx = self.take_waiting(id).ok_or_else(|| {
            SupervisorError::ForgedRequest(format!("request {} has no waiting call", id))
        })?;

        let decision = match accepted {
            Some(duration) => {
                if let Err(e) = self.grants.record(&record.caller, &record.callee, duration) {
                    let _ = tx.send(Decision::Deny);
                    return Err(e);
                }
                Decision::Accept
            }
            None => Decision::Deny,
        };
        if let Err(e) = self.pending.delete() {
            warn!(%id, error = %e, "failed to delete resolved permission request");
        }
        let _ = tx.send(decision);
        Ok(())
    }
}
