use crate::error::SupervisorError;
use crate::host_api::storage::Partition;
use crate::types::ApprovalDuration;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Approvals already given for `(caller, callee)` pairs.
pub struct GrantStore {
    session: Mutex<HashSet<(String, String)>>,
    partition: Partition,
}

fn grant_key(caller: &str, callee: &str) -> String {
    format!("grant:{}:{}", caller, callee)
}

impl GrantStore {
    pub fn new(partition: Partition) -> Self {
        Self {
            session: Mutex::new(HashSet::new()),
            partition,
        }
    }

    fn session(&self) -> MutexGuard<'_, HashSet<(String, String)>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(
        &self,
        caller: &str,
        callee: &str,
        duration: ApprovalDuration,
    ) -> Result<(), SupervisorError> {
        match duration {
            ApprovalDuration::Session => {
                self.session()
                    .insert((caller.to_string(), callee.to_string()));
                Ok(())
            }
            ApprovalDuration::Permanent => {
                self.partition.set_json(&grant_key(caller, callee), &true)
            }
        }
    }

    pub fn is_granted(&self, caller: &str, callee: &str) -> Result<bool, SupervisorError> {
        if self
            .session()
            .contains(&(caller.to_string(), callee.to_string()))
        {
            return Ok(true);
        }
        Ok(self
            .partition
            .get_json::<bool>(&grant_key(caller, callee))?
            .unwrap_or(false))
    }

    /// Forgets both kinds of grant for the pair.
    pub fn revoke(&self, caller: &str, callee: &str) -> Result<(), SupervisorError> {
        self.session()
            .remove(&(caller.to_string(), callee.to_string()));
        self.partition.remove(&grant_key(caller, callee))
    }

    pub fn clear_session(&self) {
        self.session().clear();
    }
}
