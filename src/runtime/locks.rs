//! Which call chain holds which component instance.
//!
//! A chain holds an instance for as long as one of its calls is inside it,
//! including while a nested call waits at the permission gate. Waiting for
//! an instance whose holder is itself waiting, directly or through other
//! chains, on an instance this chain holds would never finish, so such a
//! wait is refused.

use crate::error::SupervisorError;
use crate::types::QualifiedPluginId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Identifies one top-level call and everything it dispatches.
pub type ChainId = u64;

/// Identifies one instantiation; a reloaded plugin gets a new key.
pub type InstanceKey = u64;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

pub fn next_instance_key() -> InstanceKey {
    NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed)
}

#[derive(Default)]
struct WaitGraph {
    holders: HashMap<InstanceKey, ChainId>,
    waiting: HashMap<ChainId, (InstanceKey, QualifiedPluginId)>,
}

#[derive(Default)]
pub struct InstanceLocks {
    graph: Mutex<WaitGraph>,
}

impl InstanceLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn graph(&self) -> MutexGuard<'_, WaitGraph> {
        self.graph.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Chain currently inside `key`.
    pub fn holder(&self, key: InstanceKey) -> Option<ChainId> {
        self.graph().holders.get(&key).copied()
    }

    /// Records `chain` as the holder of `key` until the guard drops.
    pub fn hold(self: &Arc<Self>, key: InstanceKey, chain: ChainId) -> HoldGuard {
        self.graph().holders.insert(key, chain);
        HoldGuard {
            locks: self.clone(),
            key,
            chain,
        }
    }

    /// Records that `chain` waits for `key` (named `id`) until the guard
    /// drops. Fails with `CyclicCall` when the wait closes a cycle.
    pub fn wait(
        self: &Arc<Self>,
        key: InstanceKey,
        id: &QualifiedPluginId,
        chain: ChainId,
    ) -> Result<WaitGuard, SupervisorError> {
        let mut graph = self.graph();

        let mut path = vec![id.to_string()];
        let mut next = key;
        // Each step follows a distinct waiting chain, so the walk is bounded.
        for _ in 0..=graph.waiting.len() {
            let Some(&holder) = graph.holders.get(&next) else {
                break;
            };
            if holder == chain {
                path.insert(0, format!("chain {}", chain));
                return Err(SupervisorError::CyclicCall(format!(
                    "waiting would deadlock: {}",
                    path.join(" -> ")
                )));
            }
            let Some((key, id)) = graph.waiting.get(&holder) else {
                break;
            };
            path.push(id.to_string());
            next = *key;
        }

        graph.waiting.insert(chain, (key, id.clone()));
        Ok(WaitGuard {
            locks: self.clone(),
            chain,
        })
    }
}

#[must_use]
pub struct HoldGuard {
    locks: Arc<InstanceLocks>,
    key: InstanceKey,
    chain: ChainId,
}

impl Drop for HoldGuard {
    fn drop(&mut self) {
        let mut graph = self.locks.graph();
        if graph.holders.get(&self.key) == Some(&self.chain) {
            graph.holders.remove(&self.key);
        }
    }
}

#[must_use]
pub struct WaitGuard {
    locks: Arc<InstanceLocks>,
    chain: ChainId,
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        self.locks.graph().waiting.remove(&self.chain);
    }
}
