//! Per-call-chain stack of executing services.
//!
//! One [`CallContext`] exists per top-level call and is threaded explicitly
//! through every nested dispatch and host call of that chain, so concurrent
//! chains never see each other's frames.

use crate::error::SupervisorError;
use crate::runtime::locks::ChainId;
use crate::types::{Origination, QualifiedPluginId, ServiceId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

static NEXT_CHAIN: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub service: ServiceId,
    pub plugin: String,
    pub intf: String,
    pub method: String,
}

impl Frame {
    pub fn new(target: &QualifiedPluginId, intf: &str, method: &str) -> Self {
        Self {
            service: target.service.clone(),
            plugin: target.plugin.clone(),
            intf: intf.to_string(),
            method: method.to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct CallStack {
    frames: Vec<Frame>,
}

impl CallStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a frame unless its service is already executing.
    pub fn push(&mut self, frame: Frame) -> Result<(), SupervisorError> {
        if self.contains(&frame.service) {
            let mut path: Vec<&str> = self.frames.iter().map(|f| f.service.as_str()).collect();
            path.push(frame.service.as_str());
            return Err(SupervisorError::CyclicCall(path.join(" -> ")));
        }
        self.frames.push(frame);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    pub fn top(&self) -> Option<&Frame> {
        self.frames.last()
    }

    /// The frame that called the top frame.
    pub fn below_top(&self) -> Option<&Frame> {
        self.frames.len().checked_sub(2).map(|i| &self.frames[i])
    }

    pub fn contains(&self, service: &ServiceId) -> bool {
        self.frames.iter().any(|f| &f.service == service)
    }

    pub fn services(&self) -> Vec<String> {
        self.frames.iter().map(|f| f.service.to_string()).collect()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[derive(Debug)]
pub struct CallContext {
    chain: ChainId,
    origination: Origination,
    stack: Mutex<CallStack>,
}

impl CallContext {
    pub fn new(origination: Origination) -> Arc<Self> {
        Arc::new(Self {
            chain: NEXT_CHAIN.fetch_add(1, Ordering::Relaxed),
            origination,
            stack: Mutex::new(CallStack::new()),
        })
    }

    pub fn chain(&self) -> ChainId {
        self.chain
    }

    fn stack(&self) -> MutexGuard<'_, CallStack> {
        self.stack.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn origination(&self) -> &Origination {
        &self.origination
    }

    /// Pushes `frame`; it is popped when the returned guard drops.
    pub fn enter(self: &Arc<Self>, frame: Frame) -> Result<FrameGuard, SupervisorError> {
        self.stack().push(frame)?;
        Ok(FrameGuard { ctx: self.clone() })
    }

    /// Who a call issued right now is attributed to: the executing service,
    /// or the top-level app when nothing is executing yet.
    pub fn sender(&self) -> String {
        self.stack()
            .top()
            .map(|f| f.service.to_string())
            .unwrap_or_else(|| self.origination.app.clone())
    }

    /// Who called the executing service.
    pub fn caller_of_top(&self) -> String {
        self.stack()
            .below_top()
            .map(|f| f.service.to_string())
            .unwrap_or_else(|| self.origination.app.clone())
    }

    pub fn top(&self) -> Option<Frame> {
        self.stack().top().cloned()
    }

    pub fn services(&self) -> Vec<String> {
        self.stack().services()
    }

    pub fn depth(&self) -> usize {
        self.stack().depth()
    }
}

#[must_use]
pub struct FrameGuard {
    ctx: Arc<CallContext>,
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        self.ctx.stack().pop();
    }
}
