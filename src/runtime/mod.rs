//! Component Runtime
//!
//! Executes service components with wasmtime. A component is a core
//! WebAssembly module exporting `memory` and functions named
//! `{intf}::{method}` with the signature
//! `(in_ptr, in_len, out_ptr, out_cap) -> out_len`.
//!
//! The first page of a component's memory is laid out as:
//!
//! ```text
//!  0       4K                16K               32K                64K
//!  ├───────┼─────────────────┼─────────────────┼──────────────────┤
//!  │ data  │ call input      │ host results    │ call output      │
//!  └───────┴─────────────────┴─────────────────┴──────────────────┘
//! ```
//!
//! Components keep their own static data below 4K.

mod host;
pub mod interface_check;
mod loader;
pub mod locks;
mod wasi;

pub use host::{
    encode_result, AsyncCtx, Ctx, ErrorHandler, HostFunctionError, HostFunctionErrorKind,
    HostFunctionProvider, HostLinkerBuilder, InterfaceBuilder, LinkerError,
};
pub use interface_check::{classify_import, exported_functions, ImportClass, LinkPlan, ProxyImport};
pub use loader::{ComponentInterface, ComponentLoader, LoadedComponent, SharedInstance};
pub use wasi::{WasiShim, WASI_FUNCTIONS, WASI_MODULE};

use crate::dispatch::CallContext;
use crate::error::SupervisorError;
use crate::host_api::HostOp;
use crate::types::{QualifiedPluginId, ServiceId};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Weak};
use tracing::debug;
use wasmtime::{Config, Engine, Instance, Store};

pub const INPUT_BUFFER_OFFSET: usize = 4 * 1024;
pub const INPUT_BUFFER_CAPACITY: usize = 12 * 1024;
pub const HOST_RESULT_OFFSET: usize = 16 * 1024;
pub const HOST_RESULT_CAPACITY: usize = 16 * 1024;
pub const OUTPUT_BUFFER_OFFSET: usize = 32 * 1024;
pub const OUTPUT_BUFFER_CAPACITY: usize = 32 * 1024;

/// Creates an engine with async support, required so a host import can
/// suspend on a nested dispatch.
pub fn new_engine() -> Result<Engine, SupervisorError> {
    let mut config = Config::new();
    config.async_support(true);
    Engine::new(&config).map_err(|e| SupervisorError::Instantiate(format!("engine: {:#}", e)))
}

/// What a component reaches through its imports.
///
/// Implemented by the dispatcher. Host functions hold it weakly so an
/// instance never keeps the Supervisor alive.
#[async_trait]
pub trait HostBackend: Send + Sync {
    async fn host_call(
        &self,
        op: HostOp,
        ctx: Arc<CallContext>,
        input: Value,
    ) -> Result<Value, SupervisorError>;

    async fn plugin_call(
        &self,
        ctx: Arc<CallContext>,
        target: QualifiedPluginId,
        intf: String,
        method: String,
        params: Value,
    ) -> Result<Value, SupervisorError>;
}

/// Store data of every component.
#[derive(Clone)]
pub struct HostContext {
    service: ServiceId,
    backend: Weak<dyn HostBackend>,
    call: Option<Arc<CallContext>>,
}

impl HostContext {
    pub fn new(service: ServiceId, backend: Weak<dyn HostBackend>) -> Self {
        Self {
            service,
            backend,
            call: None,
        }
    }

    pub fn service(&self) -> &ServiceId {
        &self.service
    }

    fn active(&self) -> Result<(Arc<dyn HostBackend>, Arc<CallContext>), SupervisorError> {
        let backend = self
            .backend
            .upgrade()
            .ok_or_else(|| SupervisorError::Transport("supervisor has shut down".into()))?;
        // Only the start function runs outside a dispatch.
        let call = self.call.clone().ok_or_else(|| {
            SupervisorError::Validation(format!(
                "{} used an import while being instantiated",
                self.service
            ))
        })?;
        Ok((backend, call))
    }

    pub async fn host_call(&self, op: HostOp, input: Value) -> Result<Value, SupervisorError> {
        let (backend, call) = self.active()?;
        backend.host_call(op, call, input).await
    }

    pub async fn plugin_call(
        &self,
        target: QualifiedPluginId,
        intf: String,
        method: String,
        params: Value,
    ) -> Result<Value, SupervisorError> {
        let (backend, call) = self.active()?;
        backend.plugin_call(call, target, intf, method, params).await
    }
}

/// Describes an execution error, preferring the trap code.
pub(crate) fn describe_error(e: &wasmtime::Error) -> String {
    match e.downcast_ref::<wasmtime::Trap>() {
        Some(trap) => trap.to_string(),
        None => format!("{:#}", e),
    }
}

/// A linked, instantiated component with its own store.
pub struct ComponentInstance {
    id: QualifiedPluginId,
    store: Store<HostContext>,
    instance: Instance,
}

impl ComponentInstance {
    pub(crate) fn new(id: QualifiedPluginId, store: Store<HostContext>, instance: Instance) -> Self {
        Self { id, store, instance }
    }

    pub fn id(&self) -> &QualifiedPluginId {
        &self.id
    }

    /// Calls `export` with `params` on behalf of the chain in `ctx`.
    pub async fn call(
        &mut self,
        ctx: Arc<CallContext>,
        export: &str,
        params: &[Value],
    ) -> Result<Value, SupervisorError> {
        let func = interface_check::check_export(&mut self.store, &self.instance, export)
            .map_err(|e| SupervisorError::from_kind(e.kind(), format!("{}: {}", self.id, e.message())))?;

        let input = serde_json::to_vec(params)
            .map_err(|e| SupervisorError::Validation(format!("params: {}", e)))?;
        if input.len() > INPUT_BUFFER_CAPACITY {
            return Err(SupervisorError::Validation(format!(
                "params of {} bytes exceed {} bytes",
                input.len(),
                INPUT_BUFFER_CAPACITY
            )));
        }

        let memory = self
            .instance
            .get_memory(&mut self.store, "memory")
            .ok_or_else(|| SupervisorError::Instantiate(format!("{} has no memory export", self.id)))?;
        memory
            .write(&mut self.store, INPUT_BUFFER_OFFSET, &input)
            .map_err(|e| SupervisorError::Trap(format!("{}: writing input: {}", self.id, e)))?;

        debug!(plugin = %self.id, export, "calling component");
        self.store.data_mut().call = Some(ctx);
        let outcome = func
            .call_async(
                &mut self.store,
                (
                    INPUT_BUFFER_OFFSET as i32,
                    input.len() as i32,
                    OUTPUT_BUFFER_OFFSET as i32,
                    OUTPUT_BUFFER_CAPACITY as i32,
                ),
            )
            .await;
        self.store.data_mut().call = None;

        let out_len = outcome.map_err(|e| {
            SupervisorError::Trap(format!("{} {}: {}", self.id, export, describe_error(&e)))
        })?;
        if out_len < 0 {
            return Err(SupervisorError::Plugin(format!(
                "{} {} failed with code {}",
                self.id, export, out_len
            )));
        }
        let out_len = out_len as usize;
        if out_len > OUTPUT_BUFFER_CAPACITY {
            return Err(SupervisorError::Plugin(format!(
                "{} {} returned {} bytes, more than the {} byte buffer",
                self.id, export, out_len, OUTPUT_BUFFER_CAPACITY
            )));
        }

        let mut output = vec![0u8; out_len];
        memory
            .read(&self.store, OUTPUT_BUFFER_OFFSET, &mut output)
            .map_err(|e| SupervisorError::Trap(format!("{}: reading output: {}", self.id, e)))?;
        if output.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&output).map_err(|e| {
            SupervisorError::Plugin(format!("{} {} returned invalid JSON: {}", self.id, export, e))
        })
    }
}
