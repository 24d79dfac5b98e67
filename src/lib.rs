//! Supervisor: a broker for WebAssembly service plugins
//!
//! Applications never talk to service components directly. They send
//! function calls to the Supervisor, which loads the target component on
//! first use, tracks who is calling whom, and holds sensitive calls until
//! the user approves them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  bridge   ┌───────────────────────────────────────────┐
//! │  app frame   │◄─────────►│                Supervisor                 │
//! └──────────────┘           │                                           │
//! ┌──────────────┐  bridge   │  dispatch  - routing, call stack          │
//! │ prompt frame │◄─────────►│  gate      - approvals, pending request   │
//! └──────────────┘           │  runtime   - loading, linking, execution  │
//!                            │  host_api  - storage, keys, network       │
//!                            ├───────────────────────────────────────────┤
//!                            │        WASM Execution (wasmtime)          │
//!                            └───────────────────────────────────────────┘
//! ```
//!
//! ## Components
//!
//! A component is a core WebAssembly module. It exports `memory` and one
//! function per method, named `{intf}::{method}`, taking a JSON array of
//! parameters and writing a JSON result. It may import:
//!
//! - `host:common/api`: the privileged host operations ([`host_api::HostOp`])
//! - `wasi_snapshot_preview1`: a minimal WASI shim
//! - `{service}:{plugin}/{intf}`: methods of other plugins, dispatched
//!   through the Supervisor as nested calls

pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gate;
pub mod host_api;
pub mod origin;
pub mod runtime;
pub mod types;

pub use bridge::{BridgeEndpoint, BridgeError, BridgePromptSurface, BridgeRequest};
pub use config::SupervisorConfig;
pub use dispatch::{Supervisor, SupervisorBuilder};
pub use error::{ErrorKind, ErrorPayload, SupervisorError};
pub use gate::{PermissionGate, PromptSurface};
pub use types::{
    ApprovalDuration, FunctionCallArgs, Origination, PendingPermissionRequest, PromptParams,
    QualifiedPluginId, ServiceId,
};
