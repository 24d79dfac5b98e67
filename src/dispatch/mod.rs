//! Call Router
//!
//! Every call into a component goes through [`Supervisor::function_call`]
//! (top level, from a frame) or a proxy import (nested, from another
//! component). Both end in the same dispatch:
//!
//! ```text
//!  resolve alias ─► push frame ─► gate? ─► load ─► call export ─► pop
//!                   (cycle check)                  (instance lock)
//! ```
//!
//! A dispatch waiting at the gate holds only the instances its own chain
//! is executing in; unrelated calls keep running. With a transaction
//! plugin configured, each top-level call runs between its
//! `admin::startTx` and `admin::finishTx`.

pub mod call_stack;

pub use call_stack::{CallContext, CallStack, Frame, FrameGuard};

use crate::bridge::{channel, BridgeEndpoint, BridgeRequest, RequestContext};
use crate::config::{FunctionRef, SupervisorConfig};
use crate::error::{ErrorKind, ErrorPayload, SupervisorError};
use crate::gate::{NoPromptSurface, PermissionGate, PermissionRequest, PromptSurface};
use crate::host_api::http::{HttpClient, ReqwestClient};
use crate::host_api::storage::{KvStore, MemoryKvStore, Partition};
use crate::host_api::{HostApi, HostOp};
use crate::origin::OriginFamily;
use crate::runtime::{new_engine, ComponentLoader, HostBackend};
use crate::types::{
    ApprovalDuration, FunctionCallArgs, FunctionCallRequest, Origination, PendingPermissionRequest,
    QualifiedPluginId, DEFAULT_PLUGIN, SUPERVISOR_SERVICE,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Interface of the built-in `supervisor` service.
pub const ADMIN_INTERFACE: &str = "permissions";

/// Interface of the transaction plugin.
pub const TX_INTERFACE: &str = "admin";

pub struct SupervisorBuilder {
    config: SupervisorConfig,
    http: Option<Arc<dyn HttpClient>>,
    storage: Option<Arc<dyn KvStore>>,
    prompt: Option<Arc<dyn PromptSurface>>,
    prompt_timeout: Option<Duration>,
}

impl SupervisorBuilder {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            http: None,
            storage: None,
            prompt: None,
            prompt_timeout: None,
        }
    }

    /// Network access; real HTTP when unset.
    pub fn http(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    /// Backing store of all partitions; in memory when unset.
    pub fn storage(mut self, storage: Arc<dyn KvStore>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Where approval prompts open. Without one every gated call is denied.
    pub fn prompt(mut self, prompt: Arc<dyn PromptSurface>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    /// Overrides `prompt_timeout_secs`.
    pub fn prompt_timeout(mut self, timeout: Duration) -> Self {
        self.prompt_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<Supervisor, SupervisorError> {
        let invalid = |e: crate::config::ConfigError| SupervisorError::Validation(e.to_string());
        let config = self.config;
        config.validate().map_err(invalid)?;
        let aliases = config.aliases().map_err(invalid)?;
        let system_plugins = config.system_plugins().map_err(invalid)?;
        let user_lookup = config.user_lookup().map_err(invalid)?;
        let transact = config.transact_plugin().map_err(invalid)?;

        let family = OriginFamily::new(&config.scheme, &config.root_domain);
        let http = self.http.unwrap_or_else(|| Arc::new(ReqwestClient::new()));
        let storage = self.storage.unwrap_or_else(|| Arc::new(MemoryKvStore::new()));
        let prompt = self.prompt.unwrap_or_else(|| Arc::new(NoPromptSurface));
        let timeout = self.prompt_timeout.unwrap_or_else(|| config.prompt_timeout());

        let gate = PermissionGate::new(
            Partition::new(storage.clone(), &config.chain_id, SUPERVISOR_SERVICE),
            prompt,
            timeout,
        );
        let host = HostApi::new(family.clone(), &config.chain_id, http.clone(), storage);
        let loader = ComponentLoader::new(new_engine()?, family.clone(), http, aliases);

        let inner = Arc::new_cyclic(|this| SupervisorInner {
            this: this.clone(),
            config,
            family,
            host,
            loader,
            gate,
            user_lookup,
            transact,
            system_plugins,
            frames: Mutex::new(Vec::new()),
        });
        info!(
            root = %inner.family.root_domain(),
            chain = %inner.config.chain_id,
            gated = inner.config.gated.len(),
            "supervisor ready"
        );
        Ok(Supervisor { inner })
    }
}

/// The broker. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    pub fn builder(config: SupervisorConfig) -> SupervisorBuilder {
        SupervisorBuilder::new(config)
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn origin_family(&self) -> &OriginFamily {
        &self.inner.family
    }

    pub fn gate(&self) -> &PermissionGate {
        &self.inner.gate
    }

    /// The stored pending permission request, if any.
    pub fn pending_request(&self) -> Result<Option<PendingPermissionRequest>, SupervisorError> {
        self.inner.gate.pending()
    }

    /// Plugins with a live instance.
    pub fn loaded_plugins(&self) -> Vec<QualifiedPluginId> {
        self.inner.loader.loaded()
    }

    /// Entry point for a call from the frame at `caller_origin`.
    pub async fn function_call(
        &self,
        caller_origin: &str,
        args: FunctionCallArgs,
    ) -> Result<Value, SupervisorError> {
        let origination = self.inner.family.originate(caller_origin)?;
        if let Some(sender) = &args.sender {
            if sender != &origination.app {
                return Err(SupervisorError::Validation(format!(
                    "sender '{}' does not match origin app '{}'",
                    sender, origination.app
                )));
            }
        }
        if args.service == SUPERVISOR_SERVICE {
            return self.inner.admin_call(&origination, args);
        }

        let request = FunctionCallRequest::validate(args)?;
        let ctx = CallContext::new(origination);
        self.inner.start_tx(&ctx).await?;
        let result = match self.inner.dispatch(ctx.clone(), request.clone()).await {
            Ok(value) => self.inner.finish_tx(&ctx).await.map(|_| value),
            Err(e) => Err(e),
        };
        match &result {
            Ok(_) => debug!(
                app = %ctx.origination().app,
                plugin = %request.target,
                export = %request.export_name(),
                "call complete"
            ),
            Err(e) => info!(
                app = %ctx.origination().app,
                plugin = %request.target,
                export = %request.export_name(),
                kind = %e.kind(),
                "call failed: {}",
                e.message()
            ),
        }
        result
    }

    /// Loads `plugins`, the configured system plugins, and everything they
    /// depend on.
    pub async fn preload_plugins(
        &self,
        caller_origin: &str,
        plugins: &[String],
    ) -> Result<Vec<QualifiedPluginId>, SupervisorError> {
        let origination = self.inner.family.originate(caller_origin)?;
        let mut roots = plugins
            .iter()
            .map(|p| p.parse::<QualifiedPluginId>())
            .collect::<Result<Vec<_>, _>>()?;
        roots.extend(self.inner.system_plugins.iter().cloned());
        debug!(app = %origination.app, plugins = roots.len(), "preloading");
        self.inner.loader.preload(roots, self.inner.backend()).await
    }

    /// Interface description of `plugin`, loading it and its dependencies
    /// first.
    pub async fn get_json(&self, caller_origin: &str, plugin: &str) -> Result<Value, SupervisorError> {
        let origination = self.inner.family.originate(caller_origin)?;
        let id = self.inner.loader.resolve(&plugin.parse::<QualifiedPluginId>()?);
        debug!(app = %origination.app, plugin = %id, "interface requested");
        self.inner
            .loader
            .preload(vec![id.clone()], self.inner.backend())
            .await?;
        let component = self
            .inner
            .loader
            .cached(&id)
            .ok_or_else(|| SupervisorError::NotFound(format!("{} is not loaded", id)))?;
        serde_json::to_value(component.interface())
            .map_err(|e| SupervisorError::Validation(format!("interface of {}: {}", id, e)))
    }

    /// Forgets instances, session grants and imported keys, as a page
    /// reload would.
    pub fn reset(&self) {
        self.inner.loader.reset();
        self.inner.gate.grants().clear_session();
        self.inner.host.reset();
        info!("supervisor reset");
    }

    /// Connects a frame at `app_origin` and returns its endpoint. Requests
    /// from the frame are served until either side closes.
    pub fn connect_frame(&self, app_origin: &str) -> Result<BridgeEndpoint, SupervisorError> {
        let origination = self.inner.family.originate(app_origin)?;
        let (app_port, supervisor_port) = channel(&origination.origin, &self.inner.family.supervisor_origin());

        let endpoint = BridgeEndpoint::new(supervisor_port);
        let weak = Arc::downgrade(&self.inner);
        endpoint.set_request_handler(move |ctx: RequestContext, request: BridgeRequest| {
            let weak = weak.clone();
            async move {
                let inner = weak.upgrade().ok_or_else(|| {
                    ErrorPayload::from(SupervisorError::Transport("supervisor has shut down".into()))
                })?;
                let supervisor = Supervisor { inner };
                supervisor
                    .serve(&ctx.origin, request)
                    .await
                    .map_err(ErrorPayload::from)
            }
        });

        let mut frames = self.inner.frames();
        frames.retain(|frame| !frame.is_closed());
        frames.push(endpoint);
        info!(app = %origination.app, frames = frames.len(), "frame connected");
        Ok(BridgeEndpoint::new(app_port))
    }

    async fn serve(&self, origin: &str, request: BridgeRequest) -> Result<Value, SupervisorError> {
        match request {
            BridgeRequest::FunctionCall(args) => self.function_call(origin, args).await,
            BridgeRequest::PreloadPlugins(plugins) => {
                let loaded = self.preload_plugins(origin, &plugins).await?;
                Ok(Value::Array(
                    loaded.iter().map(|id| Value::String(id.to_string())).collect(),
                ))
            }
            BridgeRequest::GetJson(plugin) => self.get_json(origin, &plugin).await,
            BridgeRequest::OpenPrompt(_) => Err(SupervisorError::Validation(
                "prompts are opened by the supervisor, not in it".into(),
            )),
        }
    }
}

#[derive(Deserialize)]
struct PromptInput {
    prompt: String,
    #[serde(default)]
    subpath: Option<String>,
}

fn strip_query(subpath: String) -> String {
    match subpath.split_once('?') {
        Some((path, _)) => {
            warn!(%subpath, "query string stripped from prompt subpath");
            path.to_string()
        }
        None => subpath,
    }
}

type BoxedCall<'a> = Pin<Box<dyn Future<Output = Result<Value, SupervisorError>> + Send + 'a>>;

pub(crate) struct SupervisorInner {
    this: Weak<SupervisorInner>,
    config: SupervisorConfig,
    family: OriginFamily,
    host: HostApi,
    loader: ComponentLoader,
    gate: PermissionGate,
    user_lookup: Option<FunctionRef>,
    transact: Option<QualifiedPluginId>,
    system_plugins: Vec<QualifiedPluginId>,
    frames: Mutex<Vec<BridgeEndpoint>>,
}

impl SupervisorInner {
    fn backend(&self) -> Weak<dyn HostBackend> {
        self.this.clone()
    }

    fn frames(&self) -> MutexGuard<'_, Vec<BridgeEndpoint>> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn dispatch(
        &self,
        ctx: Arc<CallContext>,
        request: FunctionCallRequest,
    ) -> Result<Value, SupervisorError> {
        let target = self.loader.resolve(&request.target);
        let export = request.export_name();
        let caller = ctx.sender();
        let callee = target.service.to_string();

        let _frame = ctx.enter(Frame::new(&target, &request.intf, &request.method))?;
        debug!(
            %caller,
            plugin = %target,
            %export,
            depth = ctx.depth(),
            "dispatching"
        );

        if let Some(gated) = self.config.is_gated(&callee, &request.intf, &request.method) {
            let exempt = caller == callee || caller == SUPERVISOR_SERVICE;
            if !exempt && !self.gate.grants().is_granted(&caller, &callee)? {
                let prompt = gated
                    .prompt
                    .clone()
                    .unwrap_or_else(|| format!("Allow {} to call {} on {}?", caller, export, callee));
                let user = self.current_user(&ctx).await;
                self.gate
                    .request_permission(PermissionRequest {
                        user,
                        caller: caller.clone(),
                        callee: callee.clone(),
                        method: export.clone(),
                        prompt,
                        subpath: None,
                    })
                    .await?;
            }
        }

        let component = self.loader.load(&target, self.backend()).await?;
        component
            .call(ctx.clone(), &export, &request.params)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::Trap | ErrorKind::Plugin => e.produced_by(callee),
                _ => e,
            })
    }

    /// Name of the current user, if a lookup is configured and succeeds.
    async fn current_user(&self, ctx: &Arc<CallContext>) -> Option<String> {
        let lookup = self.user_lookup.as_ref()?;
        let request = FunctionCallRequest {
            target: lookup.target.clone(),
            intf: lookup.intf.clone(),
            method: lookup.method.clone(),
            params: Vec::new(),
        };
        match self.supervisor_call(ctx, "currentUser", request).await {
            Ok(Value::String(user)) => Some(user),
            Ok(Value::Null) => None,
            Ok(other) => {
                warn!(result = %other, "user lookup returned a non-string");
                None
            }
            Err(e) => {
                warn!(error = %e, "user lookup failed");
                None
            }
        }
    }

    /// Runs `request` as a call made by the Supervisor on the current
    /// chain. Boxed because it re-enters dispatch.
    fn supervisor_call<'a>(
        &'a self,
        ctx: &'a Arc<CallContext>,
        purpose: &'a str,
        request: FunctionCallRequest,
    ) -> BoxedCall<'a> {
        Box::pin(async move {
            let supervisor = QualifiedPluginId::new(SUPERVISOR_SERVICE, DEFAULT_PLUGIN)?;
            let _frame = ctx.enter(Frame::new(&supervisor, ADMIN_INTERFACE, purpose))?;
            self.dispatch(ctx.clone(), request).await
        })
    }

    fn tx_request(&self, method: &str) -> Option<FunctionCallRequest> {
        self.transact.as_ref().map(|target| FunctionCallRequest {
            target: target.clone(),
            intf: TX_INTERFACE.to_string(),
            method: method.to_string(),
            params: Vec::new(),
        })
    }

    /// Opens the transaction context of a top-level call.
    async fn start_tx(&self, ctx: &Arc<CallContext>) -> Result<(), SupervisorError> {
        let Some(request) = self.tx_request("startTx") else {
            return Ok(());
        };
        self.supervisor_call(ctx, "startTx", request).await?;
        Ok(())
    }

    /// Closes the transaction context; the plugin submits anything the call
    /// added to it.
    async fn finish_tx(&self, ctx: &Arc<CallContext>) -> Result<(), SupervisorError> {
        let Some(request) = self.tx_request("finishTx") else {
            return Ok(());
        };
        let result = self.supervisor_call(ctx, "finishTx", request).await?;
        if !result.is_null() {
            warn!(app = %ctx.origination().app, %result, "transaction finished with a result");
        }
        Ok(())
    }

    /// `requestPrompt`: asks the user on behalf of the executing service.
    async fn request_prompt(
        &self,
        ctx: &Arc<CallContext>,
        input: Value,
    ) -> Result<Value, SupervisorError> {
        let input: PromptInput = serde_json::from_value(input).map_err(|e| {
            SupervisorError::Validation(format!("invalid input to {}: {}", HostOp::RequestPrompt, e))
        })?;
        let callee = ctx.sender();
        let caller = ctx.caller_of_top();
        let method = ctx
            .top()
            .map(|f| format!("{}::{}", f.intf, f.method))
            .unwrap_or_default();
        let user = self.current_user(ctx).await;

        self.gate
            .request_permission(PermissionRequest {
                user,
                caller,
                callee,
                method,
                prompt: input.prompt,
                subpath: input.subpath.map(strip_query),
            })
            .await?;
        Ok(Value::Bool(true))
    }

    /// The `supervisor` service: the gate's admin interface. The resolver
    /// is the app of the calling origin.
    fn admin_call(
        &self,
        origination: &Origination,
        args: FunctionCallArgs,
    ) -> Result<Value, SupervisorError> {
        if args.intf != ADMIN_INTERFACE {
            return Err(SupervisorError::NotFound(format!(
                "supervisor has no interface '{}'",
                args.intf
            )));
        }
        let params = match args.params {
            Value::Array(params) => params,
            _ => return Err(SupervisorError::Validation("params must be an array".into())),
        };
        let resolver = origination.app.as_str();

        if args.method == "revoke" {
            let caller = params
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| SupervisorError::Validation("revoke expects a caller".into()))?;
            self.gate.grants().revoke(caller, resolver)?;
            info!(%caller, callee = %resolver, "grant revoked");
            return Ok(Value::Null);
        }

        let id = params
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| SupervisorError::Validation(format!("{} expects a request id", args.method)))?;
        let id = Uuid::parse_str(id)
            .map_err(|_| SupervisorError::ForgedRequest(format!("'{}' is not a request id", id)))?;

        match args.method.as_str() {
            "getPending" => {
                let record = self.gate.get_pending(id, resolver)?;
                serde_json::to_value(record).map_err(|e| SupervisorError::Storage(e.to_string()))
            }
            "accept" => {
                let duration = match params.get(1) {
                    None | Some(Value::Null) => ApprovalDuration::default(),
                    Some(Value::String(s)) => s.parse()?,
                    Some(other) => {
                        return Err(SupervisorError::Validation(format!(
                            "duration must be a string, got {}",
                            other
                        )))
                    }
                };
                self.gate.accept(id, duration, resolver)?;
                Ok(Value::Null)
            }
            "deny" => {
                self.gate.deny(id, resolver)?;
                Ok(Value::Null)
            }
            other => Err(SupervisorError::NotFound(format!(
                "supervisor {} has no method '{}'",
                ADMIN_INTERFACE, other
            ))),
        }
    }
}

#[async_trait]
impl HostBackend for SupervisorInner {
    async fn host_call(
        &self,
        op: HostOp,
        ctx: Arc<CallContext>,
        input: Value,
    ) -> Result<Value, SupervisorError> {
        match op {
            HostOp::RequestPrompt => self.request_prompt(&ctx, input).await,
            _ => self.host.invoke(op, &ctx, input).await,
        }
    }

    async fn plugin_call(
        &self,
        ctx: Arc<CallContext>,
        target: QualifiedPluginId,
        intf: String,
        method: String,
        params: Value,
    ) -> Result<Value, SupervisorError> {
        let params = match params {
            Value::Array(params) => params,
            Value::Null => Vec::new(),
            _ => {
                return Err(SupervisorError::Validation(format!(
                    "params to {} {}::{} must be an array",
                    target, intf, method
                )))
            }
        };
        let request = FunctionCallRequest {
            target,
            intf,
            method,
            params,
        };
        self.dispatch(ctx, request).await
    }
}
