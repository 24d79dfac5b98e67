//! Component Loader
//!
//! Fetches, links and instantiates components, one instance per
//! [`QualifiedPluginId`]. Concurrent loads of the same id share a single
//! fetch through a per-id `OnceCell`.

use super::host::{AsyncCtx, HostFunctionProvider, HostLinkerBuilder, LinkerError};
use super::interface_check::{exported_functions, LinkPlan, ProxyImport};
use super::locks::{next_instance_key, InstanceKey, InstanceLocks};
use super::wasi::WasiShim;
use super::{describe_error, ComponentInstance, HostBackend, HostContext};
use crate::dispatch::CallContext;
use crate::error::SupervisorError;
use crate::host_api::http::{HttpClient, HttpRequest};
use crate::host_api::{HostOp, HOST_API_MODULE};
use crate::origin::OriginFamily;
use crate::types::QualifiedPluginId;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};
use wasmtime::{Engine, Linker, Module, Store};

/// What a loaded plugin exports and imports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentInterface {
    pub plugin: String,
    pub digest: String,
    pub exports: Vec<String>,
    pub host_ops: Vec<String>,
    pub wasi: Vec<String>,
    pub dependencies: Vec<String>,
    pub proxies: Vec<ProxyImport>,
}

/// A cached component.
///
/// Identity and interface are readable without waiting for a call in
/// progress; the store itself sits behind the instance lock.
pub struct LoadedComponent {
    id: QualifiedPluginId,
    key: InstanceKey,
    digest: String,
    dependencies: Vec<QualifiedPluginId>,
    interface: ComponentInterface,
    locks: Arc<InstanceLocks>,
    instance: tokio::sync::Mutex<ComponentInstance>,
}

impl LoadedComponent {
    pub fn id(&self) -> &QualifiedPluginId {
        &self.id
    }

    /// Hex SHA-256 of the binary.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn dependencies(&self) -> &[QualifiedPluginId] {
        &self.dependencies
    }

    pub fn interface(&self) -> &ComponentInterface {
        &self.interface
    }

    /// Runs `export` to completion; calls into the same instance are
    /// serialized.
    ///
    /// A chain that would wait for an instance held by a chain waiting on
    /// it gets `CyclicCall` instead.
    pub async fn call(
        &self,
        ctx: Arc<CallContext>,
        export: &str,
        params: &[Value],
    ) -> Result<Value, SupervisorError> {
        let chain = ctx.chain();
        let mut instance = match self.instance.try_lock() {
            Ok(instance) => instance,
            Err(_) => {
                let _waiting = self.locks.wait(self.key, &self.id, chain)?;
                debug!(plugin = %self.id, chain, "waiting for busy instance");
                self.instance.lock().await
            }
        };
        let _held = self.locks.hold(self.key, chain);
        instance.call(ctx, export, params).await
    }
}

pub type SharedInstance = Arc<LoadedComponent>;

/// Registers every host API operation.
struct HostApiImports;

impl HostFunctionProvider<HostContext> for HostApiImports {
    fn register(&self, builder: &mut HostLinkerBuilder<'_, HostContext>) -> Result<(), LinkerError> {
        let mut interface = builder.interface(HOST_API_MODULE)?;
        for op in HostOp::ALL {
            interface.func_json_async(op.name(), move |ctx: AsyncCtx<HostContext>, input| async move {
                ctx.data().host_call(op, input).await
            })?;
        }
        Ok(())
    }
}

/// Registers the proxy imports of one module.
struct ProxyImports<'a> {
    proxies: &'a [ProxyImport],
}

impl HostFunctionProvider<HostContext> for ProxyImports<'_> {
    fn register(&self, builder: &mut HostLinkerBuilder<'_, HostContext>) -> Result<(), LinkerError> {
        for proxy in self.proxies {
            let target = proxy.target.clone();
            let intf = proxy.intf.clone();
            let method = proxy.method.clone();
            builder.interface(&proxy.module)?.func_forward_async(
                &proxy.method,
                move |ctx: AsyncCtx<HostContext>, params| {
                    let target = target.clone();
                    let intf = intf.clone();
                    let method = method.clone();
                    async move { ctx.data().plugin_call(target, intf, method, params).await }
                },
            )?;
        }
        Ok(())
    }
}

pub struct ComponentLoader {
    engine: Engine,
    family: OriginFamily,
    http: Arc<dyn HttpClient>,
    aliases: HashMap<QualifiedPluginId, QualifiedPluginId>,
    cache: Mutex<HashMap<QualifiedPluginId, Arc<OnceCell<SharedInstance>>>>,
    locks: Arc<InstanceLocks>,
}

impl ComponentLoader {
    pub fn new(
        engine: Engine,
        family: OriginFamily,
        http: Arc<dyn HttpClient>,
        aliases: HashMap<QualifiedPluginId, QualifiedPluginId>,
    ) -> Self {
        Self {
            engine,
            family,
            http,
            aliases,
            cache: Mutex::new(HashMap::new()),
            locks: InstanceLocks::new(),
        }
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<QualifiedPluginId, Arc<OnceCell<SharedInstance>>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies the configured alias, if any.
    pub fn resolve(&self, id: &QualifiedPluginId) -> QualifiedPluginId {
        match self.aliases.get(id) {
            Some(target) => {
                debug!(from = %id, to = %target, "plugin alias");
                target.clone()
            }
            None => id.clone(),
        }
    }

    /// Ids with a finished instance in the cache.
    pub fn loaded(&self) -> Vec<QualifiedPluginId> {
        let mut ids: Vec<_> = self
            .cache()
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Drops every cached instance.
    pub fn reset(&self) {
        let mut cache = self.cache();
        info!(instances = cache.len(), "component cache cleared");
        cache.clear();
    }

    /// Returns the cached instance of `id`, loading it on first use.
    pub async fn load(
        &self,
        id: &QualifiedPluginId,
        backend: Weak<dyn HostBackend>,
    ) -> Result<SharedInstance, SupervisorError> {
        if id.is_reserved() {
            return Err(SupervisorError::NotFound(format!(
                "{} is in a reserved namespace",
                id
            )));
        }

        let cell = self.cache().entry(id.clone()).or_default().clone();
        if let Some(instance) = cell.get() {
            debug!(plugin = %id, "component cache hit");
            return Ok(instance.clone());
        }

        let instance = cell
            .get_or_try_init(|| async {
                let bytes = self.fetch(id).await?;
                let component = self.instantiate(id, &bytes, backend).await?;
                info!(
                    plugin = %id,
                    digest = %component.digest,
                    dependencies = component.dependencies.len(),
                    "component loaded"
                );
                Ok::<_, SupervisorError>(Arc::new(component))
            })
            .await?;
        Ok(instance.clone())
    }

    /// The finished instance of `id`, without loading it.
    pub fn cached(&self, id: &QualifiedPluginId) -> Option<SharedInstance> {
        self.cache().get(id).and_then(|cell| cell.get().cloned())
    }

    /// Loads `roots` and everything they depend on, breadth first.
    ///
    /// Every plugin is attempted; the first failure is returned after the
    /// rest have loaded.
    pub async fn preload(
        &self,
        roots: Vec<QualifiedPluginId>,
        backend: Weak<dyn HostBackend>,
    ) -> Result<Vec<QualifiedPluginId>, SupervisorError> {
        let mut queue: VecDeque<QualifiedPluginId> = roots.iter().map(|id| self.resolve(id)).collect();
        let mut seen = HashSet::new();
        let mut loaded = Vec::new();
        let mut first_error = None;

        while let Some(id) = queue.pop_front() {
            if id.is_reserved() || !seen.insert(id.clone()) {
                continue;
            }
            match self.load(&id, backend.clone()).await {
                Ok(component) => {
                    queue.extend(component.dependencies().iter().map(|dep| self.resolve(dep)));
                    loaded.push(id);
                }
                Err(e) => {
                    warn!(plugin = %id, error = %e, "preload failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(loaded),
        }
    }

    async fn fetch(&self, id: &QualifiedPluginId) -> Result<Vec<u8>, SupervisorError> {
        let url = self.family.plugin_url(id);
        self.family
            .check(&url)
            .map_err(|e| SupervisorError::NotFound(format!("{}: {}", id, e.message())))?;

        debug!(plugin = %id, %url, "fetching component");
        let response = self
            .http
            .send(HttpRequest::get(&url))
            .await
            .map_err(|e| SupervisorError::NotFound(format!("failed to fetch {}: {}", url, e.message())))?;
        if response.status == 404 {
            return Err(SupervisorError::NotFound(format!("{} is not published at {}", id, url)));
        }
        if !response.is_success() {
            return Err(SupervisorError::NotFound(format!(
                "failed to fetch {}: status {}",
                url, response.status
            )));
        }
        Ok(response.body)
    }

    async fn instantiate(
        &self,
        id: &QualifiedPluginId,
        bytes: &[u8],
        backend: Weak<dyn HostBackend>,
    ) -> Result<LoadedComponent, SupervisorError> {
        let digest = hex::encode(Sha256::digest(bytes));
        let module = Module::new(&self.engine, bytes).map_err(|e| {
            SupervisorError::Instantiate(format!("{} is not a valid module: {:#}", id, e))
        })?;

        let plan = LinkPlan::resolve(&module)
            .map_err(|e| SupervisorError::Link(format!("{}: {}", id, e)))?;
        let proxies: Vec<ProxyImport> = plan.proxies.iter().cloned().collect();

        let mut linker = Linker::new(&self.engine);
        {
            let plugin = id.to_string();
            let mut builder = HostLinkerBuilder::new(&mut linker);
            builder
                .on_error(move |err| error!(%plugin, "{}", err))
                .register_provider(&HostApiImports)?
                .register_provider(&WasiShim)?
                .register_provider(&ProxyImports { proxies: &proxies })?;
        }

        let pre = linker
            .instantiate_pre(&module)
            .map_err(|e| SupervisorError::Link(format!("{}: {:#}", id, e)))?;
        let mut store = Store::new(&self.engine, HostContext::new(id.service.clone(), backend));
        let instance = pre.instantiate_async(&mut store).await.map_err(|e| {
            SupervisorError::Instantiate(format!("{}: {}", id, describe_error(&e)))
        })?;
        if instance.get_memory(&mut store, "memory").is_none() {
            return Err(SupervisorError::Instantiate(format!(
                "{} does not export memory",
                id
            )));
        }

        let dependencies = plan.dependencies();
        let interface = ComponentInterface {
            plugin: id.to_string(),
            digest: digest.clone(),
            exports: exported_functions(&module),
            host_ops: plan.host_ops.iter().cloned().collect(),
            wasi: plan.wasi.iter().cloned().collect(),
            dependencies: dependencies.iter().map(|dep| dep.to_string()).collect(),
            proxies,
        };
        Ok(LoadedComponent {
            id: id.clone(),
            key: next_instance_key(),
            digest,
            dependencies,
            interface,
            locks: self.locks.clone(),
            instance: tokio::sync::Mutex::new(ComponentInstance::new(id.clone(), store, instance)),
        })
    }
}
