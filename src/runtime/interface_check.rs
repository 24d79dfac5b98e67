//! Import and export checking.
//!
//! Every import of a component is classified once, before linking, into
//! one of three kinds: a host API operation, a WASI shim function, or a
//! proxy to another plugin. Anything else is a link error.

use crate::error::SupervisorError;
use crate::host_api::{HostOp, HOST_API_MODULE};
use crate::runtime::wasi::{WASI_FUNCTIONS, WASI_MODULE};
use crate::types::{check_member_name, QualifiedPluginId};
use serde::Serialize;
use std::collections::BTreeSet;
use thiserror::Error;
use wasmtime::{ExternType, FuncType, Instance, Module, Store, TypedFunc, ValType};

/// Errors from import classification
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImportError {
    #[error("unknown host operation '{name}'")]
    UnknownHostOp { name: String },

    #[error("unsupported WASI function '{name}'")]
    UnsupportedWasi { name: String },

    #[error("malformed import namespace '{module}'")]
    MalformedNamespace { module: String },

    #[error("import '{module}' '{name}' has wrong signature: expected {expected}, got {actual}")]
    SignatureMismatch {
        module: String,
        name: String,
        expected: &'static str,
        actual: String,
    },

    #[error("import '{module}' '{name}' is not a function")]
    NotAFunction { module: String, name: String },
}

impl From<ImportError> for SupervisorError {
    fn from(e: ImportError) -> Self {
        SupervisorError::Link(e.to_string())
    }
}

/// The WASM signatures of the calling conventions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExpectedSignature {
    /// (i32, i32) -> i64: JSON in, packed pointer/length of the result out
    HostCall,
    /// (i32, i32, i32, i32) -> i32: JSON in, caller-provided output buffer
    BufferCall,
}

impl ExpectedSignature {
    pub fn description(&self) -> &'static str {
        match self {
            ExpectedSignature::HostCall => "(i32, i32) -> (i64)",
            ExpectedSignature::BufferCall => "(i32, i32, i32, i32) -> (i32)",
        }
    }

    fn matches(&self, ty: &FuncType) -> bool {
        describe(ty) == self.description()
    }
}

fn val_name(ty: &ValType) -> &'static str {
    match ty {
        ValType::I32 => "i32",
        ValType::I64 => "i64",
        ValType::F32 => "f32",
        ValType::F64 => "f64",
        ValType::V128 => "v128",
        _ => "ref",
    }
}

/// Renders a function type as `(params) -> (results)`.
pub fn describe(ty: &FuncType) -> String {
    let params: Vec<&str> = ty.params().map(|p| val_name(&p)).collect();
    let results: Vec<&str> = ty.results().map(|r| val_name(&r)).collect();
    format!("({}) -> ({})", params.join(", "), results.join(", "))
}

/// A proxy import: calling it dispatches `(target, intf, method)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ProxyImport {
    /// Import module, `{service}:{plugin}/{intf}`
    pub module: String,
    pub target: QualifiedPluginId,
    pub intf: String,
    pub method: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImportClass {
    HostOp { op: String },
    Wasi { function: String },
    Proxy { target: String, intf: String, method: String },
}

/// Parses a proxy namespace `{service}:{plugin}/{intf}`.
pub fn parse_proxy_namespace(module: &str) -> Option<(QualifiedPluginId, String)> {
    let (plugin_part, intf) = module.split_once('/')?;
    let (service, plugin) = plugin_part.split_once(':')?;
    let target = QualifiedPluginId::new(service, plugin).ok()?;
    check_member_name("interface", intf).ok()?;
    Some((target, intf.to_string()))
}

fn expect_func<'a>(module: &str, name: &str, ty: &'a ExternType) -> Result<&'a FuncType, ImportError> {
    match ty {
        ExternType::Func(f) => Ok(f),
        _ => Err(ImportError::NotAFunction {
            module: module.to_string(),
            name: name.to_string(),
        }),
    }
}

fn check_signature(
    module: &str,
    name: &str,
    ty: &FuncType,
    expected: ExpectedSignature,
) -> Result<(), ImportError> {
    if expected.matches(ty) {
        Ok(())
    } else {
        Err(ImportError::SignatureMismatch {
            module: module.to_string(),
            name: name.to_string(),
            expected: expected.description(),
            actual: describe(ty),
        })
    }
}

/// Classifies a single import.
///
/// WASI signatures are left to the linker; a mismatch there also surfaces
/// as a link error.
pub fn classify_import(module: &str, name: &str, ty: &ExternType) -> Result<ImportClass, ImportError> {
    if module == HOST_API_MODULE {
        let func = expect_func(module, name, ty)?;
        let op = HostOp::from_name(name).ok_or_else(|| ImportError::UnknownHostOp {
            name: name.to_string(),
        })?;
        check_signature(module, name, func, ExpectedSignature::HostCall)?;
        return Ok(ImportClass::HostOp {
            op: op.name().to_string(),
        });
    }

    if module == WASI_MODULE {
        expect_func(module, name, ty)?;
        if !WASI_FUNCTIONS.contains(&name) {
            return Err(ImportError::UnsupportedWasi {
                name: name.to_string(),
            });
        }
        return Ok(ImportClass::Wasi {
            function: name.to_string(),
        });
    }

    let malformed = || ImportError::MalformedNamespace {
        module: module.to_string(),
    };
    let (target, intf) = parse_proxy_namespace(module).ok_or_else(malformed)?;
    if target.is_reserved() {
        return Err(malformed());
    }
    check_member_name("method", name).map_err(|_| malformed())?;
    let func = expect_func(module, name, ty)?;
    check_signature(module, name, func, ExpectedSignature::BufferCall)?;
    Ok(ImportClass::Proxy {
        target: target.to_string(),
        intf,
        method: name.to_string(),
    })
}

/// The resolved imports of a module.
#[derive(Debug, Clone, Default)]
pub struct LinkPlan {
    pub host_ops: BTreeSet<String>,
    pub wasi: BTreeSet<String>,
    pub proxies: BTreeSet<ProxyImport>,
}

impl LinkPlan {
    /// Resolves every import of `module`, failing on the first that cannot
    /// be satisfied.
    pub fn resolve(module: &Module) -> Result<Self, ImportError> {
        let mut plan = LinkPlan::default();
        for import in module.imports() {
            let ty = import.ty();
            match classify_import(import.module(), import.name(), &ty)? {
                ImportClass::HostOp { op } => {
                    plan.host_ops.insert(op);
                }
                ImportClass::Wasi { function } => {
                    plan.wasi.insert(function);
                }
                ImportClass::Proxy { intf, method, .. } => {
                    // Classification succeeded, so the namespace parses.
                    if let Some((target, _)) = parse_proxy_namespace(import.module()) {
                        plan.proxies.insert(ProxyImport {
                            module: import.module().to_string(),
                            target,
                            intf,
                            method,
                        });
                    }
                }
            }
        }
        Ok(plan)
    }

    /// Plugins this module calls into, deduplicated.
    pub fn dependencies(&self) -> Vec<QualifiedPluginId> {
        let targets: BTreeSet<&QualifiedPluginId> = self.proxies.iter().map(|p| &p.target).collect();
        targets.into_iter().cloned().collect()
    }
}

/// Names of all exported functions.
pub fn exported_functions(module: &Module) -> Vec<String> {
    module
        .exports()
        .filter(|e| matches!(e.ty(), ExternType::Func(_)))
        .map(|e| e.name().to_string())
        .collect()
}

/// Looks up a callable export.
///
/// A missing export is `NotFound`; one with the wrong signature is a link
/// error.
pub fn check_export<T>(
    store: &mut Store<T>,
    instance: &Instance,
    name: &str,
) -> Result<TypedFunc<(i32, i32, i32, i32), i32>, SupervisorError> {
    let Some(func) = instance.get_func(&mut *store, name) else {
        return Err(SupervisorError::NotFound(format!("no export named '{}'", name)));
    };
    let ty = func.ty(&*store);
    if !ExpectedSignature::BufferCall.matches(&ty) {
        return Err(SupervisorError::Link(format!(
            "export '{}' has wrong signature: expected {}, got {}",
            name,
            ExpectedSignature::BufferCall.description(),
            describe(&ty)
        )));
    }
    func.typed(&*store)
        .map_err(|e| SupervisorError::Link(format!("export '{}': {}", name, e)))
}
