//! Identifiers and call records shared by the loader, dispatcher and gate.

use crate::error::SupervisorError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Plugin name used when a call or import does not name one.
pub const DEFAULT_PLUGIN: &str = "plugin";

/// The Supervisor's own service name. Calls addressed to it are handled
/// in-process and it owns the storage partition holding gate records.
pub const SUPERVISOR_SERVICE: &str = "supervisor";

/// App name of the root origin (`https://{root}`).
pub const HOMEPAGE_APP: &str = "homepage";

/// Namespaces that name host facilities rather than loadable plugins.
pub const RESERVED_NAMESPACES: [&str; 3] = ["host", "wasi", SUPERVISOR_SERVICE];

/// A service name. Services are served from `{service}.{root_domain}`, so the
/// name must be a valid DNS label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceId(String);

impl ServiceId {
    pub fn parse(name: &str) -> Result<Self, SupervisorError> {
        if name.is_empty() || name.len() > 63 {
            return Err(SupervisorError::Validation(format!(
                "service name '{}' must be 1 to 63 characters",
                name
            )));
        }
        if name.starts_with('-') || name.ends_with('-') {
            return Err(SupervisorError::Validation(format!(
                "service name '{}' may not start or end with '-'",
                name
            )));
        }
        if !name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        {
            return Err(SupervisorError::Validation(format!(
                "service name '{}' may only contain a-z, 0-9 and '-'",
                name
            )));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_reserved(&self) -> bool {
        RESERVED_NAMESPACES.contains(&self.0.as_str())
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ServiceId {
    type Error = SupervisorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ServiceId::parse(&value)
    }
}

impl From<ServiceId> for String {
    fn from(id: ServiceId) -> Self {
        id.0
    }
}

impl PartialEq<str> for ServiceId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for ServiceId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

fn check_plugin_name(name: &str) -> Result<(), SupervisorError> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(SupervisorError::Validation(format!(
            "invalid plugin name '{}'",
            name
        )))
    }
}

/// Interface and method names end up inside an export name
/// (`{intf}::{method}`), so separators are not allowed in them.
pub(crate) fn check_member_name(what: &str, name: &str) -> Result<(), SupervisorError> {
    if name.is_empty() {
        return Err(SupervisorError::Validation(format!("{} must not be empty", what)));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(SupervisorError::Validation(format!(
            "{} '{}' contains invalid characters",
            what, name
        )));
    }
    Ok(())
}

/// `(service, plugin)`; identifies exactly one component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QualifiedPluginId {
    pub service: ServiceId,
    pub plugin: String,
}

impl QualifiedPluginId {
    pub fn new(service: &str, plugin: &str) -> Result<Self, SupervisorError> {
        let service = ServiceId::parse(service)?;
        check_plugin_name(plugin)?;
        Ok(Self {
            service,
            plugin: plugin.to_string(),
        })
    }

    pub fn is_reserved(&self) -> bool {
        self.service.is_reserved()
    }
}

impl fmt::Display for QualifiedPluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service, self.plugin)
    }
}

/// Parses `service:plugin`, or a bare `service` for the default plugin.
impl FromStr for QualifiedPluginId {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((service, plugin)) => QualifiedPluginId::new(service, plugin),
            None => QualifiedPluginId::new(s, DEFAULT_PLUGIN),
        }
    }
}

fn empty_params() -> Value {
    Value::Array(Vec::new())
}

/// A call as it arrives from a frame, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionCallArgs {
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    pub intf: String,
    pub method: String,
    #[serde(default = "empty_params")]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

impl FunctionCallArgs {
    pub fn new(service: &str, intf: &str, method: &str, params: Vec<Value>) -> Self {
        Self {
            service: service.to_string(),
            plugin: None,
            intf: intf.to_string(),
            method: method.to_string(),
            params: Value::Array(params),
            sender: None,
        }
    }

    pub fn with_plugin(mut self, plugin: &str) -> Self {
        self.plugin = Some(plugin.to_string());
        self
    }

    pub fn with_sender(mut self, sender: &str) -> Self {
        self.sender = Some(sender.to_string());
        self
    }
}

/// A validated call, ready to be routed.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCallRequest {
    pub target: QualifiedPluginId,
    pub intf: String,
    pub method: String,
    pub params: Vec<Value>,
}

impl FunctionCallRequest {
    pub fn validate(args: FunctionCallArgs) -> Result<Self, SupervisorError> {
        let plugin = args.plugin.as_deref().unwrap_or(DEFAULT_PLUGIN);
        let target = QualifiedPluginId::new(&args.service, plugin)?;
        check_member_name("interface", &args.intf)?;
        check_member_name("method", &args.method)?;
        let params = match args.params {
            Value::Array(params) => params,
            other => {
                return Err(SupervisorError::Validation(format!(
                    "params must be an array, got {}",
                    json_type_name(&other)
                )))
            }
        };
        Ok(Self {
            target,
            intf: args.intf,
            method: args.method,
            params,
        })
    }

    /// Name of the component export implementing this call.
    pub fn export_name(&self) -> String {
        format!("{}::{}", self.intf, self.method)
    }

    pub fn service(&self) -> &ServiceId {
        &self.target.service
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// The app and origin a top-level call came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origination {
    pub app: String,
    pub origin: String,
}

/// The single pending approval, persisted under `active_oauth_request`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPermissionRequest {
    pub id: Uuid,
    pub user: Option<String>,
    pub method: String,
    pub prompt: String,
    pub caller: String,
    pub callee: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subpath: Option<String>,
    /// Unix seconds after which the request resolves as denied.
    pub expiry: u64,
}

/// What a prompt surface is opened with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptParams {
    pub id: Uuid,
    pub caller: String,
    pub callee: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subpath: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDuration {
    #[default]
    Session,
    Permanent,
}

impl FromStr for ApprovalDuration {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session" => Ok(ApprovalDuration::Session),
            "permanent" => Ok(ApprovalDuration::Permanent),
            other => Err(SupervisorError::Validation(format!(
                "unknown approval duration '{}'",
                other
            ))),
        }
    }
}
