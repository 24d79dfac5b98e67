//! Supervisor configuration, loaded from TOML.
//!
//! ```toml
//! root_domain = "psibase.localhost:8080"
//! scheme = "http"
//! chain_id = "8a34ef..."
//! system_plugins = ["accounts:plugin", "transact:plugin"]
//! prompt_timeout_secs = 600
//! user_lookup = "accounts:plugin/api::getCurrentUser"
//! transact_plugin = "transact:plugin"
//!
//! [plugin_aliases]
//! "accounts:smart-auth" = "auth-sig:smart-auth"
//!
//! [[gated]]
//! service = "invite"
//! intf = "invitee"
//! method = "accept"
//! prompt = "Accept this invite?"
//! ```

use crate::types::{check_member_name, QualifiedPluginId, ServiceId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Longest a permission prompt may stay open: one week.
pub const MAX_PROMPT_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SupervisorConfig {
    /// Services are served from `{service}.{root_domain}`.
    #[serde(default = "SupervisorConfig::default_root_domain")]
    pub root_domain: String,

    #[serde(default = "SupervisorConfig::default_scheme")]
    pub scheme: String,

    /// Prefix of every storage key.
    #[serde(default = "SupervisorConfig::default_chain_id")]
    pub chain_id: String,

    /// Plugins loaded on every preload, as `service:plugin`.
    #[serde(default)]
    pub system_plugins: Vec<String>,

    #[serde(default)]
    pub plugin_aliases: BTreeMap<String, String>,

    #[serde(default)]
    pub gated: Vec<GatedFunction>,

    #[serde(default = "SupervisorConfig::default_prompt_timeout_secs")]
    pub prompt_timeout_secs: u64,

    /// `service:plugin/intf::method` returning the logged-in user.
    #[serde(default)]
    pub user_lookup: Option<String>,

    /// `service:plugin` whose `admin::startTx` and `admin::finishTx` bracket
    /// every top-level call.
    #[serde(default)]
    pub transact_plugin: Option<String>,

    /// CLI only: serve plugins from `{plugin_dir}/{service}/{plugin}.wasm`.
    #[serde(default)]
    pub plugin_dir: Option<PathBuf>,

    /// CLI only: persist storage partitions to this JSON file.
    #[serde(default)]
    pub storage_path: Option<PathBuf>,
}

impl SupervisorConfig {
    fn default_root_domain() -> String {
        "psibase.localhost".to_string()
    }

    fn default_scheme() -> String {
        "https".to_string()
    }

    fn default_chain_id() -> String {
        "local".to_string()
    }

    fn default_prompt_timeout_secs() -> u64 {
        600
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: SupervisorConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.root_domain.is_empty() || self.root_domain.contains('/') {
            return Err(ConfigError::Invalid(format!(
                "root_domain '{}' must be a bare host",
                self.root_domain
            )));
        }
        if self.scheme != "http" && self.scheme != "https" {
            return Err(ConfigError::Invalid(format!(
                "scheme must be http or https, got '{}'",
                self.scheme
            )));
        }
        if self.chain_id.is_empty() || self.chain_id.contains(':') {
            return Err(ConfigError::Invalid(
                "chain_id must be non-empty and may not contain ':'".into(),
            ));
        }
        if self.prompt_timeout_secs == 0 || self.prompt_timeout_secs > MAX_PROMPT_TIMEOUT_SECS {
            return Err(ConfigError::Invalid(format!(
                "prompt_timeout_secs must be between 1 and {}",
                MAX_PROMPT_TIMEOUT_SECS
            )));
        }
        self.system_plugins()?;
        self.aliases()?;
        for gated in &self.gated {
            gated.validate()?;
        }
        if let Some(lookup) = &self.user_lookup {
            lookup.parse::<FunctionRef>()?;
        }
        self.transact_plugin()?;
        Ok(())
    }

    pub fn system_plugins(&self) -> Result<Vec<QualifiedPluginId>, ConfigError> {
        self.system_plugins
            .iter()
            .map(|p| {
                p.parse::<QualifiedPluginId>()
                    .map_err(|e| ConfigError::Invalid(format!("system plugin: {e}")))
            })
            .collect()
    }

    pub fn aliases(&self) -> Result<HashMap<QualifiedPluginId, QualifiedPluginId>, ConfigError> {
        self.plugin_aliases
            .iter()
            .map(|(from, to)| {
                let from = from
                    .parse::<QualifiedPluginId>()
                    .map_err(|e| ConfigError::Invalid(format!("plugin alias: {e}")))?;
                let to = to
                    .parse::<QualifiedPluginId>()
                    .map_err(|e| ConfigError::Invalid(format!("plugin alias: {e}")))?;
                Ok((from, to))
            })
            .collect()
    }

    pub fn user_lookup(&self) -> Result<Option<FunctionRef>, ConfigError> {
        self.user_lookup.as_deref().map(str::parse::<FunctionRef>).transpose()
    }

    pub fn transact_plugin(&self) -> Result<Option<QualifiedPluginId>, ConfigError> {
        self.transact_plugin
            .as_deref()
            .map(|p| {
                p.parse::<QualifiedPluginId>()
                    .map_err(|e| ConfigError::Invalid(format!("transact plugin: {e}")))
            })
            .transpose()
    }

    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_secs(self.prompt_timeout_secs)
    }

    /// Whether `(service, intf, method)` requires approval for cross-service callers.
    pub fn is_gated(&self, service: &str, intf: &str, method: &str) -> Option<&GatedFunction> {
        self.gated
            .iter()
            .find(|g| g.service == service && g.intf == intf && g.method == method)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            root_domain: Self::default_root_domain(),
            scheme: Self::default_scheme(),
            chain_id: Self::default_chain_id(),
            system_plugins: Vec::new(),
            plugin_aliases: BTreeMap::new(),
            gated: Vec::new(),
            prompt_timeout_secs: Self::default_prompt_timeout_secs(),
            user_lookup: None,
            transact_plugin: None,
            plugin_dir: None,
            storage_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatedFunction {
    pub service: String,
    pub intf: String,
    pub method: String,
    /// Text shown on the prompt; a generic description is used when absent.
    #[serde(default)]
    pub prompt: Option<String>,
}

impl GatedFunction {
    pub fn new(service: &str, intf: &str, method: &str) -> Self {
        Self {
            service: service.to_string(),
            intf: intf.to_string(),
            method: method.to_string(),
            prompt: None,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        ServiceId::parse(&self.service)
            .and_then(|_| check_member_name("interface", &self.intf))
            .and_then(|_| check_member_name("method", &self.method))
            .map_err(|e| ConfigError::Invalid(format!("gated function: {e}")))
    }
}

/// `service:plugin/intf::method`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionRef {
    pub target: QualifiedPluginId,
    pub intf: String,
    pub method: String,
}

impl FromStr for FunctionRef {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |why: &str| ConfigError::Invalid(format!("function reference '{s}': {why}"));
        let (plugin, rest) = s
            .split_once('/')
            .ok_or_else(|| invalid("expected service:plugin/intf::method"))?;
        let (intf, method) = rest
            .split_once("::")
            .ok_or_else(|| invalid("expected intf::method"))?;
        let target = plugin
            .parse::<QualifiedPluginId>()
            .map_err(|e| invalid(&format!("{e}")))?;
        check_member_name("interface", intf).map_err(|e| invalid(&format!("{e}")))?;
        check_member_name("method", method).map_err(|e| invalid(&format!("{e}")))?;
        Ok(Self {
            target,
            intf: intf.to_string(),
            method: method.to_string(),
        })
    }
}
