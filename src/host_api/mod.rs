//! Privileged Host API
//!
//! The fixed table of operations a component can import from
//! `host:common/api`. Each takes a JSON document and produces a JSON value;
//! the result is attributed to the service on top of the call stack.

pub mod http;
pub mod keys;
pub mod storage;

use crate::dispatch::CallContext;
use crate::error::SupervisorError;
use crate::origin::OriginFamily;
use crate::types::ServiceId;
use http::{HostHttpResponse, HttpClient, HttpRequest};
use keys::KeyStore;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use storage::{KvStore, Partition};
use tracing::debug;

/// Import module name of the host API.
pub const HOST_API_MODULE: &str = "host:common/api";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostOp {
    SendRequest,
    GetServiceStack,
    GetRootDomain,
    GetChainId,
    GetActiveApp,
    ImportKey,
    SignExplicit,
    Sign,
    DbGet,
    DbSet,
    DbRemove,
    RequestPrompt,
}

impl HostOp {
    pub const ALL: [HostOp; 12] = [
        HostOp::SendRequest,
        HostOp::GetServiceStack,
        HostOp::GetRootDomain,
        HostOp::GetChainId,
        HostOp::GetActiveApp,
        HostOp::ImportKey,
        HostOp::SignExplicit,
        HostOp::Sign,
        HostOp::DbGet,
        HostOp::DbSet,
        HostOp::DbRemove,
        HostOp::RequestPrompt,
    ];

    /// Import name of the operation.
    pub fn name(self) -> &'static str {
        match self {
            HostOp::SendRequest => "sendRequest",
            HostOp::GetServiceStack => "getServiceStack",
            HostOp::GetRootDomain => "getRootDomain",
            HostOp::GetChainId => "getChainId",
            HostOp::GetActiveApp => "getActiveApp",
            HostOp::ImportKey => "importKey",
            HostOp::SignExplicit => "signExplicit",
            HostOp::Sign => "sign",
            HostOp::DbGet => "dbGet",
            HostOp::DbSet => "dbSet",
            HostOp::DbRemove => "dbRemove",
            HostOp::RequestPrompt => "requestPrompt",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.name() == name)
    }
}

impl std::fmt::Display for HostOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Deserialize)]
struct KeyInput {
    key: String,
}

#[derive(Deserialize)]
struct SetInput {
    key: String,
    value: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImportKeyInput {
    private_key: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignExplicitInput {
    msg: String,
    private_key: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInput {
    msg: String,
    public_key: String,
}

fn parse_input<T: DeserializeOwned>(op: HostOp, input: Value) -> Result<T, SupervisorError> {
    serde_json::from_value(input)
        .map_err(|e| SupervisorError::Validation(format!("invalid input to {}: {}", op, e)))
}

fn to_json<T: serde::Serialize>(value: T) -> Result<Value, SupervisorError> {
    serde_json::to_value(value).map_err(|e| SupervisorError::Plugin(e.to_string()))
}

/// Implementation of every operation except `requestPrompt`, which needs the
/// dispatcher and is served there.
pub struct HostApi {
    family: OriginFamily,
    chain_id: String,
    http: Arc<dyn HttpClient>,
    storage: Arc<dyn KvStore>,
    keys: KeyStore,
}

impl HostApi {
    pub fn new(
        family: OriginFamily,
        chain_id: &str,
        http: Arc<dyn HttpClient>,
        storage: Arc<dyn KvStore>,
    ) -> Self {
        Self {
            family,
            chain_id: chain_id.to_string(),
            http,
            storage,
            keys: KeyStore::new(),
        }
    }

    pub fn partition(&self, service: &str) -> Partition {
        Partition::new(self.storage.clone(), &self.chain_id, service)
    }

    /// Fetches through the egress check.
    pub async fn send_request(&self, request: HttpRequest) -> Result<HostHttpResponse, SupervisorError> {
        self.family.check(&request.uri)?;
        let response = self.http.send(request).await?;
        Ok(response.into())
    }

    pub async fn invoke(
        &self,
        op: HostOp,
        ctx: &CallContext,
        input: Value,
    ) -> Result<Value, SupervisorError> {
        let sender = ctx.sender();
        let service = ServiceId::parse(&sender)?;
        debug!(op = %op, service = %service, "host call");

        match op {
            HostOp::SendRequest => {
                let request: HttpRequest = parse_input(op, input)?;
                to_json(self.send_request(request).await?)
            }
            HostOp::GetServiceStack => to_json(ctx.services()),
            HostOp::GetRootDomain => Ok(Value::String(self.family.root_domain().to_string())),
            HostOp::GetChainId => Ok(Value::String(self.chain_id.clone())),
            HostOp::GetActiveApp => to_json(ctx.origination()),
            HostOp::ImportKey => {
                let input: ImportKeyInput = parse_input(op, input)?;
                to_json(self.keys.import_key(service.as_str(), &input.private_key)?)
            }
            HostOp::SignExplicit => {
                let input: SignExplicitInput = parse_input(op, input)?;
                to_json(keys::sign_explicit(&input.msg, &input.private_key)?)
            }
            HostOp::Sign => {
                let input: SignInput = parse_input(op, input)?;
                to_json(self.keys.sign(service.as_str(), &input.msg, &input.public_key)?)
            }
            HostOp::DbGet => {
                let input: KeyInput = parse_input(op, input)?;
                let value: Option<Value> = self.partition(service.as_str()).get_json(&input.key)?;
                Ok(value.unwrap_or(Value::Null))
            }
            HostOp::DbSet => {
                let input: SetInput = parse_input(op, input)?;
                self.partition(service.as_str())
                    .set_json(&input.key, &input.value)?;
                Ok(Value::Null)
            }
            HostOp::DbRemove => {
                let input: KeyInput = parse_input(op, input)?;
                self.partition(service.as_str()).remove(&input.key)?;
                Ok(Value::Null)
            }
            HostOp::RequestPrompt => Err(SupervisorError::Link(
                "requestPrompt is served by the dispatcher".into(),
            )),
        }
    }

    pub fn reset(&self) {
        self.keys.clear();
    }
}
