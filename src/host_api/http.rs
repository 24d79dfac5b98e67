//! Network egress.
//!
//! Every outbound request, whether a component's `sendRequest` or the
//! loader fetching a plugin binary, goes through an [`HttpClient`] after the
//! URL has been checked against the origin family.

use crate::error::SupervisorError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub uri: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn get(uri: &str) -> Self {
        Self {
            uri: uri.to_string(),
            method: default_method(),
            headers: BTreeMap::new(),
            body: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: 404,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// What `sendRequest` hands back to a component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostHttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl From<HttpResponse> for HostHttpResponse {
    fn from(response: HttpResponse) -> Self {
        Self {
            status: response.status,
            headers: response.headers.into_iter().collect(),
            body: String::from_utf8_lossy(&response.body).into_owned(),
        }
    }
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, SupervisorError>;
}

/// Real network access.
#[derive(Debug, Clone, Default)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, SupervisorError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|_| {
            SupervisorError::Network(format!("invalid method '{}'", request.method))
        })?;
        let mut builder = self.client.request(method, &request.uri);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| SupervisorError::Network(e.to_string()))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| SupervisorError::Network(e.to_string()))?
            .to_vec();

        debug!(uri = %request.uri, status, "http request completed");
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Serves canned responses by exact URI; unknown URIs are 404.
#[derive(Debug, Default)]
pub struct MemoryHttpClient {
    routes: Mutex<HashMap<String, HttpResponse>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl MemoryHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self, uri: &str, response: HttpResponse) {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(uri.to_string(), response);
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn request_count(&self, uri: &str) -> usize {
        self.requests().iter().filter(|r| r.uri == uri).count()
    }
}

#[async_trait]
impl HttpClient for MemoryHttpClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, SupervisorError> {
        let response = self
            .routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&request.uri)
            .cloned()
            .unwrap_or_else(HttpResponse::not_found);
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
        Ok(response)
    }
}

/// Serves `{scheme}://{service}.{root}/{path}` from `{dir}/{service}/{path}`.
/// Lets the CLI run plugins from a local build tree.
#[derive(Debug, Clone)]
pub struct DirectoryClient {
    dir: PathBuf,
    root_domain: String,
}

impl DirectoryClient {
    pub fn new(dir: impl Into<PathBuf>, root_domain: &str) -> Self {
        Self {
            dir: dir.into(),
            root_domain: root_domain.to_string(),
        }
    }

    fn resolve(&self, uri: &str) -> Option<PathBuf> {
        let url = url::Url::parse(uri).ok()?;
        let host = url.host_str()?;
        let authority = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        let service = authority.strip_suffix(&format!(".{}", self.root_domain))?;
        let mut path = self.dir.join(service);
        for segment in url.path_segments()? {
            if segment.is_empty() || segment == "." || segment == ".." {
                return None;
            }
            path.push(segment);
        }
        Some(path)
    }
}

#[async_trait]
impl HttpClient for DirectoryClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, SupervisorError> {
        if request.method != "GET" {
            return Err(SupervisorError::Network(format!(
                "{} is not supported for local plugin directories",
                request.method
            )));
        }
        let Some(path) = self.resolve(&request.uri) else {
            return Ok(HttpResponse::not_found());
        };
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(HttpResponse::ok(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HttpResponse::not_found()),
            Err(e) => Err(SupervisorError::Network(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }
}
