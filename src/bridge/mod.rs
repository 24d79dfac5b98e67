//! Frame Bridge
//!
//! Request/response transport between frames over a [`MessagePort`].
//! Both ends are symmetric: each can issue requests and serve them at the
//! same time, with any number outstanding in either direction.
//!
//! ```text
//!   app frame                         supervisor frame
//!  ┌───────────────┐  Request{id}    ┌───────────────┐
//!  │ pending: id ──┼────────────────►│ handler task  │
//!  │   oneshot     │◄────────────────┼── per request │
//!  └───────────────┘  Response{id}   └───────────────┘
//! ```
//!
//! Responses are matched by correlation id, so they may complete in any
//! order. Closing an endpoint fails its outstanding calls; responses that
//! arrive for a closed frame are discarded.

mod message;
pub mod port;

pub use message::{BridgeMessage, BridgeRequest};
pub use port::{channel, MessagePort, PortMessage, PortSender};

use crate::error::{ErrorPayload, SupervisorError};
use crate::gate::PromptSurface;
use crate::types::{FunctionCallArgs, PromptParams};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("port closed")]
    Closed,

    #[error("failed to encode message: {0}")]
    Encode(String),

    #[error("{0}")]
    Remote(ErrorPayload),
}

impl From<BridgeError> for SupervisorError {
    fn from(e: BridgeError) -> Self {
        match e {
            BridgeError::Remote(payload) => payload.into(),
            other => SupervisorError::Transport(other.to_string()),
        }
    }
}

/// Who sent an inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub id: Uuid,
    /// Stamped by the port.
    pub origin: String,
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, ErrorPayload>> + Send>>;
type RequestHandler = Arc<dyn Fn(RequestContext, BridgeRequest) -> HandlerFuture + Send + Sync>;
type PendingCall = oneshot::Sender<Result<Value, BridgeError>>;

struct Inner {
    sender: Mutex<Option<PortSender>>,
    pending: Mutex<HashMap<Uuid, PendingCall>>,
    request_handler: RwLock<Option<RequestHandler>>,
    closed: AtomicBool,
}

impl Inner {
    fn pending(&self) -> MutexGuard<'_, HashMap<Uuid, PendingCall>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sender(&self) -> MutexGuard<'_, Option<PortSender>> {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handler(&self) -> Option<RequestHandler> {
        self.request_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn post(&self, data: String) -> Result<(), BridgeError> {
        let sender = self.sender().clone().ok_or(BridgeError::Closed)?;
        sender.post(data).await
    }

    async fn respond(&self, id: Uuid, result: Result<Value, ErrorPayload>) {
        let data = match serde_json::to_string(&BridgeMessage::Response { id, result }) {
            Ok(data) => data,
            Err(e) => {
                warn!(%id, error = %e, "failed to encode response");
                return;
            }
        };
        if let Err(e) = self.post(data).await {
            warn!(%id, error = %e, "discarding response");
        }
    }

    fn fail_pending(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let pending: Vec<PendingCall> = self.pending().drain().map(|(_, tx)| tx).collect();
        if !pending.is_empty() {
            debug!(calls = pending.len(), "failing outstanding calls");
        }
        for tx in pending {
            let _ = tx.send(Err(BridgeError::Closed));
        }
    }
}

async fn read_loop(inner: Arc<Inner>, mut rx: mpsc::Receiver<PortMessage>) {
    while let Some(message) = rx.recv().await {
        handle_message(&inner, message);
    }
    debug!("peer closed the port");
    inner.fail_pending();
}

fn handle_message(inner: &Arc<Inner>, message: PortMessage) {
    match serde_json::from_str::<BridgeMessage>(&message.data) {
        Ok(BridgeMessage::Response { id, result }) => {
            let tx = inner.pending().remove(&id);
            match tx {
                Some(tx) => {
                    let _ = tx.send(result.map_err(BridgeError::Remote));
                }
                None => warn!(%id, origin = %message.origin, "response to unknown request dropped"),
            }
        }
        Ok(BridgeMessage::Request { id, request }) => {
            let handler = inner.handler();
            let inner = inner.clone();
            let ctx = RequestContext {
                id,
                origin: message.origin,
            };
            tokio::spawn(async move {
                let result = match handler {
                    Some(handler) => handler(ctx, request).await,
                    None => Err(SupervisorError::NotFound("no request handler installed".into()).to_payload()),
                };
                inner.respond(id, result).await;
            });
        }
        Err(e) => match message::recover_request_id(&message.data) {
            Some(id) => {
                warn!(%id, origin = %message.origin, error = %e, "malformed request");
                let inner = inner.clone();
                let payload = SupervisorError::Validation(format!("malformed request: {}", e)).to_payload();
                tokio::spawn(async move { inner.respond(id, Err(payload)).await });
            }
            None => warn!(origin = %message.origin, error = %e, "undecodable message dropped"),
        },
    }
}

/// One frame's end of a bridge. Dropping it closes the frame.
pub struct BridgeEndpoint {
    inner: Arc<Inner>,
    origin: String,
    reader: JoinHandle<()>,
}

impl BridgeEndpoint {
    /// Starts serving `port`. Must be called inside a tokio runtime.
    pub fn new(port: MessagePort) -> Self {
        let origin = port.origin().to_string();
        let (sender, receiver) = port.split();
        let inner = Arc::new(Inner {
            sender: Mutex::new(Some(sender)),
            pending: Mutex::new(HashMap::new()),
            request_handler: RwLock::new(None),
            closed: AtomicBool::new(false),
        });
        let reader = tokio::spawn(read_loop(inner.clone(), receiver));
        Self {
            inner,
            origin,
            reader,
        }
    }

    /// The origin stamped on this endpoint's messages.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn set_request_handler<H, Fut>(&self, handler: H)
    where
        H: Fn(RequestContext, BridgeRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ErrorPayload>> + Send + 'static,
    {
        let handler: RequestHandler = Arc::new(move |ctx, req| Box::pin(handler(ctx, req)));
        *self
            .inner
            .request_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Sends `request` and waits for the response with the same id.
    pub async fn call(&self, request: BridgeRequest) -> Result<Value, BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::Closed);
        }
        let id = Uuid::new_v4();
        let data = serde_json::to_string(&BridgeMessage::Request { id, request })
            .map_err(|e| BridgeError::Encode(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending().insert(id, tx);
        // The reader may have drained the map just before the insert.
        if self.inner.closed.load(Ordering::SeqCst) {
            self.inner.pending().remove(&id);
            return Err(BridgeError::Closed);
        }
        if let Err(e) = self.inner.post(data).await {
            self.inner.pending().remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Closed),
        }
    }

    pub async fn function_call(&self, args: FunctionCallArgs) -> Result<Value, BridgeError> {
        self.call(BridgeRequest::FunctionCall(args)).await
    }

    pub async fn preload_plugins(&self, plugins: Vec<String>) -> Result<Value, BridgeError> {
        self.call(BridgeRequest::PreloadPlugins(plugins)).await
    }

    /// Interface description of `plugin`, loading it first.
    pub async fn get_json(&self, plugin: &str) -> Result<Value, BridgeError> {
        self.call(BridgeRequest::GetJson(plugin.to_string())).await
    }

    /// Number of calls still waiting for a response.
    pub fn outstanding(&self) -> usize {
        self.inner.pending().len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst) || self.reader.is_finished()
    }

    /// Tears the frame down: outstanding calls fail with
    /// [`BridgeError::Closed`] and later responses are discarded.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.reader.abort();
        self.inner.sender().take();
        self.inner.fail_pending();
    }
}

impl fmt::Debug for BridgeEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeEndpoint")
            .field("origin", &self.origin)
            .field("outstanding", &self.outstanding())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for BridgeEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens prompts in a prompt frame reached over a bridge.
pub struct BridgePromptSurface {
    endpoint: BridgeEndpoint,
}

impl BridgePromptSurface {
    pub fn new(endpoint: BridgeEndpoint) -> Self {
        Self { endpoint }
    }

    /// Connects a prompt frame at `prompt_origin`; returns the surface and
    /// the prompt frame's endpoint.
    pub fn pair(supervisor_origin: &str, prompt_origin: &str) -> (Self, BridgeEndpoint) {
        let (ours, theirs) = channel(supervisor_origin, prompt_origin);
        (Self::new(BridgeEndpoint::new(ours)), BridgeEndpoint::new(theirs))
    }
}

#[async_trait]
impl PromptSurface for BridgePromptSurface {
    async fn open(&self, params: PromptParams) -> Result<(), SupervisorError> {
        self.endpoint
            .call(BridgeRequest::OpenPrompt(params))
            .await
            .map(|_| ())
            .map_err(SupervisorError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::time::Duration;

    fn pair() -> (BridgeEndpoint, BridgeEndpoint) {
        let (a, b) = channel("https://a.psibase.test", "https://b.psibase.test");
        (BridgeEndpoint::new(a), BridgeEndpoint::new(b))
    }

    #[tokio::test]
    async fn handler_sees_the_stamped_origin() {
        let (a, b) = pair();
        b.set_request_handler(|ctx: RequestContext, _req| async move { Ok(Value::String(ctx.origin)) });
        let got = a.preload_plugins(vec![]).await.unwrap();
        assert_eq!(got, Value::String("https://a.psibase.test".into()));
    }

    #[tokio::test]
    async fn missing_handler_answers_with_an_error() {
        let (a, _b) = pair();
        match a.preload_plugins(vec![]).await {
            Err(BridgeError::Remote(e)) => assert_eq!(e.kind, ErrorKind::NotFound),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn closing_fails_outstanding_calls() {
        let (a, b) = pair();
        b.set_request_handler(|_ctx, _req| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        });
        let a = Arc::new(a);
        let call = {
            let a = a.clone();
            tokio::spawn(async move { a.preload_plugins(vec![]).await })
        };
        while a.outstanding() == 0 {
            tokio::task::yield_now().await;
        }
        a.close();
        assert_eq!(call.await.unwrap(), Err(BridgeError::Closed));
        assert_eq!(a.preload_plugins(vec![]).await, Err(BridgeError::Closed));
    }

    #[tokio::test]
    async fn peer_drop_closes_the_endpoint() {
        let (a, b) = pair();
        drop(b);
        assert_eq!(a.preload_plugins(vec![]).await, Err(BridgeError::Closed));
    }
}
