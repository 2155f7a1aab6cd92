use super::error::McpError;
use super::transport::{
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, Transport,
    TransportErrorCode,
};
use super::types::{CancelledNotification, ErrorCode};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// Key in a JSON-RPC error's `data` naming a tool the server does not know.
pub const UNKNOWN_TOOL_KEY: &str = "unknownTool";

type Waiter = oneshot::Sender<Result<JsonRpcResponse, McpError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    TransportClosed,
    SessionClosed,
}

impl CloseReason {
    fn error(self) -> McpError {
        match self {
            Self::TransportClosed => McpError::TransportClosed,
            Self::SessionClosed => McpError::SessionClosed,
        }
    }
}

#[derive(Default)]
struct PendingRequests {
    waiters: HashMap<u64, Waiter>,
    closed: Option<CloseReason>,
}

type SharedPending = Arc<Mutex<PendingRequests>>;

fn lock(pending: &SharedPending) -> std::sync::MutexGuard<'_, PendingRequests> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes its waiter when the request finishes, times out or is dropped.
struct PendingGuard {
    pending: SharedPending,
    id: u64,
}

impl PendingGuard {
    fn register(pending: &SharedPending, id: u64, waiter: Waiter) -> Result<Self, McpError> {
        let mut guard = lock(pending);
        if let Some(reason) = guard.closed {
            return Err(reason.error());
        }
        guard.waiters.insert(id, waiter);
        Ok(Self {
            pending: pending.clone(),
            id,
        })
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        lock(&self.pending).waiters.remove(&self.id);
    }
}

/// JSON-RPC session over a transport: correlates outgoing requests with
/// their responses and dispatches incoming requests to registered handlers.
pub struct Protocol<T: Transport> {
    transport: Arc<T>,

    request_id: Arc<AtomicU64>,
    pending_requests: SharedPending,
    request_handlers: Arc<HashMap<String, Box<dyn RequestHandler>>>,
    notification_handlers: Arc<HashMap<String, Box<dyn NotificationHandler>>>,
}

impl<T: Transport> Clone for Protocol<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            request_id: self.request_id.clone(),
            pending_requests: self.pending_requests.clone(),
            request_handlers: self.request_handlers.clone(),
            notification_handlers: self.notification_handlers.clone(),
        }
    }
}

impl<T: Transport> Protocol<T> {
    pub fn builder(transport: T) -> ProtocolBuilder<T> {
        ProtocolBuilder::new(transport)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let notification = JsonRpcNotification {
            method: method.to_string(),
            params,
            ..Default::default()
        };
        self.transport
            .send(&JsonRpcMessage::Notification(notification))
            .await?;
        Ok(())
    }

    /// Send a request and wait for the response carrying the same id.
    ///
    /// Responses are matched by id, so any number of requests may be in
    /// flight at once and answered in any order.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        let _waiter = PendingGuard::register(&self.pending_requests, id, tx)?;

        let msg = JsonRpcMessage::Request(JsonRpcRequest {
            id,
            method: method.to_string(),
            params,
            ..Default::default()
        });
        self.transport.send(&msg).await?;

        match timeout(options.timeout, rx).await {
            Ok(Ok(result)) => result,
            // the waiter was dropped without an answer
            Ok(Err(_)) => Err(McpError::TransportClosed),
            Err(_) => {
                debug!("Request {} ({}) timed out", id, method);
                self.cancel_remote(id, "timeout").await;
                Err(McpError::Timeout {
                    method: method.to_string(),
                    timeout: options.timeout,
                })
            }
        }
    }

    async fn cancel_remote(&self, request_id: u64, reason: &str) {
        let params = CancelledNotification {
            request_id,
            reason: Some(reason.to_string()),
        };
        let params = match serde_json::to_value(params) {
            Ok(params) => params,
            Err(e) => {
                warn!("Failed to encode cancellation: {}", e);
                return;
            }
        };
        if let Err(e) = self.notify("notifications/cancelled", Some(params)).await {
            debug!("Failed to send cancellation for {}: {}", request_id, e);
        }
    }

    /// Process incoming messages until the transport's sequence ends.
    ///
    /// Every request still waiting for a response is failed with
    /// `TransportClosed` once the loop exits.
    pub async fn listen(&self) -> Result<(), McpError> {
        debug!("Listening for messages");
        let outcome = loop {
            let message = match self.transport.receive().await {
                Ok(Some(message)) => message,
                Ok(None) => break Ok(()),
                Err(e) if e.code() == Some(TransportErrorCode::InvalidMessage) => {
                    warn!("Dropping malformed frame: {}", e);
                    continue;
                }
                Err(e) => {
                    error!("Transport failed: {}", e);
                    break Err(McpError::from(e));
                }
            };

            match message {
                JsonRpcMessage::Request(request) => {
                    if let Err(e) = self.handle_request(request).await {
                        break Err(e);
                    }
                }
                JsonRpcMessage::Response(response) => self.handle_response(response),
                JsonRpcMessage::Notification(notification) => {
                    self.handle_notification(notification).await
                }
            }
        };
        self.fail_pending(CloseReason::TransportClosed);
        debug!("Stopped listening");
        outcome
    }

    /// Fail every pending request with `SessionClosed` and close the transport.
    pub async fn close(&self) -> Result<(), McpError> {
        self.fail_pending(CloseReason::SessionClosed);
        self.transport.close().await?;
        Ok(())
    }

    pub(crate) fn fail_pending_on_drop(&self) {
        self.fail_pending(CloseReason::SessionClosed);
    }

    fn fail_pending(&self, reason: CloseReason) {
        let waiters: Vec<Waiter> = {
            let mut pending = lock(&self.pending_requests);
            pending.closed.get_or_insert(reason);
            pending.waiters.drain().map(|(_, waiter)| waiter).collect()
        };
        if !waiters.is_empty() {
            debug!("Failing {} pending request(s): {:?}", waiters.len(), reason);
        }
        for waiter in waiters {
            let _ = waiter.send(Err(reason.error()));
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        lock(&self.pending_requests).waiters.len()
    }

    fn handle_response(&self, response: JsonRpcResponse) {
        let waiter = lock(&self.pending_requests).waiters.remove(&response.id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(Ok(response));
            }
            None => warn!("Received response for unknown request {}", response.id),
        }
    }

    async fn handle_notification(&self, notification: JsonRpcNotification) {
        match self.notification_handlers.get(&notification.method) {
            Some(handler) => {
                let method = notification.method.clone();
                if let Err(e) = handler.handle(notification).await {
                    warn!("Notification handler for {} failed: {:#}", method, e);
                }
            }
            None => debug!("Ignoring notification {}", notification.method),
        }
    }

    async fn handle_request(&self, request: JsonRpcRequest) -> Result<(), McpError> {
        let id = request.id;
        let response = match self.request_handlers.get(&request.method) {
            Some(handler) => match handler.handle(request).await {
                Ok(result) => JsonRpcResponse {
                    id,
                    result: Some(result),
                    ..Default::default()
                },
                Err(error) => JsonRpcResponse {
                    id,
                    error: Some(error),
                    ..Default::default()
                },
            },
            None => {
                debug!("No handler for {}", request.method);
                JsonRpcResponse {
                    id,
                    error: Some(JsonRpcError::new(
                        ErrorCode::MethodNotFound,
                        format!("Method not found: {}", request.method),
                    )),
                    ..Default::default()
                }
            }
        };
        self.transport
            .send(&JsonRpcMessage::Response(response))
            .await?;
        Ok(())
    }
}

/// The default request timeout, in milliseconds
pub const DEFAULT_REQUEST_TIMEOUT_MSEC: u64 = 60000;

#[derive(Debug, Clone, Copy)]
pub struct RequestOptions {
    timeout: Duration,
}

impl RequestOptions {
    pub fn timeout(self, timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MSEC),
        }
    }
}

pub struct ProtocolBuilder<T: Transport> {
    transport: T,
    request_handlers: HashMap<String, Box<dyn RequestHandler>>,
    notification_handlers: HashMap<String, Box<dyn NotificationHandler>>,
}

impl<T: Transport> ProtocolBuilder<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            request_handlers: HashMap::new(),
            notification_handlers: HashMap::new(),
        }
    }

    /// Register a typed request handler
    pub fn request_handler<Req, Resp, F, Fut>(mut self, method: &str, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + Sync + 'static,
        Resp: Serialize + Send + Sync + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
    {
        let handler = TypedRequestHandler {
            handler: Box::new(move |req| handler(req).boxed()),
            _phantom: std::marker::PhantomData,
        };

        self.request_handlers
            .insert(method.to_string(), Box::new(handler));
        self
    }

    pub fn has_request_handler(&self, method: &str) -> bool {
        self.request_handlers.contains_key(method)
    }

    pub fn notification_handler<N, F, Fut>(mut self, method: &str, handler: F) -> Self
    where
        N: DeserializeOwned + Send + Sync + 'static,
        F: Fn(N) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.notification_handlers.insert(
            method.to_string(),
            Box::new(TypedNotificationHandler {
                handler: Box::new(move |n| handler(n).boxed()),
                _phantom: std::marker::PhantomData,
            }),
        );
        self
    }

    pub fn build(self) -> Protocol<T> {
        Protocol {
            transport: Arc::new(self.transport),
            request_handlers: Arc::new(self.request_handlers),
            notification_handlers: Arc::new(self.notification_handlers),
            request_id: Arc::new(AtomicU64::new(0)),
            pending_requests: Arc::new(Mutex::new(PendingRequests::default())),
        }
    }
}

#[async_trait]
trait RequestHandler: Send + Sync {
    async fn handle(&self, request: JsonRpcRequest) -> Result<Value, JsonRpcError>;
}

#[async_trait]
trait NotificationHandler: Send + Sync {
    async fn handle(&self, notification: JsonRpcNotification) -> anyhow::Result<()>;
}

/// Absent or null params decode as `()` or as an empty object, whichever fits.
fn decode_params<P: DeserializeOwned>(params: Option<Value>) -> serde_json::Result<P> {
    match params {
        Some(params) if !params.is_null() => serde_json::from_value(params),
        _ => serde_json::from_value(Value::Null)
            .or_else(|_| serde_json::from_value(Value::Object(Default::default()))),
    }
}

/// Map a handler failure onto the JSON-RPC error the peer sees.
fn handler_error(error: &anyhow::Error) -> JsonRpcError {
    match error.downcast_ref::<McpError>() {
        Some(McpError::UnknownTool(name)) => {
            let mut data = serde_json::Map::new();
            data.insert(UNKNOWN_TOOL_KEY.to_string(), Value::String(name.clone()));
            JsonRpcError::new(ErrorCode::InvalidParams, format!("Unknown tool: {}", name))
                .with_data(Value::Object(data))
        }
        Some(McpError::InvalidArguments(message)) => {
            JsonRpcError::new(ErrorCode::InvalidParams, message.clone())
        }
        _ => JsonRpcError::new(ErrorCode::InternalError, error.to_string()),
    }
}

type BoxedHandler<Req, Resp> = Box<dyn Fn(Req) -> BoxFuture<'static, anyhow::Result<Resp>> + Send + Sync>;

struct TypedRequestHandler<Req, Resp>
where
    Req: DeserializeOwned + Send + Sync + 'static,
    Resp: Serialize + Send + Sync + 'static,
{
    handler: BoxedHandler<Req, Resp>,
    _phantom: std::marker::PhantomData<(Req, Resp)>,
}

#[async_trait]
impl<Req, Resp> RequestHandler for TypedRequestHandler<Req, Resp>
where
    Req: DeserializeOwned + Send + Sync + 'static,
    Resp: Serialize + Send + Sync + 'static,
{
    async fn handle(&self, request: JsonRpcRequest) -> Result<Value, JsonRpcError> {
        let params: Req = decode_params(request.params).map_err(|e| {
            JsonRpcError::new(ErrorCode::InvalidParams, format!("Invalid params: {}", e))
        })?;
        let result = (self.handler)(params)
            .await
            .map_err(|e| handler_error(&e))?;
        let result = serde_json::to_value(result)
            .map_err(|e| JsonRpcError::new(ErrorCode::InternalError, e.to_string()))?;
        // a unit result still has to be an object on the wire
        if result.is_null() {
            Ok(Value::Object(Default::default()))
        } else {
            Ok(result)
        }
    }
}

struct TypedNotificationHandler<N>
where
    N: DeserializeOwned + Send + Sync + 'static,
{
    handler: BoxedHandler<N, ()>,
    _phantom: std::marker::PhantomData<N>,
}

#[async_trait]
impl<N> NotificationHandler for TypedNotificationHandler<N>
where
    N: DeserializeOwned + Send + Sync + 'static,
{
    async fn handle(&self, notification: JsonRpcNotification) -> anyhow::Result<()> {
        let params: N = decode_params(notification.params)?;
        (self.handler)(params).await
    }
}
