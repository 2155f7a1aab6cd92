use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use crate::{
    error::McpError,
    protocol::{Protocol, ProtocolBuilder, RequestOptions, UNKNOWN_TOOL_KEY, DEFAULT_REQUEST_TIMEOUT_MSEC},
    transport::{JsonRpcError, JsonRpcResponse, Transport},
    types::{
        CallToolRequest, CallToolResponse, ClientCapabilities, Implementation, InitializeRequest,
        InitializeResponse, ListRequest, Tool, ToolsListResponse, LATEST_PROTOCOL_VERSION,
        SUPPORTED_PROTOCOL_VERSIONS,
    },
};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default bound on the `initialize` round-trip.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle of a client session. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
    Closed,
}

type SharedState = Arc<Mutex<SessionState>>;

fn current(state: &SharedState) -> SessionState {
    *state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn set_state(state: &SharedState, next: SessionState) {
    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
    // Closed is terminal
    if *state != SessionState::Closed {
        debug!("Session state {:?} -> {:?}", *state, next);
        *state = next;
    }
}

/// A connected MCP session. Calls may be issued concurrently from any
/// number of tasks through a shared reference.
pub struct Client<T: Transport> {
    protocol: Protocol<T>,
    state: SharedState,
    closing: AtomicBool,
    listener: JoinHandle<()>,
    request_timeout: Duration,
    server: Option<InitializeResponse>,
}

impl<T: Transport> Client<T> {
    pub fn builder(transport: T) -> ClientBuilder<T> {
        ClientBuilder::new(transport)
    }

    pub fn state(&self) -> SessionState {
        current(&self.state)
    }

    /// Name and version the server reported during the handshake.
    pub fn server_info(&self) -> Option<&Implementation> {
        self.server.as_ref().map(|init| &init.server_info)
    }

    pub fn protocol_version(&self) -> Option<&str> {
        self.server.as_ref().map(|init| init.protocol_version.as_str())
    }

    pub fn instructions(&self) -> Option<&str> {
        self.server.as_ref()?.instructions.as_deref()
    }

    /// Send a raw request and return the response without interpreting it.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        self.ensure_ready()?;
        self.protocol
            .request(
                method,
                params,
                RequestOptions::default().timeout(self.request_timeout),
            )
            .await
    }

    /// Invoke a tool on the server.
    ///
    /// `arguments` must be a JSON object or null. An error-tagged result is
    /// returned as [`McpError::RemoteTool`].
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResponse, McpError> {
        let arguments = match arguments {
            Value::Null => None,
            Value::Object(map) => Some(map.into_iter().collect::<HashMap<_, _>>()),
            other => {
                return Err(McpError::InvalidArguments(format!(
                    "expected an object, got {}",
                    other
                )))
            }
        };
        let request = CallToolRequest {
            name: name.to_string(),
            arguments,
            meta: None,
        };

        let response = self
            .request("tools/call", Some(serde_json::to_value(request)?))
            .await?;
        if let Some(error) = response.error {
            if let Some(tool) = unknown_tool(&error) {
                return Err(McpError::UnknownTool(tool));
            }
            return Err(McpError::RemoteTool {
                tool: name.to_string(),
                message: error.message,
            });
        }

        let result = response.result.ok_or_else(|| McpError::RemoteTool {
            tool: name.to_string(),
            message: "empty result".to_string(),
        })?;
        let result: CallToolResponse = serde_json::from_value(result)?;
        if result.is_error() {
            return Err(McpError::RemoteTool {
                tool: name.to_string(),
                message: result.text_content(),
            });
        }
        Ok(result)
    }

    pub async fn list_tools(&self) -> Result<Vec<Tool>, McpError> {
        let params = serde_json::to_value(ListRequest::default())?;
        let response: ToolsListResponse = self.typed_request("tools/list", Some(params)).await?;
        Ok(response.tools)
    }

    pub async fn ping(&self) -> Result<(), McpError> {
        let _: Value = self.typed_request("ping", None).await?;
        Ok(())
    }

    async fn typed_request<R: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<R, McpError> {
        let response = self.request(method, params).await?;
        if let Some(error) = response.error {
            return Err(McpError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(serde_json::from_value(response.result.unwrap_or(Value::Null))?)
    }

    /// End the session. Pending calls fail with `SessionClosed`. Calling
    /// this more than once is a no-op.
    pub async fn close(&self) -> Result<(), McpError> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Closing session");
        set_state(&self.state, SessionState::Closed);
        let result = self.protocol.close().await;
        self.listener.abort();
        result
    }

    fn ensure_ready(&self) -> Result<(), McpError> {
        match self.state() {
            SessionState::Ready => Ok(()),
            SessionState::Closed => Err(McpError::SessionClosed),
            state => Err(McpError::NotReady(state)),
        }
    }

    async fn initialize(
        &self,
        client_info: Implementation,
        capabilities: ClientCapabilities,
        timeout: Duration,
    ) -> Result<InitializeResponse, McpError> {
        let request = InitializeRequest {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities,
            client_info,
        };
        let response = self
            .protocol
            .request(
                "initialize",
                Some(serde_json::to_value(request)?),
                RequestOptions::default().timeout(timeout),
            )
            .await
            .map_err(|e| McpError::Handshake(e.to_string()))?;

        if let Some(error) = response.error {
            return Err(McpError::Handshake(format!(
                "server rejected initialize: {} ({})",
                error.message, error.code
            )));
        }
        let result = response
            .result
            .ok_or_else(|| McpError::Handshake("empty initialize result".to_string()))?;
        let init: InitializeResponse = serde_json::from_value(result)
            .map_err(|e| McpError::Handshake(format!("malformed initialize result: {}", e)))?;
        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&init.protocol_version.as_str()) {
            return Err(McpError::Handshake(format!(
                "unsupported protocol version {}",
                init.protocol_version
            )));
        }

        self.protocol
            .notify("notifications/initialized", None)
            .await
            .map_err(|e| McpError::Handshake(e.to_string()))?;
        Ok(init)
    }
}

impl<T: Transport> Drop for Client<T> {
    fn drop(&mut self) {
        self.listener.abort();
        self.protocol.fail_pending_on_drop();
    }
}

/// Name of the unknown tool an error payload refers to, if any.
fn unknown_tool(error: &JsonRpcError) -> Option<String> {
    error
        .data
        .as_ref()?
        .get(UNKNOWN_TOOL_KEY)?
        .as_str()
        .map(str::to_string)
}

pub struct ClientBuilder<T: Transport> {
    protocol: ProtocolBuilder<T>,
    client_info: Implementation,
    capabilities: ClientCapabilities,
    request_timeout: Duration,
    handshake_timeout: Duration,
}

impl<T: Transport> ClientBuilder<T> {
    pub fn new(transport: T) -> Self {
        Self {
            protocol: ProtocolBuilder::new(transport),
            client_info: Implementation {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            capabilities: ClientCapabilities::default(),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MSEC),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.client_info.name = name.into();
        self
    }

    pub fn version<S: Into<String>>(mut self, version: S) -> Self {
        self.client_info.version = version.into();
        self
    }

    pub fn capabilities(mut self, capabilities: ClientCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Open the transport and run the `initialize` handshake.
    pub async fn connect(self) -> Result<Client<T>, McpError> {
        let protocol = self.protocol.build();
        protocol
            .transport()
            .open()
            .await
            .map_err(|e| McpError::Handshake(format!("failed to open transport: {}", e)))?;

        let state = Arc::new(Mutex::new(SessionState::Connecting));
        let listener = {
            let protocol = protocol.clone();
            let state = state.clone();
            tokio::spawn(async move {
                if let Err(e) = protocol.listen().await {
                    warn!("Session reader stopped: {}", e);
                }
                set_state(&state, SessionState::Closed);
            })
        };

        let mut client = Client {
            protocol,
            state,
            closing: AtomicBool::new(false),
            listener,
            request_timeout: self.request_timeout,
            server: None,
        };

        match client
            .initialize(self.client_info, self.capabilities, self.handshake_timeout)
            .await
        {
            Ok(init) => {
                info!(
                    "Connected to {} {} (protocol {})",
                    init.server_info.name, init.server_info.version, init.protocol_version
                );
                client.server = Some(init);
                let mut state = client.state.lock().unwrap_or_else(PoisonError::into_inner);
                // the reader may already have seen the transport end
                if *state == SessionState::Connecting {
                    *state = SessionState::Ready;
                }
            }
            Err(e) => {
                warn!("Handshake failed: {}", e);
                if let Err(close_error) = client.close().await {
                    debug!("Failed to close transport after handshake error: {}", close_error);
                }
                return Err(e);
            }
        }
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{
        ClientInMemoryTransport, JsonRpcMessage, JsonRpcRequest, ServerInMemoryTransport,
    };
    use crate::types::ErrorCode;
    use anyhow::{bail, Result};
    use serde_json::json;
    use std::future::Future;
    use tokio::sync::mpsc;

    fn scripted<F, Fut>(script: F) -> ClientInMemoryTransport
    where
        F: Fn(ServerInMemoryTransport) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        ClientInMemoryTransport::new(move |t| {
            let script = script(t);
            tokio::spawn(async move {
                if let Err(e) = script.await {
                    eprintln!("script failed: {e:#}");
                }
            })
        })
    }

    async fn reply(t: &ServerInMemoryTransport, id: u64, result: Value) -> Result<()> {
        t.send(&JsonRpcMessage::Response(JsonRpcResponse {
            id,
            result: Some(result),
            ..Default::default()
        }))
        .await?;
        Ok(())
    }

    async fn next_request(t: &ServerInMemoryTransport) -> Result<JsonRpcRequest> {
        loop {
            match t.receive().await? {
                Some(JsonRpcMessage::Request(request)) => return Ok(request),
                Some(_) => continue,
                None => bail!("client hung up"),
            }
        }
    }

    async fn handshake(t: &ServerInMemoryTransport) -> Result<()> {
        let init = next_request(t).await?;
        if init.method != "initialize" {
            bail!("expected initialize, got {}", init.method);
        }
        reply(
            t,
            init.id,
            json!({
                "protocolVersion": LATEST_PROTOCOL_VERSION,
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "scripted", "version": "0.1.0"},
            }),
        )
        .await?;
        match t.receive().await? {
            Some(JsonRpcMessage::Notification(n)) if n.method == "notifications/initialized" => Ok(()),
            other => bail!("expected initialized notification, got {:?}", other),
        }
    }

    async fn drain(t: &ServerInMemoryTransport) {
        while let Ok(Some(_)) = t.receive().await {}
    }

    fn text(text: &str) -> Value {
        json!({"content": [{"type": "text", "text": text}]})
    }

    #[tokio::test]
    async fn test_connect_and_state() -> Result<()> {
        let transport = scripted(|t| async move {
            handshake(&t).await?;
            drain(&t).await;
            Ok(())
        });
        let client = Client::builder(transport)
            .name("test-client")
            .version("0.1.0")
            .connect()
            .await?;
        assert_eq!(client.state(), SessionState::Ready);
        assert_eq!(client.server_info().unwrap().name, "scripted");
        assert_eq!(client.protocol_version(), Some(LATEST_PROTOCOL_VERSION));

        client.close().await?;
        assert_eq!(client.state(), SessionState::Closed);
        // closing twice is fine
        client.close().await?;
        assert!(matches!(
            client.call_tool("anything", Value::Null).await,
            Err(McpError::SessionClosed)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_responses_matched_by_id() -> Result<()> {
        const CITIES: [&str; 6] = ["Oslo", "Rome", "Lima", "Cairo", "Perth", "Quito"];

        let transport = scripted(|t| async move {
            handshake(&t).await?;
            let mut calls = Vec::new();
            for _ in CITIES {
                calls.push(next_request(&t).await?);
            }
            // answer in reverse arrival order
            for call in calls.into_iter().rev() {
                let city = call
                    .params
                    .as_ref()
                    .and_then(|p| p["arguments"]["city"].as_str())
                    .unwrap_or_default()
                    .to_string();
                reply(&t, call.id, text(&city)).await?;
            }
            drain(&t).await;
            Ok(())
        });
        let client = Client::builder(transport).connect().await?;

        let results = futures::future::join_all(
            CITIES
                .iter()
                .map(|city| client.call_tool("lookup", json!({ "city": city }))),
        )
        .await;
        for (city, result) in CITIES.iter().zip(results) {
            assert_eq!(result?.text_content(), *city);
        }

        client.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_tool_error_mapping() -> Result<()> {
        let transport = scripted(|t| async move {
            handshake(&t).await?;
            let unknown = next_request(&t).await?;
            t.send(&JsonRpcMessage::Response(JsonRpcResponse {
                id: unknown.id,
                error: Some(
                    JsonRpcError::new(ErrorCode::InvalidParams, "Unknown tool: nope")
                        .with_data(json!({"unknownTool": "nope"})),
                ),
                ..Default::default()
            }))
            .await?;

            let failing = next_request(&t).await?;
            reply(
                &t,
                failing.id,
                json!({"content": [{"type": "text", "text": "boom"}], "isError": true}),
            )
            .await?;

            let internal = next_request(&t).await?;
            t.send(&JsonRpcMessage::Response(JsonRpcResponse {
                id: internal.id,
                error: Some(JsonRpcError::new(ErrorCode::InternalError, "oops")),
                ..Default::default()
            }))
            .await?;
            drain(&t).await;
            Ok(())
        });
        let client = Client::builder(transport).connect().await?;

        let error = client.call_tool("nope", json!({})).await.unwrap_err();
        assert!(matches!(error, McpError::UnknownTool(ref name) if name == "nope"));
        assert_eq!(client.state(), SessionState::Ready);

        let error = client.call_tool("failing", json!({})).await.unwrap_err();
        assert!(matches!(error, McpError::RemoteTool { ref message, .. } if message == "boom"));

        let error = client.call_tool("internal", json!({})).await.unwrap_err();
        assert!(matches!(error, McpError::RemoteTool { ref message, .. } if message == "oops"));

        let error = client.call_tool("bad", json!(["not", "an", "object"])).await.unwrap_err();
        assert!(matches!(error, McpError::InvalidArguments(_)));

        client.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_close_fails_pending_call() -> Result<()> {
        let transport = scripted(|t| async move {
            handshake(&t).await?;
            drain(&t).await;
            Ok(())
        });
        let client = Arc::new(Client::builder(transport).connect().await?);

        let caller = client.clone();
        let call = tokio::spawn(async move { caller.call_tool("slow", Value::Null).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        client.close().await?;
        let result = call.await?;
        assert!(matches!(result, Err(McpError::SessionClosed)));
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_call_leaves_no_waiter() -> Result<()> {
        let transport = scripted(|t| async move {
            handshake(&t).await?;
            drain(&t).await;
            Ok(())
        });
        let client = Client::builder(transport).connect().await?;

        let result =
            tokio::time::timeout(Duration::from_millis(50), client.call_tool("slow", Value::Null)).await;
        assert!(result.is_err());
        assert_eq!(client.protocol.pending_count(), 0);
        assert_eq!(client.state(), SessionState::Ready);

        client.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_timeout_sends_cancellation() -> Result<()> {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let transport = scripted(move |t| {
            let seen_tx = seen_tx.clone();
            async move {
                handshake(&t).await?;
                while let Some(message) = t.receive().await? {
                    if let JsonRpcMessage::Notification(n) = message {
                        let _ = seen_tx.send(n);
                    }
                }
                Ok(())
            }
        });
        let client = Client::builder(transport)
            .request_timeout(Duration::from_millis(50))
            .connect()
            .await?;

        let error = client.call_tool("slow", Value::Null).await.unwrap_err();
        assert!(matches!(error, McpError::Timeout { .. }));

        let cancelled = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
            .await?
            .expect("cancellation notification");
        assert_eq!(cancelled.method, "notifications/cancelled");
        assert_eq!(cancelled.params.unwrap()["reason"], "timeout");

        client.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_peer_hangup_closes_session() -> Result<()> {
        let transport = scripted(|t| async move {
            handshake(&t).await?;
            // take one call and disappear
            next_request(&t).await?;
            Ok(())
        });
        let client = Client::builder(transport).connect().await?;

        let error = client.call_tool("doomed", Value::Null).await.unwrap_err();
        assert!(matches!(error, McpError::TransportClosed));

        tokio::time::timeout(Duration::from_secs(5), async {
            while client.state() != SessionState::Closed {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await?;
        assert!(matches!(
            client.call_tool("again", Value::Null).await,
            Err(McpError::SessionClosed)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_handshake_rejected() -> Result<()> {
        let transport = scripted(|t| async move {
            let init = next_request(&t).await?;
            t.send(&JsonRpcMessage::Response(JsonRpcResponse {
                id: init.id,
                error: Some(JsonRpcError::new(ErrorCode::InvalidRequest, "go away")),
                ..Default::default()
            }))
            .await?;
            drain(&t).await;
            Ok(())
        });
        let error = Client::builder(transport).connect().await.err().unwrap();
        assert!(matches!(error, McpError::Handshake(ref msg) if msg.contains("go away")));
        Ok(())
    }

    #[tokio::test]
    async fn test_handshake_unsupported_version() -> Result<()> {
        let transport = scripted(|t| async move {
            let init = next_request(&t).await?;
            reply(
                &t,
                init.id,
                json!({
                    "protocolVersion": "1999-01-01",
                    "capabilities": {},
                    "serverInfo": {"name": "ancient", "version": "0.0.1"},
                }),
            )
            .await?;
            drain(&t).await;
            Ok(())
        });
        let error = Client::builder(transport).connect().await.err().unwrap();
        assert!(matches!(error, McpError::Handshake(ref msg) if msg.contains("1999-01-01")));
        Ok(())
    }

    #[tokio::test]
    async fn test_handshake_timeout() -> Result<()> {
        let transport = scripted(|t| async move {
            drain(&t).await;
            Ok(())
        });
        let error = Client::builder(transport)
            .handshake_timeout(Duration::from_millis(50))
            .connect()
            .await
            .err()
            .unwrap();
        assert!(matches!(error, McpError::Handshake(_)));
        Ok(())
    }
}
