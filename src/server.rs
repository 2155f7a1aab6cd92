use std::{
    future::Future,
    sync::{Arc, RwLock},
};

use crate::{
    error::McpError,
    registry::ToolRegistry,
    types::{
        CallToolRequest, CallToolResponse, CancelledNotification, ListRequest, Tool,
        ToolsListResponse, SUPPORTED_PROTOCOL_VERSIONS,
    },
};

use super::{
    protocol::{Protocol, ProtocolBuilder},
    transport::Transport,
    types::{
        ClientCapabilities, Implementation, InitializeRequest, InitializeResponse,
        ServerCapabilities, LATEST_PROTOCOL_VERSION,
    },
};
use anyhow::Result;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

#[derive(Clone, Default)]
pub struct ServerState {
    client_capabilities: Option<ClientCapabilities>,
    client_info: Option<Implementation>,
    protocol_version: Option<String>,
    initialized: bool,
}

pub struct Server<T: Transport> {
    protocol: Protocol<T>,
    state: Arc<RwLock<ServerState>>,
    tools: Arc<ToolRegistry>,
}

impl<T: Transport> Clone for Server<T> {
    fn clone(&self) -> Self {
        Self {
            protocol: self.protocol.clone(),
            state: self.state.clone(),
            tools: self.tools.clone(),
        }
    }
}

pub struct ServerBuilder<T: Transport> {
    protocol: ProtocolBuilder<T>,
    server_info: Implementation,
    capabilities: ServerCapabilities,
    instructions: Option<String>,
    tools: ToolRegistry,
}

impl<T: Transport> ServerBuilder<T> {
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.server_info.name = name.into();
        self
    }

    pub fn version<S: Into<String>>(mut self, version: S) -> Self {
        self.server_info.version = version.into();
        self
    }

    pub fn capabilities(mut self, capabilities: ServerCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn instructions<S: Into<String>>(mut self, instructions: S) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Register a typed request handler
    /// for higher-level api use register_tool
    pub fn request_handler<Req, Resp, F, Fut>(mut self, method: &str, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + Sync + 'static,
        Resp: Serialize + Send + Sync + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
    {
        self.protocol = self.protocol.request_handler(method, handler);
        self
    }

    pub fn notification_handler<N, F, Fut>(mut self, method: &str, handler: F) -> Self
    where
        N: DeserializeOwned + Send + Sync + 'static,
        F: Fn(N) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.protocol = self.protocol.notification_handler(method, handler);
        self
    }

    /// Add a tool. Names are unique; a second registration under the same
    /// name is rejected and the first handler stays in place.
    pub fn register_tool<F, Fut>(&mut self, tool: Tool, f: F) -> Result<(), McpError>
    where
        F: Fn(CallToolRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CallToolResponse>> + Send + 'static,
    {
        debug!("Registering tool {}", tool.name);
        self.tools.register(tool, f)
    }

    pub fn build(self) -> Server<T> {
        Server::new(self)
    }
}

impl<T: Transport> Server<T> {
    pub fn builder(transport: T) -> ServerBuilder<T> {
        ServerBuilder {
            protocol: Protocol::builder(transport),
            server_info: Implementation {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            capabilities: ServerCapabilities {
                tools: Some(json!({})),
                ..Default::default()
            },
            instructions: None,
            tools: ToolRegistry::new(),
        }
    }

    fn new(builder: ServerBuilder<T>) -> Self {
        let state = Arc::new(RwLock::new(ServerState::default()));
        let tools = Arc::new(builder.tools);

        let mut protocol = builder
            .protocol
            .request_handler(
                "initialize",
                handle_init(
                    state.clone(),
                    builder.server_info,
                    builder.capabilities,
                    builder.instructions,
                ),
            )
            .notification_handler("notifications/initialized", handle_initialized(state.clone()))
            .notification_handler(
                "notifications/cancelled",
                |notification: CancelledNotification| async move {
                    debug!(
                        "Client cancelled request {} ({})",
                        notification.request_id,
                        notification.reason.as_deref().unwrap_or("no reason")
                    );
                    Ok(())
                },
            );

        if !protocol.has_request_handler("ping") {
            protocol = protocol.request_handler("ping", |_: Value| async { Ok(json!({})) });
        }

        // Add tools handlers if not already present
        if !protocol.has_request_handler("tools/list") {
            let list_tools = tools.clone();
            let call_tools = tools.clone();
            protocol = protocol
                .request_handler("tools/list", move |_req: ListRequest| {
                    let response = ToolsListResponse {
                        tools: list_tools.list_tools(),
                        next_cursor: None,
                        meta: None,
                    };
                    async move { Ok(response) }
                })
                .request_handler("tools/call", move |req: CallToolRequest| {
                    let tools = call_tools.clone();
                    async move {
                        debug!("Calling tool {}", req.name);
                        Ok(tools.call_tool(req).await?)
                    }
                });
        }

        Server {
            protocol: protocol.build(),
            state,
            tools,
        }
    }

    pub fn get_client_capabilities(&self) -> Option<ClientCapabilities> {
        self.state.read().ok()?.client_capabilities.clone()
    }

    pub fn get_client_info(&self) -> Option<Implementation> {
        self.state.read().ok()?.client_info.clone()
    }

    /// Protocol version agreed during the handshake.
    pub fn protocol_version(&self) -> Option<String> {
        self.state.read().ok()?.protocol_version.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.state
            .read()
            .ok()
            .map(|state| state.initialized)
            .unwrap_or(false)
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Serve until the transport's message sequence ends.
    pub async fn listen(&self) -> Result<(), McpError> {
        self.protocol.listen().await
    }

    /// Serve until the transport ends or `shutdown` resolves, whichever
    /// comes first. On shutdown the transport is closed.
    pub async fn listen_until<F>(&self, shutdown: F) -> Result<(), McpError>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            result = self.protocol.listen() => result,
            _ = shutdown => {
                info!("Shutting down server");
                self.protocol.close().await
            }
        }
    }
}

/// Echo the requested version when it is supported, otherwise offer the latest.
pub fn negotiate_version(requested: &str) -> &'static str {
    SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .copied()
        .find(|version| *version == requested)
        .unwrap_or(LATEST_PROTOCOL_VERSION)
}

fn handle_init(
    state: Arc<RwLock<ServerState>>,
    server_info: Implementation,
    capabilities: ServerCapabilities,
    instructions: Option<String>,
) -> impl Fn(InitializeRequest) -> std::future::Ready<Result<InitializeResponse>> {
    move |req| {
        let protocol_version = negotiate_version(&req.protocol_version);
        info!(
            "Client {} {} connected (protocol {})",
            req.client_info.name, req.client_info.version, protocol_version
        );
        let response = match state.write() {
            Ok(mut state) => {
                state.client_capabilities = Some(req.capabilities);
                state.client_info = Some(req.client_info);
                state.protocol_version = Some(protocol_version.to_string());
                Ok(InitializeResponse {
                    protocol_version: protocol_version.to_string(),
                    capabilities: capabilities.clone(),
                    server_info: server_info.clone(),
                    instructions: instructions.clone(),
                })
            }
            Err(_) => Err(anyhow::anyhow!("Lock poisoned")),
        };
        std::future::ready(response)
    }
}

fn handle_initialized(
    state: Arc<RwLock<ServerState>>,
) -> impl Fn(Value) -> std::future::Ready<Result<()>> {
    move |_| {
        let response = state
            .write()
            .map(|mut state| state.initialized = true)
            .map_err(|_| anyhow::anyhow!("Lock poisoned"));
        std::future::ready(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RequestOptions, UNKNOWN_TOOL_KEY};
    use crate::transport::{
        decode_frame, encode_frame, ClientInMemoryTransport, JsonRpcMessage, JsonRpcRequest,
        PipeTransport,
    };
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use crate::types::ErrorCode;
    use std::time::Duration;

    fn echo_tool() -> Tool {
        Tool {
            name: "echo".to_string(),
            description: Some("Echo the message back".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {"message": {"type": "string"}},
                "required": ["message"],
            }),
        }
    }

    fn build<T: Transport>(transport: T) -> Server<T> {
        let mut builder = Server::builder(transport).name("test-server").version("0.0.1");
        builder
            .register_tool(echo_tool(), |req: CallToolRequest| async move {
                let message = req
                    .arguments
                    .and_then(|args| args.get("message").cloned())
                    .and_then(|v| v.as_str().map(str::to_string))
                    .ok_or_else(|| anyhow::anyhow!("missing message"))?;
                Ok(CallToolResponse::text(message))
            })
            .unwrap();
        builder.build()
    }

    async fn connect() -> anyhow::Result<Protocol<ClientInMemoryTransport>> {
        let transport = ClientInMemoryTransport::new(|t| {
            tokio::spawn(async move {
                let _ = build(t).listen().await;
            })
        });
        transport.open().await?;
        let protocol = Protocol::builder(transport).build();
        let listener = protocol.clone();
        tokio::spawn(async move { listener.listen().await });
        Ok(protocol)
    }

    fn options() -> RequestOptions {
        RequestOptions::default().timeout(Duration::from_secs(5))
    }

    #[test]
    fn test_negotiate_version() {
        assert_eq!(negotiate_version("2024-11-05"), "2024-11-05");
        assert_eq!(negotiate_version(LATEST_PROTOCOL_VERSION), LATEST_PROTOCOL_VERSION);
        assert_eq!(negotiate_version("1999-01-01"), LATEST_PROTOCOL_VERSION);
    }

    #[test]
    fn test_duplicate_tool_rejected() {
        let transport = ClientInMemoryTransport::new(|_| tokio::spawn(async {}));
        let mut builder = Server::builder(transport);
        builder
            .register_tool(echo_tool(), |_| async { Ok(CallToolResponse::text("one")) })
            .unwrap();
        let error = builder
            .register_tool(echo_tool(), |_| async { Ok(CallToolResponse::text("two")) })
            .unwrap_err();
        assert!(matches!(error, McpError::DuplicateTool(_)));
        assert_eq!(builder.build().tools().len(), 1);
    }

    #[tokio::test]
    async fn test_initialize_handshake() -> anyhow::Result<()> {
        let protocol = connect().await?;
        let response = protocol
            .request(
                "initialize",
                Some(json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {},
                    "clientInfo": {"name": "test-client", "version": "1.0.0"},
                })),
                options(),
            )
            .await?;
        let init: InitializeResponse = serde_json::from_value(response.result.unwrap())?;
        assert_eq!(init.protocol_version, "2024-11-05");
        assert_eq!(init.server_info.name, "test-server");
        assert!(init.capabilities.tools.is_some());

        let pong = protocol.request("ping", None, options()).await?;
        assert_eq!(pong.result, Some(json!({})));

        protocol.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_server_records_client() -> anyhow::Result<()> {
        let slot = Arc::new(std::sync::Mutex::new(None));
        let server_slot = slot.clone();
        let transport = ClientInMemoryTransport::new(move |t| {
            let server = build(t);
            *server_slot.lock().unwrap() = Some(server.clone());
            tokio::spawn(async move {
                let _ = server.listen().await;
            })
        });
        transport.open().await?;
        let protocol = Protocol::builder(transport).build();
        let listener = protocol.clone();
        tokio::spawn(async move { listener.listen().await });

        let server = slot.lock().unwrap().clone().unwrap();
        assert!(!server.is_initialized());

        protocol
            .request(
                "initialize",
                Some(json!({
                    "protocolVersion": "2099-01-01",
                    "capabilities": {},
                    "clientInfo": {"name": "test-client", "version": "1.0.0"},
                })),
                options(),
            )
            .await?;
        protocol.notify("notifications/initialized", None).await?;
        // messages are handled in order, so the ping answer comes after the notification
        protocol.request("ping", None, options()).await?;

        assert!(server.is_initialized());
        assert_eq!(server.get_client_info().unwrap().name, "test-client");
        assert_eq!(server.get_client_capabilities(), Some(ClientCapabilities::default()));
        assert_eq!(server.protocol_version().as_deref(), Some(LATEST_PROTOCOL_VERSION));

        protocol.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_server_survives_malformed_frames() -> anyhow::Result<()> {
        let (local, remote) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(local);
        let server = build(PipeTransport::new(server_read, server_write));
        let serving = tokio::spawn(async move { server.listen().await });

        let (client_read, mut client_write) = tokio::io::split(remote);
        client_write.write_all(b"\xff\xfe garbage\nnot json\n").await?;
        let ping = JsonRpcMessage::Request(JsonRpcRequest {
            id: 7,
            method: "ping".to_string(),
            ..Default::default()
        });
        client_write.write_all(encode_frame(&ping)?.as_bytes()).await?;

        let mut lines = BufReader::new(client_read).lines();
        let reply = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await??
            .expect("ping reply");
        match decode_frame(&reply)? {
            JsonRpcMessage::Response(response) => {
                assert_eq!(response.id, 7);
                assert!(response.error.is_none());
            }
            other => panic!("unexpected reply {:?}", other),
        }

        client_write.shutdown().await?;
        assert!(serving.await?.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn test_tools_list_and_call() -> anyhow::Result<()> {
        let protocol = connect().await?;

        let response = protocol.request("tools/list", None, options()).await?;
        let list: ToolsListResponse = serde_json::from_value(response.result.unwrap())?;
        assert_eq!(list.tools, vec![echo_tool()]);

        let response = protocol
            .request(
                "tools/call",
                Some(json!({"name": "echo", "arguments": {"message": "hi"}})),
                options(),
            )
            .await?;
        let result: CallToolResponse = serde_json::from_value(response.result.unwrap())?;
        assert!(!result.is_error());
        assert_eq!(result.text_content(), "hi");

        // handler failure comes back as an error-tagged result
        let response = protocol
            .request("tools/call", Some(json!({"name": "echo"})), options())
            .await?;
        let result: CallToolResponse = serde_json::from_value(response.result.unwrap())?;
        assert!(result.is_error());
        assert!(result.text_content().contains("missing message"));

        protocol.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_tool_and_method() -> anyhow::Result<()> {
        let protocol = connect().await?;

        let response = protocol
            .request("tools/call", Some(json!({"name": "nope"})), options())
            .await?;
        let error = response.error.unwrap();
        assert_eq!(error.code, ErrorCode::InvalidParams as i32);
        assert_eq!(error.data.unwrap()[UNKNOWN_TOOL_KEY], "nope");

        let response = protocol.request("resources/list", None, options()).await?;
        assert_eq!(response.error.unwrap().code, ErrorCode::MethodNotFound as i32);

        protocol.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_listen_until_shutdown() -> anyhow::Result<()> {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let rx = Arc::new(tokio::sync::Mutex::new(Some(rx)));
        let transport = ClientInMemoryTransport::new(move |t| {
            let rx = rx.clone();
            tokio::spawn(async move {
                let Some(rx) = rx.lock().await.take() else {
                    return;
                };
                let server = build(t);
                let result = server
                    .listen_until(async {
                        let _ = rx.await;
                    })
                    .await;
                assert!(result.is_ok());
            })
        });
        transport.open().await?;

        tx.send(()).ok();
        // the server closed its end, so the client sees the end of the stream
        let message = tokio::time::timeout(Duration::from_secs(5), transport.receive()).await??;
        assert!(message.is_none());
        transport.close().await?;
        Ok(())
    }
}
