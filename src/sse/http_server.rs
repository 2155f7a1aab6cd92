use actix_web::dev::ServerHandle;
use actix_web::middleware::Logger;
use actix_web::web::Query;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use anyhow::{anyhow, Result};
use futures::StreamExt;
use uuid::Uuid;

use crate::server::Server;
use crate::transport::{format_sse_event, Message, ServerSseTransport};
use serde::Deserialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval};
use tracing::{debug, error, info, warn};

/// Listening address and routes of the SSE server.
#[derive(Debug, Clone)]
pub struct SseServerConfig {
    pub host: String,
    /// Port 0 picks a free port; see [`SseServer::local_addr`].
    pub port: u16,
    pub sse_path: String,
    pub message_path: String,
    /// Buffered messages per session and direction.
    pub channel_capacity: usize,
    /// Interval of the comment lines that detect vanished clients.
    pub keep_alive: Duration,
}

const KEEP_ALIVE_EVENT: &str = ": keep-alive\n\n";

impl Default for SseServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3001,
            sse_path: "/sse".to_string(),
            message_path: "/messages".to_string(),
            channel_capacity: 100,
            keep_alive: Duration::from_secs(15),
        }
    }
}

#[derive(Deserialize)]
pub struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

type Sessions = Arc<Mutex<HashMap<String, mpsc::Sender<Message>>>>;

type BuildServer = Arc<
    dyn Fn(ServerSseTransport) -> futures::future::BoxFuture<'static, Result<Server<ServerSseTransport>>>
        + Send
        + Sync,
>;

#[derive(Clone)]
pub struct AppState {
    sessions: Sessions,
    message_path: String,
    channel_capacity: usize,
    keep_alive: Duration,
    build_server: BuildServer,
}

impl AppState {
    fn sender(&self, session_id: &str) -> Option<mpsc::Sender<Message>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }
}

/// Drops the session from the map once its event stream goes away.
struct SessionGuard {
    session_id: String,
    sessions: Sessions,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.session_id);
        info!("SSE session {} closed", self.session_id);
    }
}

/// An SSE server bound to its address but not yet serving.
pub struct SseServer {
    server: actix_web::dev::Server,
    local_addr: SocketAddr,
}

impl SseServer {
    /// Bind the listener. Every `GET` on the SSE path opens a session served
    /// by a fresh server from `build_server`.
    pub fn bind<F, Fut>(config: SseServerConfig, build_server: F) -> Result<Self>
    where
        F: Fn(ServerSseTransport) -> Fut + Send + Sync + 'static,
        Fut: futures::Future<Output = Result<Server<ServerSseTransport>>> + Send + 'static,
    {
        // Box the future when creating the Arc
        let build_server: BuildServer =
            Arc::new(move |t| Box::pin(build_server(t)) as futures::future::BoxFuture<_>);

        let session_state = AppState {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            message_path: config.message_path.clone(),
            channel_capacity: config.channel_capacity,
            keep_alive: config.keep_alive,
            build_server,
        };

        let sse_path = config.sse_path.clone();
        let message_path = config.message_path.clone();
        let http_server = HttpServer::new(move || {
            App::new()
                .wrap(Logger::default())
                .app_data(web::Data::new(session_state.clone()))
                .route(&sse_path, web::get().to(sse_handler))
                .route(&message_path, web::post().to(message_handler))
        })
        .bind((config.host.as_str(), config.port))?;

        let local_addr = http_server
            .addrs()
            .first()
            .copied()
            .ok_or_else(|| anyhow!("SSE server is not listening on any address"))?;

        Ok(Self {
            server: http_server.run(),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle for stopping the server from another task.
    pub fn handle(&self) -> ServerHandle {
        self.server.handle()
    }

    pub async fn run(self) -> Result<()> {
        info!("SSE server listening on {}", self.local_addr);
        self.server.await?;
        Ok(())
    }
}

/// Bind and serve until the server is stopped
pub async fn run_sse_server<F, Fut>(config: SseServerConfig, build_server: F) -> Result<()>
where
    F: Fn(ServerSseTransport) -> Fut + Send + Sync + 'static,
    Fut: futures::Future<Output = Result<Server<ServerSseTransport>>> + Send + 'static,
{
    SseServer::bind(config, build_server)?.run().await
}

pub async fn sse_handler(req: HttpRequest, session_state: web::Data<AppState>) -> HttpResponse {
    let client_ip = req
        .peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let session_id = Uuid::new_v4().to_string();
    let (inbound_tx, inbound_rx) = mpsc::channel(session_state.channel_capacity);
    let (outbound_tx, outbound_rx) = mpsc::channel(session_state.channel_capacity);
    let transport = ServerSseTransport::new(inbound_rx, outbound_tx);

    session_state
        .sessions
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(session_id.clone(), inbound_tx);
    info!(
        "SSE connection established for {} with session_id {}",
        client_ip, session_id
    );

    let guard = SessionGuard {
        session_id: session_id.clone(),
        sessions: session_state.sessions.clone(),
    };
    let endpoint = format_sse_event(
        "endpoint",
        &format!("{}?sessionId={}", session_state.message_path, session_id),
    );
    let keep_alive = session_state.keep_alive;
    let ticks = interval_at(Instant::now() + keep_alive, keep_alive);
    // the guard lives in the stream state, so the session ends with the stream
    let messages = futures::stream::unfold(
        (outbound_rx, ticks, guard),
        move |(mut outbound_rx, mut ticks, guard): (mpsc::Receiver<Message>, Interval, SessionGuard)| {
            let client_ip = client_ip.clone();
            async move {
                let event = tokio::select! {
                    message = outbound_rx.recv() => encode_event(&client_ip, &message?),
                    _ = ticks.tick() => Some(KEEP_ALIVE_EVENT.to_string()),
                };
                Some((event, (outbound_rx, ticks, guard)))
            }
        },
    )
    .filter_map(futures::future::ready);
    let stream = futures::stream::once(futures::future::ready(endpoint))
        .chain(messages)
        .map(|event| Ok::<_, Infallible>(web::Bytes::from(event)));

    let build_server = session_state.build_server.clone();
    let session = session_id.clone();
    tokio::spawn(async move {
        match build_server(transport).await {
            Ok(server) => {
                if let Err(e) = server.listen().await {
                    warn!("Session {} ended with error: {}", session, e);
                }
                debug!("Server for session {} stopped", session);
            }
            Err(e) => {
                error!("Failed to build server: {:?}", e);
            }
        }
    });

    HttpResponse::Ok()
        .append_header(("X-Session-Id", session_id))
        .append_header(("Cache-Control", "no-cache"))
        .content_type("text/event-stream")
        .streaming(stream)
}

fn encode_event(client_ip: &str, message: &Message) -> Option<String> {
    match serde_json::to_string(message) {
        Ok(json) => {
            debug!("Sending SSE message to {}: {}", client_ip, json);
            Some(format_sse_event("message", &json))
        }
        Err(e) => {
            error!("Failed to encode message for {}: {}", client_ip, e);
            None
        }
    }
}

async fn message_handler(
    query: Query<MessageQuery>,
    message: web::Json<Message>,
    session_state: web::Data<AppState>,
) -> HttpResponse {
    let Some(session_id) = &query.session_id else {
        return HttpResponse::BadRequest().body("Session ID not specified");
    };

    let Some(sender) = session_state.sender(session_id) else {
        debug!("Message for unknown session {}", session_id);
        return HttpResponse::NotFound().body("Session not found");
    };

    match sender.send(message.into_inner()).await {
        Ok(()) => {
            debug!("Successfully sent message to session {}", session_id);
            HttpResponse::Accepted().finish()
        }
        Err(_) => {
            // the session's server is gone but the stream has not been dropped yet
            warn!("Session {} is no longer accepting messages", session_id);
            HttpResponse::NotFound().body("Session not found")
        }
    }
}
