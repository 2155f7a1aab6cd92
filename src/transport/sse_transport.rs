use super::{Message, Result, Transport, TransportError, TransportErrorCode};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

/// Format one Server-Sent Event; multi-line data becomes several `data:` lines.
pub fn format_sse_event(event: &str, data: &str) -> String {
    let mut result = format!("event: {event}\n");
    for line in data.lines() {
        result.push_str("data: ");
        result.push_str(line);
        result.push('\n');
    }
    result.push('\n');
    result
}

#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    /// Where the client should POST its messages.
    Endpoint(String),
    Message(Message),
}

/// Parse one complete event (the text between two blank lines).
pub fn parse_sse_event(event: &str) -> Option<SseEvent> {
    let mut event_type = None;
    let mut data_lines = Vec::new();

    for line in event.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => event_type = Some(value.to_string()),
            "data" => data_lines.push(value),
            _ => {}
        }
    }

    if data_lines.is_empty() {
        return None;
    }
    let data = data_lines.join("\n");

    match event_type.as_deref() {
        Some("endpoint") => Some(SseEvent::Endpoint(data.trim().to_string())),
        None | Some("message") => match serde_json::from_str::<Message>(&data) {
            Ok(message) => Some(SseEvent::Message(message)),
            Err(e) => {
                let preview: String = data.chars().take(100).collect();
                warn!("Failed to parse SSE message: {}. Content preview: {}", e, preview);
                None
            }
        },
        Some(other) => {
            debug!("Ignoring SSE event of type {}", other);
            None
        }
    }
}

/// Server half of one SSE session.
///
/// Inbound messages are fed by the POST handler, outbound messages are
/// drained by the event stream of the matching GET request.
#[derive(Clone)]
pub struct ServerSseTransport {
    inbound: Arc<Mutex<mpsc::Receiver<Message>>>,
    outbound: mpsc::Sender<Message>,
    closed: Arc<watch::Sender<bool>>,
}

impl ServerSseTransport {
    pub fn new(inbound: mpsc::Receiver<Message>, outbound: mpsc::Sender<Message>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            inbound: Arc::new(Mutex::new(inbound)),
            outbound,
            closed: Arc::new(closed),
        }
    }
}

#[async_trait]
impl Transport for ServerSseTransport {
    async fn receive(&self) -> Result<Option<Message>> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Ok(None);
        }
        tokio::select! {
            _ = closed.changed() => Ok(None),
            message = async { self.inbound.lock().await.recv().await } => {
                if let Some(message) = &message {
                    debug!("Received message from POST request: {:?}", message);
                }
                Ok(message)
            }
        }
    }

    async fn send(&self, message: &Message) -> Result<()> {
        debug!("Queueing SSE message: {:?}", message);
        self.outbound
            .send(message.clone())
            .await
            .map_err(|_| TransportError::closed("SSE stream is gone"))
    }

    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.send_replace(true);
        Ok(())
    }
}

/// Aborts the event reader once the last transport handle lets go of it,
/// which closes the GET request and with it the server's session.
struct ReaderTask(JoinHandle<()>);

impl Drop for ReaderTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Client-side SSE transport that receives messages from an event stream
/// and sends its own via HTTP POST to the endpoint the server announces.
#[derive(Clone)]
pub struct ClientSseTransport {
    url: Url,
    client: reqwest::Client,
    headers: HashMap<String, String>,
    connect_timeout: Duration,
    endpoint: Arc<RwLock<Option<Url>>>,
    inbound: Arc<Mutex<Option<mpsc::Receiver<Message>>>>,
    reader: Arc<Mutex<Option<ReaderTask>>>,
}

impl ClientSseTransport {
    pub fn builder(url: Url) -> ClientSseTransportBuilder {
        ClientSseTransportBuilder::new(url)
    }

    /// The POST endpoint announced by the server, once connected.
    pub fn endpoint(&self) -> Option<Url> {
        self.endpoint.read().ok().and_then(|endpoint| endpoint.clone())
    }

    async fn read_events(
        response: reqwest::Response,
        url: Url,
        tx: mpsc::Sender<Message>,
        mut endpoint_tx: Option<oneshot::Sender<Result<Url>>>,
    ) {
        let mut buffer: Vec<u8> = Vec::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk: Bytes = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    debug!("SSE stream error: {}", e);
                    break;
                }
            };
            buffer.extend_from_slice(&chunk);

            while let Some((event, consumed)) = next_event(&buffer) {
                buffer.drain(..consumed);
                let Some(event) = event else { continue };
                match parse_sse_event(&event) {
                    Some(SseEvent::Endpoint(path)) => {
                        let resolved = url.join(&path).map_err(|e| {
                            TransportError::with_source(
                                TransportErrorCode::SseParseError,
                                format!("Invalid endpoint {path}"),
                                e,
                            )
                        });
                        debug!("Received endpoint: {:?}", resolved);
                        match endpoint_tx.take() {
                            Some(endpoint_tx) => {
                                let _ = endpoint_tx.send(resolved);
                            }
                            None => warn!("Ignoring repeated endpoint event"),
                        }
                    }
                    Some(SseEvent::Message(message)) => {
                        debug!("Received SSE message: {:?}", message);
                        if tx.send(message).await.is_err() {
                            return;
                        }
                    }
                    None => {}
                }
            }
        }
        debug!("SSE stream ended");
    }
}

/// Split the next complete event off the front of `buffer`.
///
/// Returns the decoded event text (or `None` for invalid UTF-8) and the
/// number of bytes to drop. Line endings may be `\n` or `\r\n`.
fn next_event(buffer: &[u8]) -> Option<(Option<String>, usize)> {
    let mut i = 0;
    while i < buffer.len() {
        if buffer[i] == b'\n' {
            let rest = &buffer[i + 1..];
            let blank = if rest.starts_with(b"\n") {
                Some(1)
            } else if rest.starts_with(b"\r\n") {
                Some(2)
            } else {
                None
            };
            if let Some(len) = blank {
                let consumed = i + 1 + len;
                let text = std::str::from_utf8(&buffer[..i])
                    .ok()
                    .map(|text| text.trim_end_matches('\r').replace("\r\n", "\n"));
                if text.is_none() {
                    warn!("Dropping SSE event with invalid UTF-8");
                }
                return Some((text, consumed));
            }
        }
        i += 1;
    }
    None
}

pub struct ClientSseTransportBuilder {
    url: Url,
    headers: HashMap<String, String>,
    connect_timeout: Duration,
}

impl ClientSseTransportBuilder {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            headers: HashMap::new(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// How long `open` waits for the server to announce its endpoint.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn build(self) -> ClientSseTransport {
        ClientSseTransport {
            url: self.url,
            client: reqwest::Client::new(),
            headers: self.headers,
            connect_timeout: self.connect_timeout,
            endpoint: Arc::new(RwLock::new(None)),
            inbound: Arc::new(Mutex::new(None)),
            reader: Arc::new(Mutex::new(None)),
        }
    }
}

#[async_trait]
impl Transport for ClientSseTransport {
    async fn receive(&self) -> Result<Option<Message>> {
        let mut inbound = self.inbound.lock().await;
        let inbound = inbound.as_mut().ok_or_else(TransportError::not_opened)?;
        Ok(inbound.recv().await)
    }

    async fn send(&self, message: &Message) -> Result<()> {
        let endpoint = self
            .endpoint()
            .ok_or_else(|| TransportError::closed("SSE transport is not connected"))?;

        let mut request = self.client.post(endpoint).json(message);
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }
        let response = request.send().await.map_err(|e| {
            if e.is_connect() {
                TransportError::with_source(TransportErrorCode::ConnectionClosed, "Server unreachable", e)
            } else {
                TransportError::Http(e)
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            // the server dropped our session, nothing more will get through
            let text = response.text().await.unwrap_or_default();
            return Err(TransportError::closed(format!("Session gone: {text}")));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(TransportError::new(
                TransportErrorCode::MessageSendFailed,
                format!("Failed to send message, status: {status}, body: {text}"),
            ));
        }
        Ok(())
    }

    async fn open(&self) -> Result<()> {
        let mut request = self
            .client
            .get(self.url.clone())
            .header(reqwest::header::ACCEPT, "text/event-stream");
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        let response = request.send().await.map_err(|e| {
            TransportError::with_source(
                TransportErrorCode::SseConnectionFailed,
                format!("Failed to connect to {}", self.url),
                e,
            )
        })?;
        if !response.status().is_success() {
            return Err(TransportError::new(
                TransportErrorCode::SseConnectionFailed,
                format!("Unexpected status {} from {}", response.status(), self.url),
            ));
        }

        let (tx, rx) = mpsc::channel(100);
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let handle = tokio::spawn(Self::read_events(
            response,
            self.url.clone(),
            tx,
            Some(endpoint_tx),
        ));
        *self.inbound.lock().await = Some(rx);

        let endpoint = match tokio::time::timeout(self.connect_timeout, endpoint_rx).await {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(_)) => Err(TransportError::closed(
                "SSE connection closed before receiving the endpoint",
            )),
            Err(_) => Err(TransportError::new(
                TransportErrorCode::ConnectionTimeout,
                "Timeout waiting for the endpoint event",
            )),
        };
        let endpoint = match endpoint {
            Ok(endpoint) => endpoint,
            Err(e) => {
                handle.abort();
                return Err(e);
            }
        };

        debug!("Posting messages to {}", endpoint);
        if let Ok(mut slot) = self.endpoint.write() {
            *slot = Some(endpoint);
        }
        *self.reader.lock().await = Some(ReaderTask(handle));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        drop(self.reader.lock().await.take());
        if let Ok(mut slot) = self.endpoint.write() {
            *slot = None;
        }
        Ok(())
    }
}
