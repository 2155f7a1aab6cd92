use super::{Message, Result, Transport, TransportError, TransportErrorCode};
use async_trait::async_trait;
use std::ffi::{OsStr, OsString};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::Child;
use tokio::sync::{watch, Mutex, OnceCell};
use tracing::debug;

type BoxedReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;
type BoxedWriter = BufWriter<Box<dyn AsyncWrite + Send + Unpin>>;

/// Serialize a message as a single newline-terminated line.
pub fn encode_frame(message: &Message) -> Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Parse one line of the pipe framing.
pub fn decode_frame(line: &str) -> Result<Message> {
    serde_json::from_str(line.trim()).map_err(|e| {
        let preview: String = line.trim().chars().take(100).collect();
        TransportError::with_source(
            TransportErrorCode::InvalidMessage,
            format!("Not a JSON-RPC message: {preview}"),
            e,
        )
    })
}

/// Newline-delimited JSON over any pair of async byte streams.
///
/// Reads and writes are independent; `close` shuts the write half and wakes
/// a pending `receive` with end-of-sequence.
pub struct PipeTransport {
    reader: Mutex<BoxedReader>,
    writer: Mutex<Option<BoxedWriter>>,
    closed: watch::Sender<bool>,
}

impl PipeTransport {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (closed, _) = watch::channel(false);
        Self {
            reader: Mutex::new(BufReader::new(
                Box::new(reader) as Box<dyn AsyncRead + Send + Unpin>
            )),
            writer: Mutex::new(Some(BufWriter::new(
                Box::new(writer) as Box<dyn AsyncWrite + Send + Unpin>
            ))),
            closed,
        }
    }

    async fn read_next(&self) -> Result<Option<Message>> {
        let mut reader = self.reader.lock().await;
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let bytes_read = reader.read_until(b'\n', &mut buf).await?;
            if bytes_read == 0 {
                debug!("Pipe reached EOF");
                return Ok(None);
            }
            let line = match std::str::from_utf8(&buf) {
                Ok(line) => line,
                Err(e) => {
                    return Err(TransportError::with_source(
                        TransportErrorCode::InvalidMessage,
                        "Frame is not valid UTF-8",
                        e,
                    ))
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            debug!("Received frame: {}", line.trim_end());
            return decode_frame(line).map(Some);
        }
    }
}

#[async_trait]
impl Transport for PipeTransport {
    async fn receive(&self) -> Result<Option<Message>> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Ok(None);
        }
        tokio::select! {
            _ = closed.changed() => {
                debug!("Pipe closed while waiting for a frame");
                Ok(None)
            }
            message = self.read_next() => message,
        }
    }

    async fn send(&self, message: &Message) -> Result<()> {
        let frame = encode_frame(message)?;
        let mut writer = self.writer.lock().await;
        let writer = writer
            .as_mut()
            .ok_or_else(|| TransportError::closed("Pipe is closed"))?;
        debug!("Sending frame: {}", frame.trim_end());
        writer.write_all(frame.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.send_replace(true);
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("Error shutting down pipe writer: {}", e);
            }
        }
        Ok(())
    }
}

/// Stdio transport for a server process: frames on stdin, replies on stdout.
#[derive(Clone)]
pub struct ServerStdioTransport {
    pipe: Arc<PipeTransport>,
}

impl Default for ServerStdioTransport {
    fn default() -> Self {
        Self {
            pipe: Arc::new(PipeTransport::new(tokio::io::stdin(), tokio::io::stdout())),
        }
    }
}

#[async_trait]
impl Transport for ServerStdioTransport {
    async fn receive(&self) -> Result<Option<Message>> {
        self.pipe.receive().await
    }

    async fn send(&self, message: &Message) -> Result<()> {
        self.pipe.send(message).await
    }

    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pipe.close().await
    }
}

/// ClientStdioTransport launches a child process and communicates with it via stdio
#[derive(Clone)]
pub struct ClientStdioTransport {
    pipe: Arc<OnceCell<PipeTransport>>,
    child: Arc<Mutex<Option<Child>>>,
    program: OsString,
    args: Vec<String>,
}

impl ClientStdioTransport {
    pub fn new(program: impl AsRef<OsStr>, args: &[&str]) -> Self {
        ClientStdioTransport {
            pipe: Arc::new(OnceCell::new()),
            child: Arc::new(Mutex::new(None)),
            program: program.as_ref().to_os_string(),
            args: args.iter().map(|&s| s.to_string()).collect(),
        }
    }

    fn pipe(&self) -> Result<&PipeTransport> {
        self.pipe.get().ok_or_else(TransportError::not_opened)
    }
}

#[async_trait]
impl Transport for ClientStdioTransport {
    async fn receive(&self) -> Result<Option<Message>> {
        self.pipe()?.receive().await
    }

    async fn send(&self, message: &Message) -> Result<()> {
        self.pipe()?.send(message).await
    }

    async fn open(&self) -> Result<()> {
        if self.pipe.initialized() {
            return Err(TransportError::new(
                TransportErrorCode::InvalidState,
                "Transport already opened",
            ));
        }

        debug!(
            "Spawning {} {:?}",
            self.program.to_string_lossy(),
            self.args
        );
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TransportError::with_source(
                    TransportErrorCode::ConnectionFailed,
                    format!("Failed to spawn {}", self.program.to_string_lossy()),
                    e,
                )
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::new(
                TransportErrorCode::ConnectionFailed,
                "Child process stdin not available",
            )
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::new(
                TransportErrorCode::ConnectionFailed,
                "Child process stdout not available",
            )
        })?;

        self.pipe
            .set(PipeTransport::new(stdout, stdin))
            .map_err(|_| TransportError::new(TransportErrorCode::InvalidState, "Transport already opened"))?;
        *self.child.lock().await = Some(child);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        const GRACEFUL_TIMEOUT: Duration = Duration::from_millis(1000);

        if let Some(pipe) = self.pipe.get() {
            pipe.close().await?;
        }

        let mut child_guard = self.child.lock().await;
        let Some(mut child) = child_guard.take() else {
            debug!("No child process to close");
            return Ok(());
        };

        // stdin is closed now, which is the child's cue to exit
        match tokio::time::timeout(GRACEFUL_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => debug!("Process exited with status: {}", status),
            Ok(Err(e)) => debug!("Error waiting for process exit: {}", e),
            Err(_) => {
                debug!("Process still running, killing it");
                child.kill().await?;
            }
        }
        debug!("Shutdown complete");
        Ok(())
    }
}
