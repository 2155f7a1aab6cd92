use super::{Message, PipeTransport, Result, Transport, TransportError};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

/// Size of each direction's in-process pipe buffer.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Server half of an in-process pipe pair
#[derive(Clone)]
pub struct ServerInMemoryTransport {
    pipe: Arc<PipeTransport>,
}

#[async_trait]
impl Transport for ServerInMemoryTransport {
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

/// Client half of an in-process pipe pair.
///
/// `open` creates the pipes and hands the server half to the factory, which
/// is expected to spawn the server task. The same line framing as the stdio
/// transport runs over the pipes, so this stands in for a child process.
#[derive(Clone)]
pub struct ClientInMemoryTransport {
    pipe: Arc<Mutex<Option<Arc<PipeTransport>>>>,
    server_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    server_factory: Arc<dyn Fn(ServerInMemoryTransport) -> JoinHandle<()> + Send + Sync>,
}

impl ClientInMemoryTransport {
    pub fn new<F>(server_factory: F) -> Self
    where
        F: Fn(ServerInMemoryTransport) -> JoinHandle<()> + Send + Sync + 'static,
    {
        Self {
            pipe: Arc::new(Mutex::new(None)),
            server_handle: Arc::new(Mutex::new(None)),
            server_factory: Arc::new(server_factory),
        }
    }

    async fn pipe(&self) -> Result<Arc<PipeTransport>> {
        self.pipe
            .lock()
            .await
            .clone()
            .ok_or_else(TransportError::not_opened)
    }
}

#[async_trait]
impl Transport for ClientInMemoryTransport {
    async fn receive(&self) -> Result<Option<Message>> {
        let message = self.pipe().await?.receive().await?;
        if message.is_none() {
            debug!("Server pipe closed");
        }
        Ok(message)
    }

    async fn send(&self, message: &Message) -> Result<()> {
        self.pipe().await?.send(message).await
    }

    async fn open(&self) -> Result<()> {
        let (client_end, server_end) = tokio::io::duplex(PIPE_CAPACITY);
        let (client_read, client_write) = tokio::io::split(client_end);
        let (server_read, server_write) = tokio::io::split(server_end);

        let server_transport = ServerInMemoryTransport {
            pipe: Arc::new(PipeTransport::new(server_read, server_write)),
        };
        let server_handle = (self.server_factory)(server_transport);

        *self.pipe.lock().await = Some(Arc::new(PipeTransport::new(client_read, client_write)));
        *self.server_handle.lock().await = Some(server_handle);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(pipe) = self.pipe.lock().await.clone() {
            pipe.close().await?;
        }

        if let Some(handle) = self.server_handle.lock().await.take() {
            if let Err(e) = handle.await {
                debug!("Server task ended abnormally: {}", e);
            }
        }
        Ok(())
    }
}
