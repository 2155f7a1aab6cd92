pub mod client;
pub mod documents;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod sse;
pub use sse::http_server::{run_sse_server, SseServer, SseServerConfig};
pub mod transport;
pub mod types;
pub mod weather;
