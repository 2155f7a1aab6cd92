use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use url::Url;
use weather_mcp::client::Client;
use weather_mcp::documents::{self, DocumentIndex};
use weather_mcp::transport::{
    ClientSseTransport, ClientStdioTransport, ServerStdioTransport, Transport,
};
use weather_mcp::weather::{self, build_server};
use weather_mcp::{SseServer, SseServerConfig};

#[derive(Parser)]
#[command(author, version, about = "A minimal MCP weather tool", long_about = None)]
struct Cli {
    /// Run mode
    #[arg(value_enum)]
    mode: Mode,

    /// Address the SSE server binds to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port the SSE server listens on
    #[arg(long, default_value_t = 3001)]
    port: u16,

    /// SSE endpoint the remote client connects to
    #[arg(long, default_value = "http://localhost:3001/sse")]
    url: Url,

    /// City to ask about (defaults depend on the mode)
    #[arg(long)]
    city: Option<String>,

    /// Directory the document server indexes
    #[arg(long, default_value = documents::DEFAULT_DOCUMENTS_DIR)]
    documents_dir: PathBuf,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Mode {
    ServerStdio,
    ServerSse,
    ClientLocal,
    ClientRemote,
    /// Serve `search_documents` over stdio
    ServerDocuments,
    /// Spawn the document and weather servers and call each tool once
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        // needs to be stderr due to stdio transport
        .with_writer(std::io::stderr)
        .init();

    match cli.mode {
        Mode::ServerStdio => {
            let server = build_server(ServerStdioTransport::default())?;
            server
                .listen()
                .await
                .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;
        }
        Mode::ServerSse => {
            let config = SseServerConfig {
                host: cli.host,
                port: cli.port,
                ..Default::default()
            };
            let sse_path = config.sse_path.clone();
            let server = SseServer::bind(config, |transport| async move {
                Ok(build_server(transport)?)
            })?;
            println!(
                "SSE Server running on http://{}{}",
                server.local_addr(),
                sse_path
            );
            server.run().await?;
        }
        Mode::ClientLocal => {
            let program = std::env::current_exe().context("cannot locate own executable")?;
            let args: &[&str] = if cli.verbose {
                &["server-stdio", "--verbose"]
            } else {
                &["server-stdio"]
            };
            let transport = ClientStdioTransport::new(program, args);
            let city = cli.city.as_deref().unwrap_or("San Francisco");
            run_client(transport, "weather-client", city).await?;
        }
        Mode::ClientRemote => {
            let transport = ClientSseTransport::builder(cli.url).build();
            let city = cli.city.as_deref().unwrap_or("London");
            run_client(transport, "weather-client-remote", city).await?;
        }
        Mode::ServerDocuments => {
            let index = DocumentIndex::load(&cli.documents_dir).await?;
            let server = documents::build_server(ServerStdioTransport::default(), Arc::new(index))?;
            server
                .listen()
                .await
                .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;
        }
        Mode::Check => {
            let program = std::env::current_exe().context("cannot locate own executable")?;
            check_servers(&program, &cli.documents_dir, cli.verbose).await?;
        }
    };
    Ok(())
}

async fn run_client<T: Transport>(transport: T, name: &str, city: &str) -> Result<()> {
    let client = Client::builder(transport)
        .name(name)
        .version("1.0.0")
        .connect()
        .await?;
    println!("Connected to server!");

    let result = client
        .call_tool(weather::TOOL_NAME, json!({ "city": city }))
        .await;
    client.close().await?;
    println!("Tool result: {:?}", result?);
    Ok(())
}

/// Start each stdio server as a child process and call its tool directly.
async fn check_servers(program: &Path, documents_dir: &Path, verbose: bool) -> Result<()> {
    let documents_dir = documents_dir.to_string_lossy();
    let checks = [
        (
            documents::TOOL_NAME,
            vec!["server-documents", "--documents-dir", &*documents_dir],
            json!({ "query": "Japan" }),
        ),
        (weather::TOOL_NAME, vec!["server-stdio"], json!({ "city": "Tokyo" })),
    ];

    for (tool, mut args, arguments) in checks {
        if verbose {
            args.push("--verbose");
        }
        let client = Client::builder(ClientStdioTransport::new(program, &args))
            .name("check-client")
            .version("1.0.0")
            .connect()
            .await
            .with_context(|| format!("cannot start the server for {tool}"))?;
        let result = client.call_tool(tool, arguments).await;
        client.close().await?;
        println!("{}: {}", tool, result?.text_content());
    }
    println!("All servers are connected and responding");
    Ok(())
}
