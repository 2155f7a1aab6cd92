//! Keyword search over a directory of text files, served as `search_documents`.

use crate::error::McpError;
use crate::server::{Server, ServerBuilder};
use crate::transport::Transport;
use crate::types::{CallToolRequest, CallToolResponse, Tool};
use anyhow::Context;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub const SERVER_NAME: &str = "document-server";
pub const SERVER_VERSION: &str = "1.0.0";
pub const TOOL_NAME: &str = "search_documents";
pub const DEFAULT_DOCUMENTS_DIR: &str = "./documents";

/// Sections returned per query.
const MAX_RESULTS: usize = 3;

/// One paragraph of an indexed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub source: String,
    pub content: String,
}

#[derive(Debug, Default)]
pub struct DocumentIndex {
    sections: Vec<Section>,
}

impl DocumentIndex {
    /// Index every `.txt` and `.md` file directly inside `dir`.
    ///
    /// A missing directory gives an empty index so the server still starts.
    pub async fn load(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        if !tokio::fs::try_exists(dir).await.unwrap_or(false) {
            warn!("Documents directory {} not found", dir.display());
            return Ok(Self::default());
        }

        let mut entries = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("cannot list {}", dir.display()))?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let indexed = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == "txt" || ext == "md");
            if indexed && entry.file_type().await?.is_file() {
                files.push(path);
            }
        }
        files.sort();

        let mut index = Self::default();
        for path in &files {
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("cannot read {}", path.display()))?;
            let source = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            index.add(&source, &String::from_utf8_lossy(&bytes));
        }
        info!(
            "Indexed {} sections from {} files",
            index.len(),
            files.len()
        );
        Ok(index)
    }

    /// Add one file's text, split into paragraphs on blank lines.
    pub fn add(&mut self, source: &str, content: &str) {
        self.sections.extend(
            content
                .split("\n\n")
                .map(str::trim)
                .filter(|section| !section.is_empty())
                .map(|section| Section {
                    source: source.to_string(),
                    content: section.to_string(),
                }),
        );
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Sections containing the most query terms, best first.
    ///
    /// Matching is case-insensitive and terms of two characters or fewer are
    /// ignored. Equal scores keep index order.
    pub fn search(&self, query: &str, limit: usize) -> Vec<&Section> {
        let query = query.to_lowercase();
        let terms: Vec<&str> = query
            .split_whitespace()
            .filter(|term| term.chars().count() > 2)
            .collect();

        let mut scored: Vec<(usize, &Section)> = self
            .sections
            .iter()
            .map(|section| {
                let content = section.content.to_lowercase();
                let score = terms.iter().filter(|term| content.contains(**term)).count();
                (score, section)
            })
            .filter(|(score, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored
            .into_iter()
            .take(limit)
            .map(|(_, section)| section)
            .collect()
    }
}

pub fn format_results(query: &str, results: &[&Section]) -> String {
    if results.is_empty() {
        return format!("No relevant documents found for \"{}\".", query);
    }
    let mut text = String::from("Found relevant information:\n\n");
    for section in results {
        text.push_str(&format!("[{}] {}\n\n", section.source, section.content));
    }
    text
}

#[derive(Debug, Deserialize)]
pub struct SearchArgs {
    pub query: String,
}

pub fn tool() -> Tool {
    Tool {
        name: TOOL_NAME.to_string(),
        description: Some(
            "Search through local files using keyword matching. Returns relevant fragments."
                .to_string(),
        ),
        input_schema: json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query to find relevant documents"
                }
            },
            "required": ["query"]
        }),
    }
}

fn search_documents(index: &DocumentIndex, req: CallToolRequest) -> anyhow::Result<CallToolResponse> {
    let args = Value::Object(req.arguments.unwrap_or_default().into_iter().collect());
    let args: SearchArgs =
        serde_json::from_value(args).context("missing or invalid argument `query`")?;
    let results = index.search(&args.query, MAX_RESULTS);
    Ok(CallToolResponse::text(format_results(&args.query, &results)))
}

pub fn register<T: Transport>(
    builder: &mut ServerBuilder<T>,
    index: Arc<DocumentIndex>,
) -> Result<(), McpError> {
    builder.register_tool(tool(), move |req| {
        let index = index.clone();
        async move { search_documents(&index, req) }
    })
}

pub fn build_server<T: Transport>(t: T, index: Arc<DocumentIndex>) -> Result<Server<T>, McpError> {
    let mut builder = Server::builder(t).name(SERVER_NAME).version(SERVER_VERSION);
    register(&mut builder, index)?;
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::transport::ClientInMemoryTransport;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn sample() -> DocumentIndex {
        let mut index = DocumentIndex::default();
        index.add(
            "japan.md",
            "Tokyo is the capital of Japan.\n\n\n\nKyoto has many temples.\n\n  ",
        );
        index.add("travel.txt", "Japan rail passes cover Tokyo and Kyoto trains.");
        index
    }

    #[test]
    fn test_add_splits_paragraphs() {
        let index = sample();
        assert_eq!(index.len(), 3);
        assert_eq!(
            index.sections[1],
            Section {
                source: "japan.md".to_string(),
                content: "Kyoto has many temples.".to_string(),
            }
        );
    }

    #[test]
    fn test_search_ranks_by_matching_terms() {
        let index = sample();
        let results = index.search("TOKYO kyoto", 3);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].source, "travel.txt");
        // ties keep index order
        assert_eq!(results[1].content, "Tokyo is the capital of Japan.");
        assert_eq!(results[2].content, "Kyoto has many temples.");

        assert_eq!(index.search("tokyo kyoto", 1).len(), 1);
    }

    #[test]
    fn test_search_ignores_short_terms() {
        let index = sample();
        assert!(index.search("is of", 3).is_empty());
        assert!(index.search("", 3).is_empty());
        assert!(DocumentIndex::default().search("japan", 3).is_empty());
    }

    #[test]
    fn test_format_results() {
        let index = sample();
        assert_eq!(
            format_results("volcano", &index.search("volcano", 3)),
            "No relevant documents found for \"volcano\"."
        );
        assert_eq!(
            format_results("temples", &index.search("temples", 3)),
            "Found relevant information:\n\n[japan.md] Kyoto has many temples.\n\n"
        );
    }

    #[tokio::test]
    async fn test_load_directory() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        tokio::fs::write(dir.path().join("b.txt"), "Osaka food.\n\nNara deer.").await?;
        tokio::fs::write(dir.path().join("a.md"), "# Japan\n\nIslands.").await?;
        tokio::fs::write(dir.path().join("notes.rs"), "fn main() {}").await?;
        tokio::fs::create_dir(dir.path().join("nested.md")).await?;

        let index = DocumentIndex::load(dir.path()).await?;
        let sources: Vec<&str> = index.sections.iter().map(|s| s.source.as_str()).collect();
        assert_eq!(sources, vec!["a.md", "a.md", "b.txt", "b.txt"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_load_missing_directory() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let index = DocumentIndex::load(dir.path().join("absent")).await?;
        assert!(index.is_empty());
        Ok(())
    }

    #[test]
    fn test_search_documents_requires_query() {
        let index = sample();
        let req = CallToolRequest {
            name: TOOL_NAME.to_string(),
            arguments: Some(HashMap::from([("q".to_string(), json!("japan"))])),
            meta: None,
        };
        assert!(search_documents(&index, req).is_err());
    }

    #[tokio::test]
    async fn test_served_over_session() -> anyhow::Result<()> {
        let index = Arc::new(sample());
        let transport = ClientInMemoryTransport::new(move |t| {
            let index = index.clone();
            tokio::spawn(async move {
                let server = build_server(t, index).expect("document server");
                let _ = server.listen().await;
            })
        });
        let client = Client::builder(transport).connect().await?;
        assert_eq!(client.server_info().unwrap().name, SERVER_NAME);

        let tools = client.list_tools().await?;
        assert_eq!(tools, vec![tool()]);

        let result = client
            .call_tool(TOOL_NAME, json!({"query": "temples"}))
            .await?;
        assert!(result.text_content().contains("[japan.md] Kyoto has many temples."));

        client.close().await?;
        Ok(())
    }
}
