//! `duckduckgo_search`: web search over the DuckDuckGo instant answer API.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, instrument};

use trellis_core::{Context, CoreError, Result, Tool, ToolDeclaration};

/// Fixed tool name
pub const WEB_SEARCH_TOOL_NAME: &str = "duckduckgo_search";

const DEFAULT_BASE_URL: &str = "https://api.duckduckgo.com";
const DEFAULT_MAX_RESULTS: usize = 5;

/// Configuration for the search tool
#[derive(Debug, Clone)]
pub struct DuckDuckGoConfig {
    /// API base URL
    pub base_url: String,
    /// Timeout in seconds for HTTP requests
    pub timeout_secs: u64,
    /// Related topics returned at most
    pub max_results: usize,
}

impl Default for DuckDuckGoConfig {
    fn default() -> Self {
        Self { base_url: DEFAULT_BASE_URL.to_string(), timeout_secs: 30, max_results: DEFAULT_MAX_RESULTS }
    }
}

/// One search hit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchHit {
    /// Hit title
    pub title: String,
    /// Link
    pub url: String,
    /// Text snippet
    pub snippet: String,
}

/// Web search tool backed by DuckDuckGo
#[derive(Debug, Clone)]
pub struct DuckDuckGoTool {
    config: DuckDuckGoConfig,
    client: Client,
}

impl DuckDuckGoTool {
    /// Tool with the given configuration
    pub fn new(config: DuckDuckGoConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { config, client }
    }

    fn map_http_error(error: reqwest::Error) -> CoreError {
        if error.is_timeout() {
            CoreError::Timeout(format!("web search timed out: {}", error))
        } else {
            CoreError::UpstreamError(format!("web search failed: {}", error))
        }
    }
}

impl Default for DuckDuckGoTool {
    fn default() -> Self {
        Self::new(DuckDuckGoConfig::default())
    }
}

fn title_of(text: &str) -> String {
    text.split(" - ").next().unwrap_or(text).trim().to_string()
}

fn collect_topics(topics: &[Value], out: &mut Vec<SearchHit>, max: usize) {
    for topic in topics {
        if out.len() >= max {
            return;
        }
        if let Some(nested) = topic.get("Topics").and_then(Value::as_array) {
            collect_topics(nested, out, max);
            continue;
        }
        let text = topic.get("Text").and_then(Value::as_str).unwrap_or_default();
        let url = topic.get("FirstURL").and_then(Value::as_str).unwrap_or_default();
        if text.is_empty() {
            continue;
        }
        out.push(SearchHit { title: title_of(text), url: url.to_string(), snippet: text.to_string() });
    }
}

/// Turn an instant answer payload into a summary plus hits.
pub fn parse_instant_answer(body: &Value, max_results: usize) -> (String, Vec<SearchHit>) {
    let field = |name: &str| body.get(name).and_then(Value::as_str).unwrap_or_default().trim().to_string();

    let summary = [field("Answer"), field("AbstractText"), field("Definition")]
        .into_iter()
        .find(|s| !s.is_empty())
        .unwrap_or_default();

    let mut hits = Vec::new();
    let abstract_text = field("AbstractText");
    if !abstract_text.is_empty() && max_results > 0 {
        hits.push(SearchHit { title: field("Heading"), url: field("AbstractURL"), snippet: abstract_text });
    }
    if let Some(topics) = body.get("RelatedTopics").and_then(Value::as_array) {
        collect_topics(topics, &mut hits, max_results);
    }
    (summary, hits)
}

#[async_trait]
impl Tool for DuckDuckGoTool {
    fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration::new(
            WEB_SEARCH_TOOL_NAME,
            "Search the web for up-to-date facts, definitions and related links.",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Search query"}
                },
                "required": ["query"]
            }),
        )
    }

    #[instrument(skip(self, ctx), fields(tool = WEB_SEARCH_TOOL_NAME))]
    async fn call(&self, ctx: &Context, args: Value) -> Result<Value> {
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .ok_or_else(|| CoreError::ValidationError("query is required".to_string()))?;
        debug!(query, "searching the web");

        let request = self
            .client
            .get(&self.config.base_url)
            .query(&[("q", query), ("format", "json"), ("no_html", "1"), ("skip_disambig", "1")])
            .send();
        let response = tokio::select! {
            r = request => r.map_err(Self::map_http_error)?,
            _ = ctx.cancelled() => return Err(CoreError::Cancelled("web search cancelled".to_string())),
        };

        match response.status() {
            StatusCode::OK => {}
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(CoreError::RateLimit("web search rate limited".to_string()));
            }
            status => return Err(CoreError::UpstreamError(format!("web search returned HTTP {}", status))),
        }
        let body: Value = response.json().await.map_err(Self::map_http_error)?;
        let (summary, hits) = parse_instant_answer(&body, self.config.max_results);
        Ok(json!({
            "query": query,
            "summary": summary,
            "results": hits,
        }))
    }
}
