use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::config::SearchConfig;

pub const NO_RESULTS_MESSAGE: &str = "No results found.";

#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str) -> Result<String>;
}

/// DuckDuckGo instant-answer lookup. Returns the abstract (when there is
/// one) followed by related topic snippets.
#[derive(Debug, Clone)]
pub struct DuckDuckGoSearch {
    client: Client,
    endpoint: Url,
    max_results: usize,
}

impl DuckDuckGoSearch {
    pub fn new(config: &SearchConfig) -> Result<Self> {
        let endpoint = Url::parse(config.endpoint.trim())
            .with_context(|| format!("invalid search endpoint `{}`", config.endpoint))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .context("failed creating search client")?;
        Ok(Self {
            client,
            endpoint,
            max_results: config.max_results.max(1),
        })
    }
}

#[async_trait]
impl SearchProvider for DuckDuckGoSearch {
    async fn search(&self, query: &str) -> Result<String> {
        let url = Url::parse_with_params(
            self.endpoint.as_str(),
            &[
                ("q", query),
                ("format", "json"),
                ("no_html", "1"),
                ("skip_disambig", "1"),
            ],
        )
        .context("failed building search url")?;
        debug!("web search request to {}", url.host_str().unwrap_or("?"));

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("search request failed")?;
        let status = response.status();
        let body = response.text().await.context("failed reading search body")?;
        if !status.is_success() {
            bail!("search endpoint returned status {}", status.as_u16());
        }
        let parsed: Value = serde_json::from_str(&body).context("invalid search response")?;
        Ok(render_results(&parsed, self.max_results))
    }
}

fn render_results(body: &Value, max_results: usize) -> String {
    let mut lines = Vec::new();

    if let Some(answer) = text_field(body, "Answer") {
        lines.push(answer);
    }
    if let Some(summary) = text_field(body, "AbstractText") {
        let line = match (text_field(body, "Heading"), text_field(body, "AbstractURL")) {
            (Some(heading), Some(url)) => format!("{heading}: {summary} ({url})"),
            (Some(heading), None) => format!("{heading}: {summary}"),
            (None, Some(url)) => format!("{summary} ({url})"),
            (None, None) => summary,
        };
        lines.push(line);
    }

    let mut topics = Vec::new();
    if let Some(related) = body.get("RelatedTopics").and_then(Value::as_array) {
        collect_topics(related, &mut topics);
    }
    for (text, url) in topics.into_iter().take(max_results) {
        match url {
            Some(url) => lines.push(format!("- {text} ({url})")),
            None => lines.push(format!("- {text}")),
        }
    }

    if lines.is_empty() {
        return NO_RESULTS_MESSAGE.to_owned();
    }
    lines.join("\n")
}

// Grouped topics nest their entries one level down under `Topics`.
fn collect_topics(entries: &[Value], out: &mut Vec<(String, Option<String>)>) {
    for entry in entries {
        if let Some(nested) = entry.get("Topics").and_then(Value::as_array) {
            collect_topics(nested, out);
            continue;
        }
        if let Some(text) = text_field(entry, "Text") {
            out.push((text, text_field(entry, "FirstURL")));
        }
    }
}

fn text_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(ToOwned::to_owned)
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use crate::config::SearchConfig;

    use super::{render_results, DuckDuckGoSearch, SearchProvider, NO_RESULTS_MESSAGE};

    #[test]
    fn abstract_and_nested_topics_are_rendered() {
        let body = json!({
            "Heading": "Tokio",
            "AbstractText": "An asynchronous runtime for Rust.",
            "AbstractURL": "https://tokio.rs",
            "RelatedTopics": [
                { "Text": "Rust language", "FirstURL": "https://www.rust-lang.org" },
                { "Name": "Crates", "Topics": [
                    { "Text": "async-std", "FirstURL": "https://async.rs" },
                    { "Text": "smol" }
                ]}
            ]
        });
        assert_eq!(
            render_results(&body, 2),
            "Tokio: An asynchronous runtime for Rust. (https://tokio.rs)\n\
             - Rust language (https://www.rust-lang.org)\n\
             - async-std (https://async.rs)"
        );
    }

    #[test]
    fn empty_payload_reports_no_results() {
        let body = json!({ "AbstractText": "", "RelatedTopics": [] });
        assert_eq!(render_results(&body, 5), NO_RESULTS_MESSAGE);
    }

    #[tokio::test]
    async fn provider_sends_query_parameters() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
        let addr = listener.local_addr().expect("addr");
        let captured = Arc::new(Mutex::new(String::new()));
        let captured_server = Arc::clone(&captured);
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept request");
            let mut buffer = vec![0_u8; 16 * 1024];
            let read = stream.read(&mut buffer).expect("read request");
            if let Ok(mut guard) = captured_server.lock() {
                *guard = String::from_utf8_lossy(&buffer[..read]).to_string();
            }
            let body = json!({ "Answer": "42" }).to_string();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            stream
                .write_all(response.as_bytes())
                .expect("write response");
        });

        let config = SearchConfig {
            enabled: true,
            endpoint: format!("http://{addr}/"),
            max_results: 3,
            timeout_secs: 10,
        };
        let provider = DuckDuckGoSearch::new(&config).expect("provider");
        let output = provider.search("meaning of life").await.expect("search");
        server.join().expect("join server");

        assert_eq!(output, "42");
        let request_text = captured.lock().expect("lock captured").clone();
        assert!(request_text.starts_with("GET /?q=meaning+of+life&format=json"));
    }
}
