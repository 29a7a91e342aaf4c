use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use regex::Regex;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::event_bridge::LifecycleEvent;
use crate::gateway::ActionGateway;

const CHUNK_BUFFER: usize = 64;

const SYSTEM_PROMPT: &str = "You are an assistant that builds small web pages and manages files in a working directory using the tools listed below.
Answer directly when a question needs no tools.
When a tool is needed, always use exactly this format:

Thought: your reasoning about what to do next
Action: the tool name, exactly as listed
Action Input: the input for the tool
Observation: the result of the tool
... (Thought/Action/Action Input/Observation can repeat)
Final Answer: your final response to the user

Always finish with \"Final Answer:\" after using tools, only use tools when they are actually needed and never leave a part of the format empty.

Tools:
";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_owned(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_owned(),
            content: content.into(),
        }
    }
}

/// Stateless model invocation: one call streams one completion.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn stream_chat(&self, messages: &[ChatMessage]) -> Result<mpsc::Receiver<Result<String>>>;
}

/// Runs one task to a final answer, reporting progress through `run`.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn run(&self, task: &str, run: &RunHandle) -> Result<String>;
}

/// A run's only way to reach the gateway and the observer.
#[derive(Clone)]
pub struct RunHandle {
    gateway: Arc<ActionGateway>,
    events: mpsc::Sender<LifecycleEvent>,
}

impl RunHandle {
    pub fn new(gateway: Arc<ActionGateway>, events: mpsc::Sender<LifecycleEvent>) -> Self {
        Self { gateway, events }
    }

    pub async fn reasoning_started(&self) {
        self.emit(LifecycleEvent::ReasoningStarted).await;
    }

    pub async fn token(&self, text: &str) {
        self.emit(LifecycleEvent::Token(text.to_owned())).await;
    }

    pub async fn decision(&self, thought: &str, action: &str, input: &str) {
        self.emit(LifecycleEvent::Decision {
            thought: thought.to_owned(),
            action: action.to_owned(),
            input: input.to_owned(),
        })
        .await;
    }

    /// Runs `action` through the gateway, bracketed by start/finish events
    /// whether or not the action succeeds.
    pub async fn invoke(&self, action: &str, input: &str) -> String {
        self.emit(LifecycleEvent::ActionStarted {
            name: action.to_owned(),
            input: input.to_owned(),
        })
        .await;
        let output = self.gateway.execute(action, input).await;
        self.emit(LifecycleEvent::ActionFinished {
            output: output.clone(),
        })
        .await;
        output
    }

    async fn emit(&self, event: LifecycleEvent) {
        if self.events.send(event).await.is_err() {
            debug!("run event dropped, observer side is gone");
        }
    }
}

/// OpenAI-style `/chat/completions` client with `stream: true`, suitable for
/// local LM Studio or llama.cpp servers.
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleClient {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
}

impl OpenAiCompatibleClient {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .context("failed creating model client")?;
        let api_key = Some(config.api_key.trim().to_owned()).filter(|key| !key.is_empty());
        Ok(Self {
            client,
            endpoint: resolve_chat_completion_endpoint(&config.base_url),
            model: config.model.clone(),
            api_key,
            temperature: config.temperature,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ModelClient for OpenAiCompatibleClient {
    async fn stream_chat(&self, messages: &[ChatMessage]) -> Result<mpsc::Receiver<Result<String>>> {
        let payload = json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "stream": true,
            "stop": ["\nObservation:"],
        });
        let mut request = self.client.post(&self.endpoint).json(&payload);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("model request to {} failed", self.endpoint))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!(
                "model endpoint returned status {}: {}",
                status.as_u16(),
                truncate_text(&body, 240)
            );
        }

        let is_event_stream = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.contains("text/event-stream"))
            .unwrap_or(false);

        let (tx, rx) = mpsc::channel(CHUNK_BUFFER);
        if !is_event_stream {
            // Servers that ignore `stream` answer with one plain completion.
            let body: Value = response.json().await.context("invalid model response")?;
            let content = body
                .pointer("/choices/0/message/content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            let _ = tx.send(Ok(content)).await;
            return Ok(rx);
        }

        let mut stream = response.bytes_stream();
        tokio::spawn(async move {
            let mut pending = Vec::<u8>::new();
            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        let _ = tx
                            .send(Err(anyhow::anyhow!("model stream interrupted: {err}")))
                            .await;
                        return;
                    }
                };
                pending.extend_from_slice(&bytes);
                while let Some(newline) = pending.iter().position(|byte| *byte == b'\n') {
                    let line = pending.drain(..=newline).collect::<Vec<_>>();
                    let line = String::from_utf8_lossy(&line);
                    match parse_sse_line(&line) {
                        SseLine::Content(text) => {
                            if tx.send(Ok(text)).await.is_err() {
                                return;
                            }
                        }
                        SseLine::Done => return,
                        SseLine::Skip => {}
                    }
                }
            }
        });
        Ok(rx)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SseLine {
    Content(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    let Ok(parsed) = serde_json::from_str::<Value>(data) else {
        warn!("skipping malformed model stream line");
        return SseLine::Skip;
    };
    match parsed
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
    {
        Some(text) if !text.is_empty() => SseLine::Content(text.to_owned()),
        _ => SseLine::Skip,
    }
}

fn resolve_chat_completion_endpoint(base_url: &str) -> String {
    let trimmed = base_url.trim().trim_end_matches('/');
    let lower = trimmed.to_ascii_lowercase();
    if lower.ends_with("/chat/completions") {
        return trimmed.to_owned();
    }
    if lower.ends_with("/v1") {
        return format!("{trimmed}/chat/completions");
    }
    format!("{trimmed}/v1/chat/completions")
}

fn truncate_text(value: &str, max_len: usize) -> String {
    if value.len() <= max_len {
        return value.to_owned();
    }
    let mut end = max_len;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &value[..end])
}

/// What the model asked for in one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentReply {
    Final(String),
    Action {
        thought: String,
        action: String,
        input: String,
    },
    Direct(String),
}

static FINAL_ANSWER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Final\s+Answer\s*:").expect("valid regex"));

static ACTION_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)Action\s*:[ \t]*(?P<action>[^\n]*)(?:\s*Action\s*Input\s*:[ \t]*(?P<input>.*?)(?:\n\s*Observation\s*:|$))?",
    )
    .expect("valid regex")
});

/// Reads one model turn. A `Final Answer:` that comes before any `Action:`
/// ends the run; text with neither marker is taken as a direct answer.
pub fn parse_reply(text: &str) -> AgentReply {
    let final_answer = FINAL_ANSWER.find(text);
    let action_call = ACTION_CALL.captures(text);
    let action_start = action_call
        .as_ref()
        .and_then(|captures| captures.get(0))
        .map(|found| found.start());

    if let Some(found) = final_answer {
        if action_start.map(|at| found.start() < at).unwrap_or(true) {
            return AgentReply::Final(text[found.end()..].trim().to_owned());
        }
    }

    let (Some(captures), Some(action_start)) = (action_call, action_start) else {
        return AgentReply::Direct(text.trim().to_owned());
    };

    let thought = text[..action_start].trim();
    let thought = thought.strip_prefix("Thought:").unwrap_or(thought).trim();
    let capture = |name: &str| {
        captures
            .name(name)
            .map(|found| found.as_str().trim().to_owned())
            .unwrap_or_default()
    };

    AgentReply::Action {
        thought: thought.to_owned(),
        action: capture("action"),
        input: capture("input"),
    }
}

/// Thought/Action/Observation loop over a [`ModelClient`].
pub struct ReactAgent {
    model: Arc<dyn ModelClient>,
    tools: String,
    max_steps: usize,
}

impl ReactAgent {
    pub fn new(model: Arc<dyn ModelClient>, tools: String, max_steps: usize) -> Self {
        Self {
            model,
            tools,
            max_steps: max_steps.max(1),
        }
    }

    fn messages(&self, task: &str, scratchpad: &str) -> Vec<ChatMessage> {
        let mut prompt = format!("Task: {task}\n");
        if !scratchpad.is_empty() {
            prompt.push('\n');
            prompt.push_str(scratchpad);
        }
        vec![
            ChatMessage::system(format!("{SYSTEM_PROMPT}{}", self.tools)),
            ChatMessage::user(prompt),
        ]
    }
}

#[async_trait]
impl AgentRuntime for ReactAgent {
    async fn run(&self, task: &str, run: &RunHandle) -> Result<String> {
        let mut scratchpad = String::new();
        for step in 1..=self.max_steps {
            run.reasoning_started().await;
            let mut chunks = self
                .model
                .stream_chat(&self.messages(task, &scratchpad))
                .await?;
            let mut reply = String::new();
            while let Some(chunk) = chunks.recv().await {
                let chunk = chunk?;
                run.token(&chunk).await;
                reply.push_str(&chunk);
            }

            match parse_reply(&reply) {
                AgentReply::Final(answer) | AgentReply::Direct(answer) => {
                    info!("agent answered after {step} step(s)");
                    return Ok(answer);
                }
                AgentReply::Action {
                    thought,
                    action,
                    input,
                } => {
                    run.decision(&thought, &action, &input).await;
                    let observation = run.invoke(&action, &input).await;
                    scratchpad.push_str(&format!(
                        "Thought: {thought}\nAction: {action}\nAction Input: {input}\nObservation: {observation}\n"
                    ));
                }
            }
        }
        bail!(
            "agent stopped after {} steps without a final answer",
            self.max_steps
        )
    }
}
