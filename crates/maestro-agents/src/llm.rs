//! The completion client capability.
//!
//! The core only needs one thing from an LLM: given a prompt, return text
//! plus tool calls, and maybe fail. [`ScriptedClient`] replays canned turns
//! for tests and the offline runner; [`AnthropicClient`] is the thin live
//! implementation over the messages API.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const ANTHROPIC_API_KEY: &str = "ANTHROPIC_API_KEY";
pub const OPENAI_API_KEY: &str = "OPENAI_API_KEY";

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("completion request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("completion API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("scripted client ran out of turns")]
    ScriptExhausted,

    #[error("missing credentials: set {0}")]
    MissingCredentials(&'static str),
}

/// One tool invocation the model asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.arguments.get(key).and_then(|v| v.as_str())
    }
}

/// What a completion turn produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

impl CompletionResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            text: String::new(),
            tool_calls: vec![ToolCall {
                name: name.into(),
                arguments,
            }],
        }
    }

    pub fn find_tool(&self, name: &str) -> Option<&ToolCall> {
        self.tool_calls.iter().find(|c| c.name == name)
    }

    /// An empty turn: no text and no tool calls.
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.tool_calls.is_empty()
    }
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str)
        -> Result<CompletionResponse, LlmError>;
}

/// Replays a fixed sequence of turns; errors when the script runs out.
pub struct ScriptedClient {
    turns: Mutex<VecDeque<CompletionResponse>>,
}

impl ScriptedClient {
    pub fn new(turns: impl IntoIterator<Item = CompletionResponse>) -> Self {
        Self {
            turns: Mutex::new(turns.into_iter().collect()),
        }
    }

    pub fn remaining(&self) -> usize {
        self.turns.lock().unwrap().len()
    }
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    async fn complete(
        &self,
        _system: &str,
        prompt: &str,
    ) -> Result<CompletionResponse, LlmError> {
        let turn = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(LlmError::ScriptExhausted)?;
        debug!(prompt_len = prompt.len(), "scripted completion served");
        Ok(turn)
    }
}

// ---------------------------------------------------------------------------
// Live client
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: [MessageParam<'a>; 1],
}

#[derive(Serialize)]
struct MessageParam<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

/// Minimal messages-API client.
pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl AnthropicClient {
    /// Build from `ANTHROPIC_API_KEY`; errors when it is unset so the CLI
    /// can exit with the missing-credentials code.
    pub fn from_env() -> Result<Self, LlmError> {
        let api_key = std::env::var(ANTHROPIC_API_KEY)
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or(LlmError::MissingCredentials(ANTHROPIC_API_KEY))?;
        Ok(Self {
            http: reqwest::Client::new(),
            api_key,
            model: std::env::var("MAESTRO_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.into()),
            base_url: std::env::var("MAESTRO_ANTHROPIC_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.into()),
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

#[async_trait]
impl CompletionClient for AnthropicClient {
    async fn complete(
        &self,
        system: &str,
        prompt: &str,
    ) -> Result<CompletionResponse, LlmError> {
        let request = MessagesRequest {
            model: &self.model,
            max_tokens: DEFAULT_MAX_TOKENS,
            system,
            messages: [MessageParam {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(LlmError::Api {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let body: MessagesResponse = response.json().await?;
        let mut result = CompletionResponse::default();
        for block in body.content {
            match block {
                ContentBlock::Text { text } => {
                    if !result.text.is_empty() {
                        result.text.push('\n');
                    }
                    result.text.push_str(&text);
                }
                ContentBlock::ToolUse { name, input } => result.tool_calls.push(ToolCall {
                    name,
                    arguments: input,
                }),
                ContentBlock::Other => {}
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_client_replays_then_exhausts() {
        let client = ScriptedClient::new([
            CompletionResponse::text("plan: add endpoint"),
            CompletionResponse::tool("ask_architect", serde_json::json!({"question": "port?"})),
        ]);

        let first = client.complete("sys", "p").await.unwrap();
        assert_eq!(first.text, "plan: add endpoint");
        assert!(!first.is_empty());

        let second = client.complete("sys", "p").await.unwrap();
        assert_eq!(second.find_tool("ask_architect").unwrap().arg_str("question"), Some("port?"));

        assert!(matches!(
            client.complete("sys", "p").await,
            Err(LlmError::ScriptExhausted)
        ));
    }

    #[test]
    fn empty_turn_detection() {
        assert!(CompletionResponse::default().is_empty());
        assert!(CompletionResponse::text("  \n").is_empty());
        assert!(!CompletionResponse::text("x").is_empty());
        assert!(!CompletionResponse::tool("t", serde_json::json!({})).is_empty());
    }

    #[test]
    fn from_env_requires_key() {
        std::env::remove_var(ANTHROPIC_API_KEY);
        assert!(matches!(
            AnthropicClient::from_env(),
            Err(LlmError::MissingCredentials(_))
        ));
    }

    #[test]
    fn content_blocks_parse() {
        let raw = r#"{"content":[
            {"type":"text","text":"thinking"},
            {"type":"tool_use","id":"t1","name":"run_tests","input":{"filter":"unit"}},
            {"type":"unknown_block"}
        ]}"#;
        let parsed: MessagesResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.content.len(), 3);
    }
}
