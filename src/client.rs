use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cost::ModelPrices;

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Turn {
    pub fn user(content: Vec<ContentBlock>) -> Self {
        Self { role: Role::User, content }
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self { role: Role::Assistant, content }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::assistant(vec![ContentBlock::text(text)])
    }

    /// True if any block in this turn is a tool result.
    pub fn has_tool_result(&self) -> bool {
        self.content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolResult { .. }))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    /// Content is restricted to Text/Image blocks by convention.
    ToolResult {
        tool_use_id: String,
        content: Vec<ContentBlock>,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, text: impl Into<String>) -> Self {
        ContentBlock::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: vec![ContentBlock::text(text)],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub kind: String, // always "base64"
    pub media_type: String,
    pub data: String,
}

impl ImageSource {
    /// Parse a `data:image/png;base64,...` data URL. Returns None if malformed.
    pub fn from_data_url(url: &str) -> Option<Self> {
        let (meta, data) = url.split_once(',')?;
        let media_type = meta.strip_prefix("data:")?.split(';').next()?.to_string();
        Some(Self {
            kind: "base64".to_string(),
            media_type,
            data: data.to_string(),
        })
    }
}

/// One tool advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_write_tokens: Option<u64>,
    pub cache_read_tokens: Option<u64>,
}

#[derive(Debug)]
pub struct ModelResponse {
    pub content: Vec<ContentBlock>,
    pub usage: Usage,
}

#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub id: String,
    /// Maximum input token budget for one request.
    pub context_window: u32,
    pub prices: ModelPrices,
}

// ── ModelClient capability ────────────────────────────────────────────────────

/// The single seam to the model provider. The loop only ever sees this trait;
/// tests drive it with a scripted fake.
#[async_trait]
pub trait ModelClient: Send + Sync {
    fn model(&self) -> &ModelInfo;

    /// Send (system prompt, trimmed history, tool catalog), get back content
    /// blocks plus token usage. Usage must be reported even on cache-augmented
    /// responses.
    async fn create_message(
        &self,
        system: &str,
        turns: &[Turn],
        tools: &[ToolSpec],
    ) -> Result<ModelResponse>;
}

// ── HTTP implementation (Anthropic-style messages endpoint) ───────────────────

pub struct HttpClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    info: ModelInfo,
    max_tokens: u32,
}

impl HttpClient {
    pub fn new(endpoint: String, info: ModelInfo) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
            api_key: None,
            info,
            max_tokens: 8192,
        }
    }

    pub fn set_api_key(&mut self, key: String) {
        self.api_key = Some(key);
    }
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    content: Vec<ContentBlock>,
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    cache_creation_input_tokens: Option<u64>,
    cache_read_input_tokens: Option<u64>,
}

#[async_trait]
impl ModelClient for HttpClient {
    fn model(&self) -> &ModelInfo {
        &self.info
    }

    async fn create_message(
        &self,
        system: &str,
        turns: &[Turn],
        tools: &[ToolSpec],
    ) -> Result<ModelResponse> {
        let mut body = serde_json::json!({
            "model": self.info.id,
            "max_tokens": self.max_tokens,
            "system": system,
            "messages": turns,
        });
        if !tools.is_empty() {
            body["tools"] = serde_json::json!(tools);
        }

        let url = format!("{}/v1/messages", self.endpoint.trim_end_matches('/'));
        let mut req = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .header("anthropic-version", "2023-06-01")
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.header("x-api-key", key);
        }

        let resp = req.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("API error {}: {}", status, text));
        }

        let wire: WireResponse = resp.json().await?;
        Ok(ModelResponse {
            content: wire.content,
            usage: Usage {
                input_tokens: wire.usage.input_tokens.unwrap_or(0),
                output_tokens: wire.usage.output_tokens.unwrap_or(0),
                cache_write_tokens: wire.usage.cache_creation_input_tokens,
                cache_read_tokens: wire.usage.cache_read_input_tokens,
            },
        })
    }
}

// ── Human-readable request rendering ──────────────────────────────────────────

/// Render outgoing user content for the UI's api_req_started event.
/// Images are elided; tool results keep their text.
pub fn user_readable_request(content: &[ContentBlock]) -> String {
    let mut parts: Vec<String> = Vec::new();
    for block in content {
        match block {
            ContentBlock::Text { text } => parts.push(text.clone()),
            ContentBlock::Image { .. } => parts.push("[image]".to_string()),
            ContentBlock::ToolUse { name, input, .. } => {
                parts.push(format!("[tool use: {name} {input}]"))
            }
            ContentBlock::ToolResult { content, .. } => {
                let inner: Vec<String> = content
                    .iter()
                    .map(|b| match b {
                        ContentBlock::Text { text } => text.clone(),
                        _ => "[image]".to_string(),
                    })
                    .collect();
                parts.push(format!("[tool result]\n{}", inner.join("\n")));
            }
        }
    }
    parts.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_block_round_trips_through_json() {
        let block = ContentBlock::ToolUse {
            id: "toolu_1".to_string(),
            name: "read_file".to_string(),
            input: serde_json::json!({"path": "src/main.rs"}),
        };
        let json = serde_json::to_string(&block).unwrap();
        assert!(json.contains("\"type\":\"tool_use\""));
        let back: ContentBlock = serde_json::from_str(&json).unwrap();
        match back {
            ContentBlock::ToolUse { id, name, .. } => {
                assert_eq!(id, "toolu_1");
                assert_eq!(name, "read_file");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn image_source_from_data_url() {
        let src = ImageSource::from_data_url("data:image/png;base64,AAAA").unwrap();
        assert_eq!(src.media_type, "image/png");
        assert_eq!(src.data, "AAAA");
        assert!(ImageSource::from_data_url("not a data url").is_none());
    }

    #[test]
    fn readable_request_elides_images() {
        let content = vec![
            ContentBlock::text("do the thing"),
            ContentBlock::Image {
                source: ImageSource {
                    kind: "base64".to_string(),
                    media_type: "image/png".to_string(),
                    data: "AAAA".to_string(),
                },
            },
        ];
        let rendered = user_readable_request(&content);
        assert!(rendered.contains("do the thing"));
        assert!(rendered.contains("[image]"));
        assert!(!rendered.contains("AAAA"));
    }
}
