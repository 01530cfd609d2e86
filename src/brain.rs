use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::{ModelSettings, RetryPolicy};
use crate::error::DecisionError;
use crate::grid::GridSpec;
use crate::protocol::{DecisionRequest, system_prompt};
use crate::types::{EncodedImage, TokenUsage};

pub const API_KEY_VAR: &str = "ANTHROPIC_API_KEY";
const API_VERSION: &str = "2023-06-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const PREVIOUS_STEP_NOTE: &str =
    "**Previous step screenshot** (showing the action that was just executed):\n\n";

/// Unparsed model output plus the tokens it cost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub text: String,
    pub usage: TokenUsage,
}

/// Something that turns a screenshot and context into the model's next move.
#[async_trait]
pub trait DecisionClient: Send {
    async fn request_decision(
        &mut self,
        request: &DecisionRequest,
    ) -> Result<RawResponse, DecisionError>;

    /// Tokens consumed so far by this client.
    fn usage(&self) -> TokenUsage;
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: ApiUsage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Anthropic Messages API client.
pub struct AnthropicClient {
    http: Client,
    api_key: String,
    settings: ModelSettings,
    retry: RetryPolicy,
    system: String,
    usage: TokenUsage,
}

impl AnthropicClient {
    pub fn new(
        api_key: String,
        settings: ModelSettings,
        retry: RetryPolicy,
        grid: &GridSpec,
    ) -> Result<Self, DecisionError> {
        if api_key.trim().is_empty() {
            return Err(DecisionError::MissingApiKey);
        }
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            api_key,
            settings,
            retry,
            system: system_prompt(grid),
            usage: TokenUsage::default(),
        })
    }

    /// Reads the key from `ANTHROPIC_API_KEY`.
    pub fn from_env(
        settings: ModelSettings,
        retry: RetryPolicy,
        grid: &GridSpec,
    ) -> Result<Self, DecisionError> {
        let api_key = std::env::var(API_KEY_VAR).map_err(|_| DecisionError::MissingApiKey)?;
        Self::new(api_key, settings, retry, grid)
    }

    fn body(&self, request: &DecisionRequest) -> Value {
        json!({
            "model": self.settings.model,
            "max_tokens": self.settings.max_tokens,
            "temperature": self.settings.temperature,
            "system": self.system,
            "messages": [{ "role": "user", "content": message_content(request) }],
        })
    }

    async fn send_once(&self, body: &Value) -> Result<RawResponse, DecisionError> {
        let response = self
            .http
            .post(&self.settings.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let payload: Value = response.json().await.unwrap_or(Value::Null);
            let message = payload["error"]["message"]
                .as_str()
                .unwrap_or("Unknown API error")
                .to_string();
            return Err(DecisionError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: MessagesResponse = response.json().await?;
        let usage = TokenUsage {
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
        };
        let text = parsed
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .find_map(|block| block.text)
            .filter(|text| !text.trim().is_empty())
            .ok_or(DecisionError::EmptyResponse)?;
        Ok(RawResponse { text, usage })
    }
}

#[async_trait]
impl DecisionClient for AnthropicClient {
    async fn request_decision(
        &mut self,
        request: &DecisionRequest,
    ) -> Result<RawResponse, DecisionError> {
        let body = self.body(request);
        let attempts = self.retry.transport_attempts.max(1);

        let mut attempt = 1;
        loop {
            match self.send_once(&body).await {
                Ok(raw) => {
                    self.usage.add(raw.usage);
                    debug!("model reply: {}", raw.text);
                    info!(
                        "tokens: {} in / {} out",
                        raw.usage.input_tokens, raw.usage.output_tokens
                    );
                    return Ok(raw);
                }
                Err(e) if attempt < attempts && is_transient(&e) => {
                    warn!("API call failed (attempt {}/{}): {}", attempt, attempts, e);
                    tokio::time::sleep(self.retry.transport_backoff()).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn usage(&self) -> TokenUsage {
        self.usage
    }
}

/// Previous marked image (when present), then the current grid screenshot,
/// then the text context.
fn message_content(request: &DecisionRequest) -> Vec<Value> {
    let mut content = Vec::with_capacity(4);
    if let Some(previous) = &request.previous {
        content.push(image_block(previous));
        content.push(json!({ "type": "text", "text": PREVIOUS_STEP_NOTE }));
    }
    content.push(image_block(&request.screenshot));
    content.push(json!({ "type": "text", "text": request.context }));
    content
}

fn image_block(image: &EncodedImage) -> Value {
    json!({
        "type": "image",
        "source": {
            "type": "base64",
            "media_type": image.media_type,
            "data": image.data,
        },
    })
}

/// Network failures, rate limits and server errors are worth another try.
fn is_transient(error: &DecisionError) -> bool {
    match error {
        DecisionError::Transport(_) | DecisionError::EmptyResponse => true,
        DecisionError::Api { status, .. } => *status == 429 || *status >= 500,
        DecisionError::MissingApiKey => false,
    }
}
