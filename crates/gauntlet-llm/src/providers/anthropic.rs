use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use gauntlet_core::config::ProviderConfig;
use gauntlet_core::error::Result;
use gauntlet_core::types::{ProviderError, ProviderRequest, ProviderResponse};

use super::{http_client, status_error, transport_error};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic Messages API client (non-streaming).
pub struct AnthropicClient {
    name: String,
    http: Client,
    config: ProviderConfig,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<ApiMessage<'a>>,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize, Debug)]
struct MessagesResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug, Default)]
struct UsageInfo {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

impl AnthropicClient {
    pub fn new(name: impl Into<String>, config: ProviderConfig) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            http: http_client(config.timeout_secs)?,
            config,
        })
    }

    fn build_body<'a>(&'a self, request: &'a ProviderRequest) -> MessagesRequest<'a> {
        MessagesRequest {
            model: &self.config.model_id,
            max_tokens: self.config.max_tokens,
            temperature: (self.config.temperature > 0.0).then_some(self.config.temperature),
            system: request.system.as_deref(),
            messages: vec![ApiMessage {
                role: "user",
                content: &request.prompt,
            }],
        }
    }

    pub async fn complete(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        let url = self.config.base_url.as_deref().unwrap_or(ANTHROPIC_API_URL);
        let body = self.build_body(&request);
        let mut req = self
            .http
            .post(url)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body);
        if let Some(api_key) = &self.config.api_key {
            req = req.header("x-api-key", api_key);
        }

        debug!(provider = %self.name, model = %self.config.model_id, stage = %request.stage_id, "Sending messages request");
        let response = req.send().await.map_err(|e| transport_error(&self.name, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(status_error(&self.name, status, &body));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| transport_error(&self.name, e))?;
        parse_response(&self.name, parsed)
    }
}

fn parse_response(
    provider: &str,
    parsed: MessagesResponse,
) -> std::result::Result<ProviderResponse, ProviderError> {
    let text: String = parsed
        .content
        .into_iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text),
            ContentBlock::Other => None,
        })
        .collect();
    if text.is_empty() {
        return Err(ProviderError::transient(format!(
            "{provider}: response had no text content"
        )));
    }
    let usage = parsed.usage.unwrap_or_default();
    Ok(ProviderResponse {
        text,
        model: parsed.model,
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
    })
}
