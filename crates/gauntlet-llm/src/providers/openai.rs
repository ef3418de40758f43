use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use gauntlet_core::config::ProviderConfig;
use gauntlet_core::error::Result;
use gauntlet_core::types::{ProviderError, ProviderRequest, ProviderResponse};

use super::{http_client, status_error, transport_error};

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible chat completions client. Works with OpenAI, Gemini's
/// compatibility endpoint, DeepSeek, Ollama, vLLM, Groq, OpenRouter, etc.
///
/// `base_url` in the provider config is the full completions endpoint.
pub struct OpenAiClient {
    name: String,
    http: Client,
    config: ProviderConfig,
}

// Request types
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<OaiMessage<'a>>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct OaiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

// Response types
#[derive(Deserialize, Debug)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize, Debug)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl OpenAiClient {
    pub fn new(name: impl Into<String>, config: ProviderConfig) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            http: http_client(config.timeout_secs)?,
            config,
        })
    }

    fn endpoint(&self) -> &str {
        self.config.base_url.as_deref().unwrap_or(OPENAI_API_URL)
    }

    fn build_body<'a>(&'a self, request: &'a ProviderRequest) -> ChatRequest<'a> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system.as_deref() {
            messages.push(OaiMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(OaiMessage {
            role: "user",
            content: &request.prompt,
        });

        // o-series models reject temperature
        let is_o_series = ["o1", "o3", "o4"]
            .iter()
            .any(|p| self.config.model_id.starts_with(p));

        ChatRequest {
            model: &self.config.model_id,
            messages,
            max_tokens: self.config.max_tokens,
            temperature: (!is_o_series && self.config.temperature > 0.0)
                .then_some(self.config.temperature),
            response_format: request
                .expect_json
                .then(|| serde_json::json!({ "type": "json_object" })),
        }
    }

    pub async fn complete(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        let body = self.build_body(&request);
        let mut req = self.http.post(self.endpoint()).json(&body);
        if let Some(api_key) = &self.config.api_key {
            req = req.header("Authorization", format!("Bearer {}", api_key));
        }

        debug!(provider = %self.name, model = %self.config.model_id, stage = %request.stage_id, "Sending chat completion");
        let response = req.send().await.map_err(|e| transport_error(&self.name, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(status_error(&self.name, status, &body));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| transport_error(&self.name, e))?;
        parse_response(&self.name, parsed)
    }
}

fn parse_response(
    provider: &str,
    parsed: ChatResponse,
) -> std::result::Result<ProviderResponse, ProviderError> {
    let text = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| ProviderError::transient(format!("{provider}: response had no content")))?;
    let usage = parsed.usage.unwrap_or(Usage {
        prompt_tokens: 0,
        completion_tokens: 0,
    });
    Ok(ProviderResponse {
        text,
        model: parsed.model,
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
    })
}
