use std::collections::{BTreeMap, HashMap};

use futures::future::BoxFuture;
use tracing::{info, warn};

use gauntlet_core::config::{ProviderConfig, ProviderKind};
use gauntlet_core::error::Result;
use gauntlet_core::traits::ProviderGateway;
use gauntlet_core::types::{ProviderError, ProviderRequest, ProviderResponse};

use crate::providers::{AnthropicClient, OpenAiClient};

enum Client {
    OpenAi(OpenAiClient),
    Anthropic(AnthropicClient),
}

/// Routes provider calls to HTTP clients built from the `[providers]` table.
pub struct HttpGateway {
    clients: HashMap<String, Client>,
}

impl HttpGateway {
    pub fn from_config(providers: &BTreeMap<String, ProviderConfig>) -> Result<Self> {
        let mut clients = HashMap::new();
        for (name, config) in providers {
            if config.api_key.is_none() {
                warn!(provider = %name, "No API key configured, requests will be unauthenticated");
            }
            let client = match config.kind {
                ProviderKind::Openai => Client::OpenAi(OpenAiClient::new(name, config.clone())?),
                ProviderKind::Anthropic => {
                    Client::Anthropic(AnthropicClient::new(name, config.clone())?)
                }
            };
            clients.insert(name.clone(), client);
        }
        info!(providers = clients.len(), "Provider gateway ready");
        Ok(Self { clients })
    }

    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.clients.keys().map(String::as_str)
    }
}

impl ProviderGateway for HttpGateway {
    fn call(
        &self,
        provider_id: &str,
        request: ProviderRequest,
    ) -> BoxFuture<'_, std::result::Result<ProviderResponse, ProviderError>> {
        let client = self.clients.get(provider_id);
        let provider_id = provider_id.to_string();
        Box::pin(async move {
            match client {
                Some(Client::OpenAi(c)) => c.complete(request).await,
                Some(Client::Anthropic(c)) => c.complete(request).await,
                None => Err(ProviderError::permanent(format!(
                    "unknown provider '{provider_id}'"
                ))),
            }
        })
    }

    fn has_provider(&self, provider_id: &str) -> bool {
        self.clients.contains_key(provider_id)
    }
}
