//! Provider selection from environment configuration

use super::{Endpoint, LlmError, LlmService, LoggingService, OpenAIService};
use std::sync::Arc;

const DEFAULT_MODEL: &str = "gpt-4o";
const DEFAULT_AZURE_API_VERSION: &str = "2024-02-15-preview";

/// Which chat-completions backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Provider {
    #[default]
    OpenAI,
    AzureOpenAI,
}

impl Provider {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(Provider::OpenAI),
            "azure_openai" | "azure" => Some(Provider::AzureOpenAI),
            _ => None,
        }
    }
}

/// Configuration for LLM providers
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub provider: Provider,
    pub model: String,
    pub temperature: f32,
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub azure_api_key: Option<String>,
    pub azure_endpoint: Option<String>,
    /// Defaults to the model name
    pub azure_deployment: Option<String>,
    pub azure_api_version: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.0,
            openai_api_key: None,
            openai_base_url: None,
            azure_api_key: None,
            azure_endpoint: None,
            azure_deployment: None,
            azure_api_version: DEFAULT_AZURE_API_VERSION.to_string(),
        }
    }
}

impl LlmConfig {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());

        let provider = var("MODEL_PROVIDER")
            .and_then(|p| {
                let parsed = Provider::parse(&p);
                if parsed.is_none() {
                    tracing::warn!(provider = %p, "Unknown MODEL_PROVIDER, using openai");
                }
                parsed
            })
            .unwrap_or_default();

        Self {
            provider,
            model: var("LLM_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            temperature: var("LLM_TEMPERATURE")
                .and_then(|t| t.parse().ok())
                .unwrap_or(0.0),
            openai_api_key: var("OPENAI_API_KEY"),
            openai_base_url: var("OPENAI_BASE_URL"),
            azure_api_key: var("AZURE_API_KEY"),
            azure_endpoint: var("AZURE_ENDPOINT"),
            azure_deployment: var("AZURE_DEPLOYMENT"),
            azure_api_version: var("OPENAI_API_VERSION")
                .unwrap_or_else(|| DEFAULT_AZURE_API_VERSION.to_string()),
        }
    }

    fn endpoint_and_key(&self) -> Result<(Endpoint, String), LlmError> {
        match self.provider {
            Provider::OpenAI => {
                let key = self
                    .openai_api_key
                    .clone()
                    .ok_or_else(|| LlmError::config("OPENAI_API_KEY is not set"))?;
                let endpoint = match &self.openai_base_url {
                    Some(base_url) => Endpoint::OpenAI {
                        base_url: base_url.clone(),
                    },
                    None => Endpoint::openai_default(),
                };
                Ok((endpoint, key))
            }
            Provider::AzureOpenAI => {
                let key = self
                    .azure_api_key
                    .clone()
                    .ok_or_else(|| LlmError::config("AZURE_API_KEY is not set"))?;
                let endpoint = self
                    .azure_endpoint
                    .clone()
                    .ok_or_else(|| LlmError::config("AZURE_ENDPOINT is not set"))?;
                Ok((
                    Endpoint::Azure {
                        endpoint,
                        deployment: self
                            .azure_deployment
                            .clone()
                            .unwrap_or_else(|| self.model.clone()),
                        api_version: self.azure_api_version.clone(),
                    },
                    key,
                ))
            }
        }
    }
}

/// Build the configured provider, wrapped with logging
pub fn build_service(config: &LlmConfig) -> Result<Arc<dyn LlmService>, LlmError> {
    let (endpoint, api_key) = config.endpoint_and_key()?;
    let service = OpenAIService::new(
        api_key,
        config.model.clone(),
        endpoint,
        Some(config.temperature),
    )?;
    Ok(Arc::new(LoggingService::new(Arc::new(service))))
}
