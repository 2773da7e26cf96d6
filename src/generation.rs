//! Text generation providers.
//!
//! A [`GenerationProvider`] turns a fully-built prompt into answer text.
//! Two remote backends are supported: OpenAI chat completions and Ollama's
//! `/api/generate`. Both share the retry and backoff plumbing in
//! [`crate::http`]. The retrieval orchestrator enforces its own deadline on
//! top of the per-request HTTP timeout.

use async_trait::async_trait;

use crate::config::GenerationConfig;
use crate::error::{KbError, KbResult};
use crate::http::{build_client, post_json_with_retry};

#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Provider and model, for logs (e.g. `"openai:gpt-4o-mini"`).
    fn name(&self) -> String;
    async fn generate(&self, prompt: &str) -> KbResult<String>;
}

pub struct OpenAIGenerator {
    model: String,
    url: String,
    api_key: String,
    temperature: f32,
    max_tokens: u32,
    max_retries: u32,
    timeout_secs: u64,
    client: reqwest::Client,
}

impl OpenAIGenerator {
    pub fn new(config: &GenerationConfig) -> KbResult<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| KbError::Config("OPENAI_API_KEY environment variable not set".into()))?;
        Ok(Self {
            model: config.model.clone(),
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1/chat/completions".to_string()),
            api_key,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
            timeout_secs: config.timeout_secs,
            client: build_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl GenerationProvider for OpenAIGenerator {
    fn name(&self) -> String {
        format!("openai:{}", self.model)
    }

    async fn generate(&self, prompt: &str) -> KbResult<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });
        let json = post_json_with_retry(
            &self.client,
            &self.url,
            Some(&self.api_key),
            &body,
            self.max_retries,
            self.timeout_secs,
            "OpenAI",
        )
        .await?;
        parse_chat_completion(&json)
    }
}

fn parse_chat_completion(json: &serde_json::Value) -> KbResult<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| KbError::Provider("Invalid OpenAI response: missing choices[0].message.content".into()))
}

pub struct OllamaGenerator {
    model: String,
    url: String,
    temperature: f32,
    max_tokens: u32,
    max_retries: u32,
    timeout_secs: u64,
    client: reqwest::Client,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> KbResult<Self> {
        Ok(Self {
            model: config.model.clone(),
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
            timeout_secs: config.timeout_secs,
            client: build_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl GenerationProvider for OllamaGenerator {
    fn name(&self) -> String {
        format!("ollama:{}", self.model)
    }

    async fn generate(&self, prompt: &str) -> KbResult<String> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": self.temperature,
                "num_predict": self.max_tokens,
            },
        });
        let json = post_json_with_retry(
            &self.client,
            &format!("{}/api/generate", self.url.trim_end_matches('/')),
            None,
            &body,
            self.max_retries,
            self.timeout_secs,
            "Ollama",
        )
        .await?;
        json.get("response")
            .and_then(|r| r.as_str())
            .map(|s| s.trim().to_string())
            .ok_or_else(|| KbError::Provider("Invalid Ollama response: missing response".into()))
    }
}

pub fn create_generator(config: &GenerationConfig) -> KbResult<Box<dyn GenerationProvider>> {
    match config.provider.as_str() {
        "openai" => Ok(Box::new(OpenAIGenerator::new(config)?)),
        "ollama" => Ok(Box::new(OllamaGenerator::new(config)?)),
        other => Err(KbError::Config(format!("Unknown generation provider: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chat_completion() {
        let json = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "  Paris.\n"}}]
        });
        assert_eq!(parse_chat_completion(&json).unwrap(), "Paris.");
    }

    #[test]
    fn test_parse_chat_completion_missing_content() {
        let err = parse_chat_completion(&serde_json::json!({"choices": []})).unwrap_err();
        assert!(err.is_provider_failure());
    }

    #[test]
    fn test_ollama_generator_needs_no_key() {
        let config = GenerationConfig {
            provider: "ollama".into(),
            model: "llama3".into(),
            ..GenerationConfig::default()
        };
        let generator = create_generator(&config).unwrap();
        assert_eq!(generator.name(), "ollama:llama3");
    }
}
