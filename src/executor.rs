//! HTTP prompt executor — sends task prompts to an OpenAI-compatible
//! `/chat/completions` endpoint (OpenAI, Ollama, llama.cpp, vLLM, ...).

use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;

use steward_core::config::ExecutorConfig;
use steward_core::error::{Result, StewardError};
use steward_core::traits::PromptExecutor;

pub struct HttpPromptExecutor {
    base_url: String,
    model: String,
    api_key: String,
    system_prompt: String,
    client: reqwest::Client,
}

impl HttpPromptExecutor {
    pub fn from_config(config: &ExecutorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| StewardError::Config(format!("HTTP client: {e}")))?;

        Ok(Self {
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.resolved_api_key(),
            system_prompt: config.system_prompt.clone(),
            client,
        })
    }

    fn request_body(&self, prompt: &str) -> Value {
        let mut messages = Vec::new();
        if !self.system_prompt.is_empty() {
            messages.push(json!({"role": "system", "content": self.system_prompt}));
        }
        messages.push(json!({"role": "user", "content": prompt}));
        json!({
            "model": self.model,
            "messages": messages,
        })
    }
}

#[async_trait]
impl PromptExecutor for HttpPromptExecutor {
    fn name(&self) -> &str {
        &self.model
    }

    async fn execute(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&self.request_body(prompt));
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let resp = req
            .send()
            .await
            .map_err(|e| StewardError::Execution(format!("connection failed ({url}): {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(StewardError::Execution(format!("API error {status}: {text}")));
        }

        let body: Value = resp.json().await.map_err(StewardError::execution)?;
        completion_text(&body)
    }
}

/// Assistant text from a chat completion response.
fn completion_text(body: &Value) -> Result<String> {
    let choice = body["choices"]
        .get(0)
        .ok_or_else(|| StewardError::execution("no choices in response"))?;
    choice["message"]["content"]
        .as_str()
        .map(String::from)
        .ok_or_else(|| StewardError::execution("response has no text content"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_text() {
        let body = json!({
            "choices": [{"message": {"role": "assistant", "content": "3 new emails"}}]
        });
        assert_eq!(completion_text(&body).unwrap(), "3 new emails");

        assert!(completion_text(&json!({"choices": []})).is_err());
        let no_text = json!({"choices": [{"message": {"content": null}}]});
        assert!(matches!(completion_text(&no_text), Err(StewardError::Execution(_))));
    }

    #[test]
    fn test_request_body() {
        let config = ExecutorConfig {
            endpoint: "http://localhost:11434/v1/".into(),
            model: "llama3.2".into(),
            ..ExecutorConfig::default()
        };
        let executor = HttpPromptExecutor::from_config(&config).unwrap();
        assert_eq!(executor.base_url, "http://localhost:11434/v1");

        let body = executor.request_body("Summarize");
        assert_eq!(body["model"], "llama3.2");
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["content"], "Summarize");
    }
}
