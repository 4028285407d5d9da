use crate::core::config::Config;
use crate::core::error::GenerationError;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    pub provider: String, // "gemini", "ollama" or "openai"
    #[serde(default = "default_retry_count")]
    pub retry_count: usize,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    /// Temperature for prose generation.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Temperature for stages that must return structured data.
    #[serde(default = "default_structured_temperature")]
    pub structured_temperature: f32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default)]
    pub safety_policy: SafetyPolicy,
    pub gemini: Option<GeminiConfig>,
    pub ollama: Option<OllamaConfig>,
    pub openai: Option<OpenAIConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAIConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
}

fn default_retry_count() -> usize {
    3
}
fn default_retry_delay() -> u64 {
    10
}
fn default_temperature() -> f32 {
    0.7
}
fn default_structured_temperature() -> f32 {
    0.1
}
fn default_max_output_tokens() -> u32 {
    8192
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SafetyPolicy {
    #[default]
    Permissive,
    Strict,
}

/// Per-call model settings.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub safety_policy: SafetyPolicy,
    /// Ask the provider for a JSON response where it has such a mode.
    pub json_output: bool,
}

impl LlmConfig {
    pub fn structured_options(&self) -> GenerationConfig {
        GenerationConfig {
            temperature: self.structured_temperature,
            max_output_tokens: self.max_output_tokens,
            safety_policy: self.safety_policy,
            json_output: true,
        }
    }

    pub fn creative_options(&self) -> GenerationConfig {
        GenerationConfig {
            temperature: self.temperature,
            max_output_tokens: self.max_output_tokens,
            safety_policy: self.safety_policy,
            json_output: false,
        }
    }
}

/// A single text-generation call.
///
/// An `Ok` empty string means the provider's content filter suppressed the
/// output; it is not an error and callers must check for it.
#[async_trait]
pub trait LlmClient: Send + Sync + Debug {
    async fn chat(
        &self,
        system: &str,
        user: &str,
        options: &GenerationConfig,
    ) -> Result<String, GenerationError>;
}

pub fn create_llm(config: &Config) -> Result<Box<dyn LlmClient>> {
    let llm = &config.llm;
    info!("Initializing LLM client for provider: {}", llm.provider);
    let client: Box<dyn LlmClient> = match llm.provider.as_str() {
        "gemini" => {
            let cfg = llm.gemini.as_ref().context("Gemini config missing")?;
            Box::new(GeminiClient::new(&cfg.api_key, &cfg.model))
        }
        "ollama" => {
            let cfg = llm.ollama.as_ref().context("Ollama config missing")?;
            Box::new(OllamaClient::new(&cfg.base_url, &cfg.model))
        }
        "openai" => {
            let cfg = llm.openai.as_ref().context("OpenAI config missing")?;
            Box::new(OpenAIClient::new(&cfg.api_key, &cfg.model, cfg.base_url.as_deref()))
        }
        _ => return Err(anyhow!("Unknown LLM provider: {}", llm.provider)),
    };

    if llm.retry_count == 0 {
        return Ok(client);
    }
    Ok(Box::new(RetryingClient::new(
        client,
        llm.retry_count,
        Duration::from_secs(llm.retry_delay_seconds),
    )))
}

// --- Retry ---

/// Re-issues calls that failed with a `GenerationError`. Filtered (empty)
/// responses are passed through untouched.
#[derive(Debug)]
pub struct RetryingClient {
    inner: Box<dyn LlmClient>,
    retries: usize,
    delay: Duration,
}

impl RetryingClient {
    pub fn new(inner: Box<dyn LlmClient>, retries: usize, delay: Duration) -> Self {
        Self {
            inner,
            retries,
            delay,
        }
    }
}

#[async_trait]
impl LlmClient for RetryingClient {
    async fn chat(
        &self,
        system: &str,
        user: &str,
        options: &GenerationConfig,
    ) -> Result<String, GenerationError> {
        let mut attempt = 0;
        loop {
            match self.inner.chat(system, user, options).await {
                Ok(text) => return Ok(text),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    warn!(
                        "Model call failed (attempt {}/{}), retrying: {}",
                        attempt,
                        self.retries + 1,
                        e
                    );
                    tokio::time::sleep(self.delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn transport(provider: &'static str) -> impl FnOnce(reqwest::Error) -> GenerationError {
    move |source| GenerationError::Transport { provider, source }
}

// --- Gemini ---

const GEMINI: &str = "Gemini";

const GEMINI_HARM_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

/// Finish reasons that mean the content filter ate the answer.
const GEMINI_FILTER_REASONS: [&str; 5] = [
    "SAFETY",
    "PROHIBITED_CONTENT",
    "BLOCKLIST",
    "SPII",
    "RECITATION",
];

#[derive(Debug)]
struct GeminiClient {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl GeminiClient {
    fn new(api_key: &str, model: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystemInstruction>,
    generation_config: GeminiGenerationConfig,
    safety_settings: Vec<GeminiSafetySetting>,
}

#[derive(Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiSystemInstruction {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
}

#[derive(Serialize)]
struct GeminiSafetySetting {
    category: &'static str,
    threshold: &'static str,
}

fn gemini_safety_settings(policy: SafetyPolicy) -> Vec<GeminiSafetySetting> {
    let threshold = match policy {
        SafetyPolicy::Permissive => "BLOCK_NONE",
        SafetyPolicy::Strict => "BLOCK_LOW_AND_ABOVE",
    };
    GEMINI_HARM_CATEGORIES
        .iter()
        .map(|category| GeminiSafetySetting {
            category: *category,
            threshold,
        })
        .collect()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    prompt_feedback: Option<GeminiPromptFeedback>,
    error: Option<GeminiError>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPromptFeedback {
    block_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContentResponse>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiContentResponse {
    #[serde(default)]
    parts: Vec<GeminiPartResponse>,
}

#[derive(Deserialize)]
struct GeminiPartResponse {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Debug)]
struct GeminiError {
    message: String,
}

fn extract_gemini_text(result: GeminiResponse, body: &str) -> Result<String, GenerationError> {
    if let Some(err) = result.error {
        return Err(GenerationError::Api {
            provider: GEMINI,
            message: err.message,
        });
    }

    if let Some(reason) = result.prompt_feedback.and_then(|f| f.block_reason) {
        warn!("Gemini blocked the prompt: {}", reason);
        return Ok(String::new());
    }

    let first = result
        .candidates
        .and_then(|c| c.into_iter().next())
        .ok_or_else(|| GenerationError::Response {
            provider: GEMINI,
            detail: format!("no candidates in body: {}", body),
        })?;

    let text: String = first
        .content
        .map(|c| c.parts.into_iter().map(|p| p.text).collect())
        .unwrap_or_default();
    if !text.is_empty() {
        return Ok(text);
    }

    let reason = first.finish_reason.as_deref().unwrap_or("UNKNOWN");
    if GEMINI_FILTER_REASONS.contains(&reason) {
        warn!("Gemini response filtered. Finish reason: {}", reason);
        return Ok(String::new());
    }
    Err(GenerationError::Response {
        provider: GEMINI,
        detail: format!("empty candidate, finish reason: {}", reason),
    })
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn chat(
        &self,
        system: &str,
        user: &str,
        options: &GenerationConfig,
    ) -> Result<String, GenerationError> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );

        let request_body = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart {
                    text: user.to_string(),
                }],
            }],
            system_instruction: Some(GeminiSystemInstruction {
                parts: vec![GeminiPart {
                    text: system.to_string(),
                }],
            }),
            generation_config: GeminiGenerationConfig {
                temperature: options.temperature,
                max_output_tokens: options.max_output_tokens,
                response_mime_type: options.json_output.then_some("application/json"),
            },
            safety_settings: gemini_safety_settings(options.safety_policy),
        };

        debug!("Gemini request to model {}", self.model);
        let resp = self
            .client
            .post(&url)
            .json(&request_body)
            .send()
            .await
            .map_err(transport(GEMINI))?;

        if !resp.status().is_success() {
            let error_text = resp.text().await.map_err(transport(GEMINI))?;
            return Err(GenerationError::Api {
                provider: GEMINI,
                message: error_text,
            });
        }

        let response_text = resp.text().await.map_err(transport(GEMINI))?;
        let result: GeminiResponse =
            serde_json::from_str(&response_text).map_err(|e| GenerationError::Response {
                provider: GEMINI,
                detail: format!("{}. Body: {}", e, response_text),
            })?;

        extract_gemini_text(result, &response_text)
    }
}

// --- Ollama ---

const OLLAMA: &str = "Ollama";

#[derive(Debug)]
struct OllamaClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaClient {
    fn new(base_url: &str, model: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'static str>,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Serialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: OllamaMessageResponse,
}

#[derive(Deserialize)]
struct OllamaMessageResponse {
    content: String,
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn chat(
        &self,
        system: &str,
        user: &str,
        options: &GenerationConfig,
    ) -> Result<String, GenerationError> {
        let url = format!("{}/api/chat", self.base_url);

        if options.safety_policy == SafetyPolicy::Strict {
            debug!("Ollama has no content filter; safety policy ignored");
        }

        let request_body = OllamaRequest {
            model: self.model.clone(),
            messages: vec![
                OllamaMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                OllamaMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            stream: false,
            format: options.json_output.then_some("json"),
            options: OllamaOptions {
                temperature: options.temperature,
                num_predict: options.max_output_tokens,
            },
        };

        let resp = self
            .client
            .post(&url)
            .json(&request_body)
            .send()
            .await
            .map_err(transport(OLLAMA))?;

        if !resp.status().is_success() {
            let error_text = resp.text().await.map_err(transport(OLLAMA))?;
            return Err(GenerationError::Api {
                provider: OLLAMA,
                message: error_text,
            });
        }

        let result: OllamaResponse = resp.json().await.map_err(|e| GenerationError::Response {
            provider: OLLAMA,
            detail: e.to_string(),
        })?;
        Ok(result.message.content)
    }
}

// --- OpenAI ---

const OPENAI: &str = "OpenAI";

#[derive(Debug)]
struct OpenAIClient {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAIClient {
    fn new(api_key: &str, model: &str, base_url: Option<&str>) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url
                .unwrap_or("https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<OpenAIResponseFormat>,
}

#[derive(Serialize)]
struct OpenAIResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessageResponse,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIMessageResponse {
    content: Option<String>,
}

fn extract_openai_text(result: OpenAIResponse) -> Result<String, GenerationError> {
    let choice = result
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| GenerationError::Response {
            provider: OPENAI,
            detail: "no choices in response".to_string(),
        })?;

    if choice.finish_reason.as_deref() == Some("content_filter") {
        warn!("OpenAI response filtered");
        return Ok(String::new());
    }

    choice.message.content.ok_or_else(|| GenerationError::Response {
        provider: OPENAI,
        detail: "response missing content".to_string(),
    })
}

#[async_trait]
impl LlmClient for OpenAIClient {
    async fn chat(
        &self,
        system: &str,
        user: &str,
        options: &GenerationConfig,
    ) -> Result<String, GenerationError> {
        let url = format!("{}/chat/completions", self.base_url);

        let request_body = OpenAIRequest {
            model: self.model.clone(),
            messages: vec![
                OpenAIMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                OpenAIMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            temperature: options.temperature,
            max_tokens: options.max_output_tokens,
            response_format: options
                .json_output
                .then_some(OpenAIResponseFormat { kind: "json_object" }),
        };

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request_body)
            .send()
            .await
            .map_err(transport(OPENAI))?;

        if !resp.status().is_success() {
            let error_text = resp.text().await.map_err(transport(OPENAI))?;
            return Err(GenerationError::Api {
                provider: OPENAI,
                message: error_text,
            });
        }

        let result: OpenAIResponse = resp.json().await.map_err(|e| GenerationError::Response {
            provider: OPENAI,
            detail: e.to_string(),
        })?;
        extract_openai_text(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn parse_gemini(json: &str) -> Result<String, GenerationError> {
        let result: GeminiResponse = serde_json::from_str(json).unwrap();
        extract_gemini_text(result, json)
    }

    #[test]
    fn test_gemini_safety_block_is_empty_output() {
        let json = r#"{
            "candidates": [
                {
                    "finishReason": "SAFETY",
                    "index": 0
                }
            ]
        }"#;

        assert_eq!(parse_gemini(json).unwrap(), "");
    }

    #[test]
    fn test_gemini_prompt_block_is_empty_output() {
        let json = r#"{ "promptFeedback": { "blockReason": "OTHER" } }"#;
        assert_eq!(parse_gemini(json).unwrap(), "");
    }

    #[test]
    fn test_gemini_empty_content_is_an_error() {
        let json = r#"{
            "candidates": [
                {
                    "content": { "role": "model" },
                    "finishReason": "MAX_TOKENS",
                    "index": 0
                }
            ]
        }"#;

        let err = parse_gemini(json).unwrap_err();
        assert!(err.to_string().contains("MAX_TOKENS"));
    }

    #[test]
    fn test_gemini_response_parsing_success() {
        let json = r#"{
            "candidates": [
                {
                    "content": {
                        "parts": [
                            { "text": "Hello " },
                            { "text": "world" }
                        ],
                        "role": "model"
                    },
                    "finishReason": "STOP",
                    "index": 0
                }
            ]
        }"#;

        assert_eq!(parse_gemini(json).unwrap(), "Hello world");
    }

    #[test]
    fn test_gemini_api_error() {
        let json = r#"{ "error": { "code": 400, "message": "API key not valid" } }"#;
        let err = parse_gemini(json).unwrap_err();
        assert!(matches!(err, GenerationError::Api { .. }));
    }

    #[test]
    fn test_gemini_request_carries_generation_options() {
        let request = GeminiRequest {
            contents: vec![],
            system_instruction: None,
            generation_config: GeminiGenerationConfig {
                temperature: 0.1,
                max_output_tokens: 512,
                response_mime_type: Some("application/json"),
            },
            safety_settings: gemini_safety_settings(SafetyPolicy::Strict),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["generationConfig"]["maxOutputTokens"], 512);
        assert_eq!(value["generationConfig"]["responseMimeType"], "application/json");
        assert_eq!(value["safetySettings"].as_array().unwrap().len(), 4);
        assert_eq!(value["safetySettings"][0]["threshold"], "BLOCK_LOW_AND_ABOVE");
    }

    #[test]
    fn test_openai_request_asks_for_json_object() {
        let request = |json_output: bool| OpenAIRequest {
            model: "gpt-4o-mini".to_string(),
            messages: vec![],
            temperature: 0.1,
            max_tokens: 256,
            response_format: json_output.then_some(OpenAIResponseFormat { kind: "json_object" }),
        };
        let value = serde_json::to_value(request(true)).unwrap();
        assert_eq!(value["response_format"]["type"], "json_object");
        let value = serde_json::to_value(request(false)).unwrap();
        assert!(value.get("response_format").is_none());
    }

    #[test]
    fn test_openai_response_parsing_success() {
        let json = r#"{
            "id": "chatcmpl-123",
            "object": "chat.completion",
            "created": 1677652288,
            "model": "gpt-3.5-turbo-0613",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": "Hello there, how may I assist you today?"
                },
                "finish_reason": "stop"
            }]
        }"#;

        let result: OpenAIResponse = serde_json::from_str(json).unwrap();
        assert_eq!(
            extract_openai_text(result).unwrap(),
            "Hello there, how may I assist you today?"
        );
    }

    #[test]
    fn test_openai_content_filter_is_empty_output() {
        let json = r#"{
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": null },
                "finish_reason": "content_filter"
            }]
        }"#;

        let result: OpenAIResponse = serde_json::from_str(json).unwrap();
        assert_eq!(extract_openai_text(result).unwrap(), "");
    }

    #[derive(Debug)]
    struct FlakyClient {
        failures: usize,
        reply: String,
        calls: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl LlmClient for FlakyClient {
        async fn chat(
            &self,
            _system: &str,
            _user: &str,
            _options: &GenerationConfig,
        ) -> Result<String, GenerationError> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            if *calls <= self.failures {
                return Err(GenerationError::Api {
                    provider: "Mock",
                    message: "503".to_string(),
                });
            }
            Ok(self.reply.clone())
        }
    }

    fn options() -> GenerationConfig {
        GenerationConfig {
            temperature: 0.5,
            max_output_tokens: 100,
            safety_policy: SafetyPolicy::Permissive,
            json_output: false,
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failure() {
        let calls = Arc::new(Mutex::new(0));
        let inner = FlakyClient {
            failures: 2,
            reply: "ok".to_string(),
            calls: calls.clone(),
        };
        let client = RetryingClient::new(Box::new(inner), 3, Duration::ZERO);

        assert_eq!(client.chat("s", "u", &options()).await.unwrap(), "ok");
        assert_eq!(*calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_budget() {
        let calls = Arc::new(Mutex::new(0));
        let inner = FlakyClient {
            failures: 10,
            reply: "ok".to_string(),
            calls: calls.clone(),
        };
        let client = RetryingClient::new(Box::new(inner), 2, Duration::ZERO);

        assert!(client.chat("s", "u", &options()).await.is_err());
        assert_eq!(*calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_retry_does_not_repeat_filtered_output() {
        let calls = Arc::new(Mutex::new(0));
        let inner = FlakyClient {
            failures: 0,
            reply: String::new(),
            calls: calls.clone(),
        };
        let client = RetryingClient::new(Box::new(inner), 3, Duration::ZERO);

        assert_eq!(client.chat("s", "u", &options()).await.unwrap(), "");
        assert_eq!(*calls.lock().unwrap(), 1);
    }
}
