use async_trait::async_trait;
use backoff::{ExponentialBackoff, backoff::Backoff};
use reqwest::Client;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::InterpretationError;
use crate::models::{AnalysisRequest, Findings, InterpretationReply};
use crate::normalizer::normalize;

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";
pub const DEFAULT_TEMPERATURE: f32 = 0.2;
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

pub const SYSTEM_INSTRUCTION: &str = "You help with the interpretation of medical data. \
Do not make diagnoses; give hints and reference points only, and suggest seeing a doctor when in doubt.";

pub const OFFLINE_SUMMARY: &str =
    "AI interpretation is unavailable. Returning a template summary based on the submitted data.";

pub const OFFLINE_ADVICE: [&str; 2] = [
    "Check that the submitted data is correct",
    "See a doctor if you feel worse",
];

const PROMPT_PREAMBLE: &str = "You are a physician's assistant. From the patient data and test results provided, \
give a short summary and a list of key measurements with reference ranges and deviations. \
Return the answer in two parts:
1) A short summary of 2-4 sentences.
2) JSON with the fields: measurements (array of objects {name, value, unit, referenceLow, referenceHigh, status}), advice (array of strings).";

/// Settings for the completion service
#[derive(Debug, Clone)]
pub struct CompletionConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub timeout: Duration,
    pub max_retries: u32,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_retries: 0,
        }
    }
}

/// One chat completion to run: instruction, prompt text and image attachments
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionPrompt {
    pub system: String,
    pub text: String,
    pub images: Vec<String>,
}

/// Trait for anything able to answer a completion prompt with raw text
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, prompt: &CompletionPrompt) -> Result<String, InterpretationError>;
}

/// Completion service as resolved once at start-up
#[derive(Clone)]
pub enum CompletionService {
    Configured(Arc<dyn CompletionBackend>),
    Unconfigured,
}

/// Raw outcome of asking the completion service
#[derive(Debug, Clone, PartialEq)]
pub enum RawReply {
    Completion(String),
    Offline(InterpretationReply),
}

/// Client that turns an analysis request into an interpretation reply
#[derive(Clone)]
pub struct InterpretationClient {
    service: CompletionService,
}

impl InterpretationClient {
    pub fn new(service: CompletionService) -> Self {
        Self { service }
    }

    pub fn unconfigured() -> Self {
        Self::new(CompletionService::Unconfigured)
    }

    /// Resolve the service from configuration: no API key means offline mode
    pub fn from_config(config: &CompletionConfig) -> Result<Self, InterpretationError> {
        match config.api_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => {
                let backend = OpenRouterBackend::new(config)?;
                info!(model = %config.model, "Completion service configured");
                Ok(Self::new(CompletionService::Configured(Arc::new(backend))))
            }
            _ => {
                warn!("No completion API key configured, interpretations use the offline template");
                Ok(Self::unconfigured())
            }
        }
    }

    /// Ask the completion service. Only a missing configuration degrades to the
    /// offline reply; every error of a configured service propagates.
    pub async fn complete(&self, request: &AnalysisRequest) -> Result<RawReply, InterpretationError> {
        match &self.service {
            CompletionService::Unconfigured => Ok(RawReply::Offline(offline_reply())),
            CompletionService::Configured(backend) => {
                let prompt = CompletionPrompt {
                    system: SYSTEM_INSTRUCTION.to_string(),
                    text: build_prompt(request),
                    images: request.image_references.clone(),
                };
                info!(
                    domain_type = %request.domain_type,
                    images = prompt.images.len(),
                    "Requesting interpretation"
                );
                let content = backend.complete(&prompt).await?;
                info!(characters = content.len(), "Interpretation received");
                Ok(RawReply::Completion(content))
            }
        }
    }

    /// Complete and normalize in one step
    pub async fn interpret(
        &self,
        request: &AnalysisRequest,
    ) -> Result<InterpretationReply, InterpretationError> {
        Ok(match self.complete(request).await? {
            RawReply::Completion(content) => normalize(&content),
            RawReply::Offline(reply) => reply,
        })
    }
}

/// Canned reply used when no completion service is configured
pub fn offline_reply() -> InterpretationReply {
    let mut findings = Map::new();
    findings.insert("measurements".to_string(), json!([]));
    findings.insert("advice".to_string(), json!(OFFLINE_ADVICE));

    InterpretationReply {
        summary: OFFLINE_SUMMARY.to_string(),
        findings: Findings::Parsed(findings),
    }
}

/// Instructional prompt embedding the domain type, free text and vitals
pub fn build_prompt(request: &AnalysisRequest) -> String {
    let text = request
        .free_text
        .as_deref()
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .unwrap_or("-");
    let vitals = serde_json::to_string(&request.vitals).unwrap_or_else(|_| "{}".to_string());

    format!(
        "{PROMPT_PREAMBLE}\n\nType: {}\nText: {}\nAdditional data: {}",
        request.domain_type, text, vitals
    )
}

/// OpenAI-compatible chat completions backend (OpenRouter by default)
pub struct OpenRouterBackend {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_retries: u32,
}

impl OpenRouterBackend {
    pub fn new(config: &CompletionConfig) -> Result<Self, InterpretationError> {
        let client = Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key: config.api_key.clone().unwrap_or_default(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_retries: config.max_retries,
        })
    }

    fn payload(&self, prompt: &CompletionPrompt) -> Value {
        let user_content = if prompt.images.is_empty() {
            json!(prompt.text)
        } else {
            let mut parts = vec![json!({ "type": "text", "text": prompt.text })];
            parts.extend(prompt.images.iter().map(|url| {
                json!({
                    "type": "image_url",
                    "image_url": { "url": url }
                })
            }));
            Value::Array(parts)
        };

        json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": prompt.system },
                { "role": "user", "content": user_content }
            ],
            "temperature": self.temperature
        })
    }

    async fn send_once(&self, payload: &Value) -> Result<String, InterpretationError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(payload)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InterpretationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let response_json: Value = response.json().await.map_err(map_transport_error)?;
        extract_content(&response_json)
    }
}

#[async_trait]
impl CompletionBackend for OpenRouterBackend {
    async fn complete(&self, prompt: &CompletionPrompt) -> Result<String, InterpretationError> {
        let payload = self.payload(prompt);
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(8),
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };
        let mut attempts = 0;

        loop {
            match self.send_once(&payload).await {
                Ok(content) => return Ok(content),
                Err(e) if e.is_retryable() && attempts < self.max_retries => {
                    attempts += 1;
                    let delay = backoff.next_backoff().unwrap_or(backoff.max_interval);
                    warn!(
                        attempt = attempts,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Completion request failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn map_transport_error(e: reqwest::Error) -> InterpretationError {
    if e.is_timeout() {
        InterpretationError::Timeout
    } else {
        InterpretationError::Request(e)
    }
}

/// Text of the first choice; a null or missing content counts as empty
fn extract_content(response_json: &Value) -> Result<String, InterpretationError> {
    let choice = response_json
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .ok_or_else(|| {
            InterpretationError::MalformedResponse("reply carries no choices".to_string())
        })?;

    Ok(choice["message"]["content"]
        .as_str()
        .unwrap_or_default()
        .to_string())
}
