//! Stock `TranslationPort` adapter over an OpenAI-compatible
//! chat-completions endpoint. The provider is asked for a strict JSON
//! envelope and its output is filtered to the requested candidate
//! languages only.

use crate::config::Config;
use crate::error::ProviderError;
use crate::models::{TranslationRequest, TranslationResult};
use crate::ports::TranslationPort;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;

const SYSTEM_INSTRUCTION: &str = r#"You are an interpreting engine for a multilingual group chat.

You receive a JSON object containing:
* "source_message": the message to be translated
* "context_messages": recent messages in the same group
* "target_languages": an array of language codes to translate into

Requirements:
* Use "source_message.text" as the text to translate.
* Use "context_messages" to understand the context and who is speaking to whom.
* Preserve user names (sender_name) exactly as they are; do NOT translate them.
* Preserve mention strings (e.g., "@John") in their original form.
* Produce natural interpretations that match each user's tone and the conversational context.
* Do not copy, quote, or directly reproduce the source_message.text in the translation output; return only the translated text for each target language.
* Output only a JSON object of the form {"translations": [{"lang": "...", "text": "..."}]}.
* Do NOT include context_messages or target_languages in the output JSON."#;

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    sender_name: String,
    text: String,
    timestamp: String,
}

#[derive(Debug, Serialize)]
struct UserContent {
    source_message: WireMessage,
    context_messages: Vec<WireMessage>,
    target_languages: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TranslationEnvelope {
    #[serde(default)]
    translations: Vec<TranslationResult>,
}

/// HTTP client for the translation provider.
pub struct ChatTranslationClient {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl ChatTranslationClient {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: config.translator_api_url.clone(),
            api_key: config.translator_api_key.clone(),
            model: config.translator_model.clone(),
            timeout: Duration::from_secs(config.translation_timeout_secs),
        }
    }

    fn build_body(&self, request: &TranslationRequest) -> Result<ChatRequest, ProviderError> {
        let content = UserContent {
            source_message: WireMessage {
                sender_name: request.sender_name.clone(),
                text: request.text.clone(),
                timestamp: request.timestamp.to_rfc3339(),
            },
            context_messages: request
                .context_messages
                .iter()
                .map(|msg| WireMessage {
                    sender_name: msg.sender_name.clone(),
                    text: msg.text.clone(),
                    timestamp: msg.timestamp.to_rfc3339(),
                })
                .collect(),
            target_languages: request.candidate_languages.clone(),
        };
        let content = serde_json::to_string(&content)
            .map_err(|e| ProviderError::Other(format!("Failed to serialize request: {}", e)))?;

        Ok(ChatRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: SYSTEM_INSTRUCTION.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content,
                },
            ],
            temperature: 0.2,
        })
    }
}

#[async_trait]
impl TranslationPort for ChatTranslationClient {
    async fn translate(
        &self,
        request: &TranslationRequest,
    ) -> Result<Vec<TranslationResult>, ProviderError> {
        if request.candidate_languages.is_empty() {
            return Ok(Vec::new());
        }

        let body = self.build_body(request)?;

        let response = self
            .client
            .post(&self.api_url)
            .timeout(self.timeout)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(self.timeout)
                } else {
                    ProviderError::Other(format!("Failed to call translation provider: {}", e))
                }
            })?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|e| format!("<failed to read body: {}>", e));
            return Err(ProviderError::Other(format!(
                "Translation provider error ({}): {}",
                status, body
            )));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Other(format!("Failed to parse provider response: {}", e)))?;

        let content = chat
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| ProviderError::Other("Provider response contained no choices".to_string()))?;

        let envelope: TranslationEnvelope = serde_json::from_str(&content).map_err(|e| {
            ProviderError::Other(format!("Unexpected translation payload format: {}", e))
        })?;

        let allowed: HashSet<String> = request
            .candidate_languages
            .iter()
            .map(|lang| lang.to_lowercase())
            .collect();
        let results: Vec<TranslationResult> = envelope
            .translations
            .into_iter()
            .filter(|item| {
                !item.lang.is_empty()
                    && !item.text.is_empty()
                    && allowed.contains(&item.lang.to_lowercase())
            })
            .collect();
        debug!("Provider returned {} usable translations", results.len());
        Ok(results)
    }
}
