use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    // Datastore
    pub database_path: String,

    // Translation provider
    pub translator_api_key: String,
    pub translator_api_url: String,
    pub translator_model: String,
    pub translation_timeout_secs: u64,

    // Retry
    pub translation_retries: u32,
    pub retry_backoff_ms: u64,

    // Quotas
    pub free_plan_limit: i64,
    pub pro_plan_limit: i64,

    // Enrollment / translation flow
    pub max_tenant_languages: usize,
    pub max_context_messages: usize,
    pub payload_max_bytes: usize,

    // Billing
    pub checkout_base_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        // Load .env if present (ignored in production)
        let _ = dotenvy::dotenv();

        Ok(Self {
            database_path: std::env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "data/translator.db".to_string()),

            translator_api_key: std::env::var("TRANSLATOR_API_KEY")
                .context("TRANSLATOR_API_KEY not set")?,
            translator_api_url: std::env::var("TRANSLATOR_API_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1/chat/completions".to_string()),
            translator_model: std::env::var("TRANSLATOR_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            translation_timeout_secs: env_parse("TRANSLATION_TIMEOUT_SECS", 10),

            translation_retries: env_parse("TRANSLATION_RETRIES", 3),
            retry_backoff_ms: env_parse("RETRY_BACKOFF_MS", 500),

            free_plan_limit: env_parse("FREE_PLAN_LIMIT", 50),
            pro_plan_limit: env_parse("PRO_PLAN_LIMIT", 8000),

            max_tenant_languages: env_parse("MAX_TENANT_LANGUAGES", 5),
            max_context_messages: env_parse("MAX_CONTEXT_MESSAGES", 10),
            payload_max_bytes: env_parse("PAYLOAD_MAX_BYTES", 280),

            checkout_base_url: std::env::var("CHECKOUT_BASE_URL").ok(),
        })
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        database_path: ":memory:".to_string(),
        translator_api_key: "test-key".to_string(),
        translator_api_url: "http://localhost/v1/chat/completions".to_string(),
        translator_model: "gpt-4o-mini".to_string(),
        translation_timeout_secs: 10,
        translation_retries: 3,
        retry_backoff_ms: 500,
        free_plan_limit: 50,
        pro_plan_limit: 8000,
        max_tenant_languages: 5,
        max_context_messages: 10,
        payload_max_bytes: 280,
        checkout_base_url: Some("https://checkout.example.com/start".to_string()),
    }
}
