use crate::error::ProviderError;
use crate::models::{ContextMessage, TranslationRequest, TranslationResult};
use crate::ports::{LanguageDetector, TranslationPort};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

/// Wraps the translation port with target filtering: the detected source
/// language of a message is never a translation target.
#[derive(Clone)]
pub struct TranslationGateway {
    translator: Arc<dyn TranslationPort>,
    detector: Arc<dyn LanguageDetector>,
}

impl TranslationGateway {
    pub fn new(translator: Arc<dyn TranslationPort>, detector: Arc<dyn LanguageDetector>) -> Self {
        Self {
            translator,
            detector,
        }
    }

    /// Translate a message into every candidate language except the one it
    /// was written in. Returns an empty list (without calling the provider)
    /// when no targets remain.
    pub async fn translate(
        &self,
        sender_name: &str,
        text: &str,
        timestamp: DateTime<Utc>,
        context_messages: Vec<ContextMessage>,
        candidate_languages: &[String],
    ) -> Result<Vec<TranslationResult>, ProviderError> {
        let detected = self.detector.detect(text).unwrap_or_default();

        let mut targets: Vec<String> = Vec::new();
        for lang in candidate_languages {
            if lang.is_empty() || lang.eq_ignore_ascii_case(&detected) {
                continue;
            }
            let lowered = lang.to_lowercase();
            if !targets.contains(&lowered) {
                targets.push(lowered);
            }
        }

        if targets.is_empty() {
            info!("No target languages after filtering (detected: {})", detected);
            return Ok(Vec::new());
        }

        let request = TranslationRequest {
            sender_name: sender_name.to_string(),
            text: text.to_string(),
            timestamp,
            candidate_languages: targets,
            context_messages,
        };
        self.translator.translate(&request).await
    }
}

/// Delimiter used to round-trip several template texts through one
/// provider call.
const TEMPLATE_DELIMITER: &str = "\n---\n";

/// Localizes the bot's own template and notice texts through the
/// translation port. Every failure falls back to the English base text,
/// so localization can never break a flow.
#[derive(Clone)]
pub struct InterfaceTranslator {
    translator: Arc<dyn TranslationPort>,
}

impl InterfaceTranslator {
    pub fn new(translator: Arc<dyn TranslationPort>) -> Self {
        Self { translator }
    }

    /// Translate a batch of template texts into `target_lang` in a single
    /// call. Returns `None` when the translation is unusable (provider
    /// error, count mismatch after splitting) — callers keep their base
    /// texts.
    pub async fn localize(&self, texts: &[String], target_lang: &str) -> Option<Vec<String>> {
        if texts.is_empty() || target_lang.is_empty() {
            return None;
        }

        let joined = texts.join(TEMPLATE_DELIMITER);
        let request = TranslationRequest {
            sender_name: String::new(),
            text: joined,
            timestamp: Utc::now(),
            candidate_languages: vec![target_lang.to_lowercase()],
            context_messages: Vec::new(),
        };

        let results = match self.translator.translate(&request).await {
            Ok(results) => results,
            Err(e) => {
                debug!("Template localization failed: {}", e);
                return None;
            }
        };

        let translated = results.first()?;
        let parts: Vec<String> = translated
            .text
            .split(TEMPLATE_DELIMITER)
            .map(|part| part.trim().to_string())
            .collect();
        if parts.len() != texts.len() || parts.iter().any(|p| p.is_empty()) {
            debug!(
                "Template localization dropped the delimiter ({} parts for {} texts)",
                parts.len(),
                texts.len()
            );
            return None;
        }
        Some(parts)
    }

    /// Best-effort translation of a notice into each target language.
    /// Errors yield an empty list.
    pub async fn translate_into(
        &self,
        base_text: &str,
        target_languages: &[String],
    ) -> Vec<TranslationResult> {
        if target_languages.is_empty() {
            return Vec::new();
        }
        let request = TranslationRequest {
            sender_name: String::new(),
            text: base_text.to_string(),
            timestamp: Utc::now(),
            candidate_languages: target_languages.iter().map(|l| l.to_lowercase()).collect(),
            context_messages: Vec::new(),
        };
        match self.translator.translate(&request).await {
            Ok(results) => results,
            Err(e) => {
                debug!("Notice translation failed: {}", e);
                Vec::new()
            }
        }
    }
}

/// Unicode-script language detector.
///
/// Classifies by the dominant non-Latin script. Latin-script languages are
/// indistinguishable at this level, so Latin-dominant text yields `None`
/// and no candidate filtering happens for it.
pub struct ScriptDetector;

impl LanguageDetector for ScriptDetector {
    fn detect(&self, text: &str) -> Option<String> {
        let mut kana = 0usize;
        let mut han = 0usize;
        let mut hangul = 0usize;
        let mut thai = 0usize;
        let mut arabic = 0usize;
        let mut hebrew = 0usize;
        let mut cyrillic = 0usize;
        let mut latin = 0usize;

        for ch in text.chars() {
            match ch {
                '\u{3040}'..='\u{30FF}' => kana += 1,
                '\u{3400}'..='\u{4DBF}' | '\u{4E00}'..='\u{9FFF}' => han += 1,
                '\u{1100}'..='\u{11FF}' | '\u{AC00}'..='\u{D7AF}' => hangul += 1,
                '\u{0E00}'..='\u{0E7F}' => thai += 1,
                '\u{0600}'..='\u{06FF}' | '\u{0750}'..='\u{077F}' => arabic += 1,
                '\u{0590}'..='\u{05FF}' => hebrew += 1,
                '\u{0400}'..='\u{04FF}' => cyrillic += 1,
                'a'..='z' | 'A'..='Z' => latin += 1,
                _ => {}
            }
        }

        // Kana anywhere means Japanese even when ideographs dominate
        if kana > 0 && kana + han >= latin {
            return Some("ja".to_string());
        }

        let candidates = [
            (han, "zh"),
            (hangul, "ko"),
            (thai, "th"),
            (arabic, "ar"),
            (hebrew, "he"),
            (cyrillic, "ru"),
        ];
        let (count, code) = candidates.into_iter().max_by_key(|(count, _)| *count)?;
        if count == 0 || latin >= count {
            return None;
        }
        Some(code.to_string())
    }
}
