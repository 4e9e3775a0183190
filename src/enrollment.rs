use crate::db::Database;
use crate::gateway::InterfaceTranslator;
use crate::models::{LanguageChoice, LanguagePreference, Reply, ReplyBundle};
use crate::payload::{EnrollmentPayload, PayloadCodec};
use crate::ports::LanguagePreferenceAnalyzer;
use crate::reply;
use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

/// Character budget for texts rendered into the confirmation template.
const PROMPT_TEXT_LIMIT: usize = 240;

/// Language enrollment: propose a language set from free text, then
/// resolve it through a confirm or cancel action.
///
/// There is no session object; the proposed set and all pre-rendered texts
/// travel inside the action tokens, and the per-tenant gate row makes the
/// resolution exactly-once under webhook redelivery.
#[derive(Clone)]
pub struct EnrollmentEngine {
    db: Database,
    analyzer: Arc<dyn LanguagePreferenceAnalyzer>,
    interface: InterfaceTranslator,
    codec: PayloadCodec,
    max_languages: usize,
}

impl EnrollmentEngine {
    pub fn new(
        db: Database,
        analyzer: Arc<dyn LanguagePreferenceAnalyzer>,
        interface: InterfaceTranslator,
        codec: PayloadCodec,
        max_languages: usize,
    ) -> Self {
        Self {
            db,
            analyzer,
            interface,
            codec,
            max_languages,
        }
    }

    /// Analyze free text and, when it names at least one supported
    /// language, reply with a confirmation prompt whose buttons carry the
    /// encoded enrollment tokens.
    ///
    /// Analyzer failures map to a fixed resend-fallback message: enrollment
    /// must never leave a tenant stuck because of a transient provider
    /// error.
    pub async fn propose(&self, tenant_id: &str, text: &str) -> Result<Option<ReplyBundle>> {
        let preference = match self.analyzer.analyze(text).await {
            Ok(Some(preference)) => preference,
            Ok(None) => {
                info!("Language analysis returned no result");
                return Ok(Some(ReplyBundle::text(reply::LANGUAGE_ANALYSIS_FALLBACK)));
            }
            Err(e) => {
                warn!("Failed to analyze language preferences: {}", e);
                return Ok(Some(ReplyBundle::text(reply::LANGUAGE_ANALYSIS_FALLBACK)));
            }
        };

        let detected_total = preference.supported.len() + preference.unsupported.len();
        if detected_total > self.max_languages {
            // Never walk a user into an unsatisfiable confirmation
            info!(
                "Language selection exceeds max allowed: {} detected, max {}",
                detected_total, self.max_languages
            );
            let message = self
                .localized_limit_message(&preference.primary_language)
                .await;
            self.db.set_translation_enabled(tenant_id, false)?;
            return Ok(Some(ReplyBundle::text(reply::truncate_reply(&message))));
        }

        let (limited, dropped) = self.limit_choices(&preference.supported);

        let mut bundle = ReplyBundle::default();
        if !preference.unsupported.is_empty() {
            bundle.push(Reply::Text(
                self.localized_unsupported_message(&preference).await,
            ));
        }

        if !dropped.is_empty() {
            bundle.push(Reply::Text(
                self.localized_limit_message(&preference.primary_language)
                    .await,
            ));
            // Pause translation and ask for a restatement
            self.db.set_translation_enabled(tenant_id, false)?;
            return Ok(Some(bundle));
        }

        if limited.is_empty() {
            if bundle.is_empty() {
                return Ok(None);
            }
            return Ok(Some(bundle));
        }

        let texts = self.prepare_prompt_texts(&limited, &preference).await;

        let confirm_token = self.codec.encode(&EnrollmentPayload::confirm(
            limited.clone(),
            texts.primary_language.clone(),
            texts.completion_text.clone(),
            self.localized_limit_message(&preference.primary_language)
                .await,
        ))?;
        let cancel_token = self.codec.encode(&EnrollmentPayload::cancel(
            texts.primary_language.clone(),
            texts.cancel_text.clone(),
        ))?;

        bundle.push(Reply::Confirm {
            text: texts.confirm_text,
            confirm_label: format!("🆗 {}", texts.confirm_label),
            cancel_label: format!("↩️ {}", texts.cancel_label),
            confirm_data: confirm_token,
            cancel_data: cancel_token,
        });

        self.db.record_prompt(tenant_id)?;
        self.db.set_translation_enabled(tenant_id, false)?;
        info!(
            "Language enrollment prompt sent: {:?}",
            limited.iter().map(|l| l.code.as_str()).collect::<Vec<_>>()
        );
        Ok(Some(bundle))
    }

    /// Resolve a confirm action. Returns `None` for duplicate deliveries:
    /// no re-notify, no re-persist.
    pub async fn confirm(
        &self,
        tenant_id: &str,
        payload: &EnrollmentPayload,
    ) -> Result<Option<ReplyBundle>> {
        let languages = dedup_languages(&payload.languages);

        // The token may be stale or tampered with; re-validate the cap
        if languages.len() > self.max_languages {
            let warning = payload
                .limit_text
                .clone()
                .unwrap_or_else(|| reply::build_language_limit_message(self.max_languages));
            return Ok(Some(ReplyBundle::text(warning)));
        }

        if !self.db.try_complete(tenant_id, &languages)? {
            info!("Duplicate language confirmation ignored: {}", tenant_id);
            return Ok(None);
        }
        self.db.set_translation_enabled(tenant_id, true)?;

        let base = payload
            .completion_text
            .clone()
            .unwrap_or_else(|| reply::build_completion_message(&languages));
        let text = self.multilingual_completion(&base, &languages).await;
        info!(
            "Language preferences saved: {:?}",
            languages.iter().map(|l| l.code.as_str()).collect::<Vec<_>>()
        );
        Ok(Some(ReplyBundle::text(text)))
    }

    /// Resolve a cancel action; duplicates are a no-op.
    pub async fn cancel(
        &self,
        tenant_id: &str,
        payload: &EnrollmentPayload,
    ) -> Result<Option<ReplyBundle>> {
        if !self.db.try_cancel(tenant_id)? {
            info!("Duplicate language cancellation ignored: {}", tenant_id);
            return Ok(None);
        }
        self.db.set_translation_enabled(tenant_id, false)?;

        let text = payload
            .cancel_text
            .clone()
            .unwrap_or_else(reply::build_cancel_message);
        Ok(Some(ReplyBundle::text(text)))
    }

    // ---- helpers ----

    /// Dedup by code and cap at the configured maximum, preserving order.
    fn limit_choices(
        &self,
        languages: &[LanguageChoice],
    ) -> (Vec<LanguageChoice>, Vec<LanguageChoice>) {
        let mut limited = Vec::new();
        let mut dropped = Vec::new();
        let mut seen = Vec::new();
        for lang in languages {
            let code = lang.code.to_lowercase();
            if code.is_empty() || seen.contains(&code) {
                continue;
            }
            seen.push(code.clone());
            let choice = LanguageChoice::new(code, lang.name.clone());
            if limited.len() < self.max_languages {
                limited.push(choice);
            } else {
                dropped.push(choice);
            }
        }
        (limited, dropped)
    }

    async fn localized_limit_message(&self, instruction_lang: &str) -> String {
        let base = reply::build_language_limit_message(self.max_languages);
        self.localize_one(base, instruction_lang).await
    }

    async fn localized_unsupported_message(&self, preference: &LanguagePreference) -> String {
        let base = reply::build_unsupported_message(&preference.unsupported);
        self.localize_one(base, &preference.primary_language).await
    }

    async fn localize_one(&self, base: String, instruction_lang: &str) -> String {
        let lowered = instruction_lang.to_lowercase();
        if lowered.is_empty() || lowered.starts_with("en") {
            return base;
        }
        match self.interface.localize(&[base.clone()], &lowered).await {
            Some(mut texts) => normalize_template_text(&texts.remove(0)),
            None => base,
        }
    }

    async fn prepare_prompt_texts(
        &self,
        limited: &[LanguageChoice],
        preference: &LanguagePreference,
    ) -> PromptTexts {
        let primary_language = preference.primary_language.to_lowercase();

        let base_confirm = reply::build_simple_confirm_text(limited);
        let base_cancel = reply::build_cancel_message();
        let base_confirm_label = if preference.confirm_label.is_empty() {
            "OK".to_string()
        } else {
            preference.confirm_label.clone()
        };
        let base_cancel_label = if preference.cancel_label.is_empty() {
            "Cancel".to_string()
        } else {
            preference.cancel_label.clone()
        };

        let bases = vec![
            base_confirm.clone(),
            base_cancel.clone(),
            base_confirm_label.clone(),
            base_cancel_label.clone(),
        ];
        let localized = if primary_language.is_empty() {
            None
        } else {
            self.interface.localize(&bases, &primary_language).await
        };
        let localized = localized.unwrap_or(bases);

        let completion = reply::build_completion_message(limited);

        PromptTexts {
            confirm_text: reply::truncate_chars(
                &normalize_template_text(&localized[0]),
                PROMPT_TEXT_LIMIT,
            ),
            cancel_text: reply::truncate_chars(
                &normalize_template_text(&localized[1]),
                PROMPT_TEXT_LIMIT,
            ),
            confirm_label: localized[2].clone(),
            cancel_label: localized[3].clone(),
            completion_text: reply::truncate_chars(
                &normalize_template_text(&completion),
                PROMPT_TEXT_LIMIT,
            ),
            primary_language,
        }
    }

    /// Completion message in the configured languages: English base first,
    /// best-effort translations after it, duplicates removed.
    async fn multilingual_completion(&self, base: &str, languages: &[LanguageChoice]) -> String {
        let targets: Vec<String> = languages
            .iter()
            .map(|l| l.code.to_lowercase())
            .filter(|code| !code.starts_with("en"))
            .collect();

        let mut lines = vec![base.trim().to_string()];
        if !targets.is_empty() {
            for item in self.interface.translate_into(base, &targets).await {
                let cleaned = reply::strip_source_echo(base, &item.text);
                let cleaned = cleaned.trim();
                if !cleaned.is_empty() && !lines.iter().any(|l| l == cleaned) {
                    lines.push(cleaned.to_string());
                }
            }
        }
        lines.join("\n\n")
    }
}

struct PromptTexts {
    confirm_text: String,
    cancel_text: String,
    confirm_label: String,
    cancel_label: String,
    completion_text: String,
    primary_language: String,
}

fn normalize_template_text(text: &str) -> String {
    text.replace("\n\n", "\n").trim().to_string()
}

fn dedup_languages(languages: &[LanguageChoice]) -> Vec<LanguageChoice> {
    let mut seen = Vec::new();
    let mut results = Vec::new();
    for lang in languages {
        let code = lang.code.to_lowercase();
        if code.is_empty() || seen.contains(&code) {
            continue;
        }
        seen.push(code.clone());
        results.push(LanguageChoice::new(code, lang.name.clone()));
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::models::{TranslationRequest, TranslationResult};
    use crate::ports::TranslationPort;
    use async_trait::async_trait;
    use tempfile::TempDir;

    // ==================== Test Doubles ====================

    /// Analyzer with a canned response.
    struct FixedAnalyzer {
        result: Option<LanguagePreference>,
        fail: bool,
    }

    #[async_trait]
    impl LanguagePreferenceAnalyzer for FixedAnalyzer {
        async fn analyze(&self, _text: &str) -> Result<Option<LanguagePreference>, ProviderError> {
            if self.fail {
                return Err(ProviderError::Other("analyzer down".to_string()));
            }
            Ok(self.result.clone())
        }
    }

    /// Translation port that echoes the source text per target.
    struct EchoPort;

    #[async_trait]
    impl TranslationPort for EchoPort {
        async fn translate(
            &self,
            request: &TranslationRequest,
        ) -> Result<Vec<TranslationResult>, ProviderError> {
            Ok(request
                .candidate_languages
                .iter()
                .map(|lang| TranslationResult {
                    lang: lang.clone(),
                    text: request.text.clone(),
                })
                .collect())
        }
    }

    fn engine_with(
        result: Option<LanguagePreference>,
        fail: bool,
    ) -> (EnrollmentEngine, Database, TempDir) {
        let temp_dir = TempDir::new().expect("temp dir");
        let db_path = temp_dir.path().join("enrollment.db");
        let db = Database::new(db_path.to_str().unwrap()).expect("db");
        let engine = EnrollmentEngine::new(
            db.clone(),
            Arc::new(FixedAnalyzer { result, fail }),
            InterfaceTranslator::new(Arc::new(EchoPort)),
            PayloadCodec::new(280),
            5,
        );
        (engine, db, temp_dir)
    }

    fn preference(supported: &[(&str, &str)], unsupported: &[(&str, &str)]) -> LanguagePreference {
        LanguagePreference {
            primary_language: "en".to_string(),
            supported: supported
                .iter()
                .map(|(c, n)| LanguageChoice::new(*c, *n))
                .collect(),
            unsupported: unsupported
                .iter()
                .map(|(c, n)| LanguageChoice::new(*c, *n))
                .collect(),
            confirm_label: "OK".to_string(),
            cancel_label: "Cancel".to_string(),
        }
    }

    fn confirm_reply(bundle: &ReplyBundle) -> Option<(&str, &str)> {
        bundle.replies.iter().find_map(|r| match r {
            Reply::Confirm {
                confirm_data,
                cancel_data,
                ..
            } => Some((confirm_data.as_str(), cancel_data.as_str())),
            _ => None,
        })
    }

    // ==================== Propose Tests ====================

    #[tokio::test]
    async fn test_propose_analyzer_failure_sends_fallback() {
        let (engine, _db, _tmp) = engine_with(None, true);
        let bundle = engine
            .propose("G1", "japanese and thai please")
            .await
            .expect("propose")
            .expect("bundle");

        assert_eq!(bundle.first_text(), Some(reply::LANGUAGE_ANALYSIS_FALLBACK));
    }

    #[tokio::test]
    async fn test_propose_empty_analysis_sends_fallback() {
        let (engine, _db, _tmp) = engine_with(None, false);
        let bundle = engine
            .propose("G1", "random chatter")
            .await
            .expect("propose")
            .expect("bundle");

        assert_eq!(bundle.first_text(), Some(reply::LANGUAGE_ANALYSIS_FALLBACK));
    }

    #[tokio::test]
    async fn test_propose_renders_confirmation_with_tokens() {
        let pref = preference(&[("ja", "Japanese"), ("th", "Thai")], &[]);
        let (engine, db, _tmp) = engine_with(Some(pref), false);

        let bundle = engine
            .propose("G1", "japanese and thai")
            .await
            .expect("propose")
            .expect("bundle");

        let (confirm_data, cancel_data) = confirm_reply(&bundle).expect("confirm template");

        let codec = PayloadCodec::new(280);
        let confirm = codec.decode(confirm_data).expect("confirm token decodes");
        assert_eq!(
            confirm.languages,
            vec![
                LanguageChoice::new("ja", "Japanese"),
                LanguageChoice::new("th", "Thai")
            ]
        );
        assert!(codec.decode(cancel_data).is_some());

        // Translation stays off until the user resolves the prompt
        assert!(!db.is_translation_enabled("G1").expect("enabled"));
    }

    #[tokio::test]
    async fn test_propose_refuses_when_detected_count_exceeds_max() {
        let pref = preference(
            &[
                ("ja", "Japanese"),
                ("th", "Thai"),
                ("ko", "Korean"),
                ("es", "Spanish"),
            ],
            &[("tlh", "Klingon"), ("xx", "Mystery")],
        );
        let (engine, db, _tmp) = engine_with(Some(pref), false);

        let bundle = engine
            .propose("G1", "six languages")
            .await
            .expect("propose")
            .expect("bundle");

        assert!(confirm_reply(&bundle).is_none(), "never prompt on an unsatisfiable set");
        assert!(bundle.first_text().unwrap().contains("up to 5"));
        assert!(!db.is_translation_enabled("G1").expect("enabled"));
    }

    #[tokio::test]
    async fn test_propose_refuses_when_supported_alone_exceeds_max() {
        let pref = preference(
            &[
                ("ja", "Japanese"),
                ("th", "Thai"),
                ("ko", "Korean"),
                ("es", "Spanish"),
                ("fr", "French"),
                ("de", "German"),
            ],
            &[],
        );
        let (engine, db, _tmp) = engine_with(Some(pref), false);

        let bundle = engine
            .propose("G1", "many languages")
            .await
            .expect("propose")
            .expect("bundle");

        assert!(confirm_reply(&bundle).is_none());
        assert!(bundle.first_text().unwrap().contains("up to 5"));
        assert!(!db.is_translation_enabled("G1").expect("enabled"));
    }

    #[tokio::test]
    async fn test_propose_unsupported_only_reports_without_prompt() {
        let pref = preference(&[], &[("tlh", "Klingon")]);
        let (engine, _db, _tmp) = engine_with(Some(pref), false);

        let bundle = engine
            .propose("G1", "klingon please")
            .await
            .expect("propose")
            .expect("bundle");

        assert!(confirm_reply(&bundle).is_none());
        assert!(bundle.first_text().unwrap().contains("not supported"));
    }

    #[tokio::test]
    async fn test_propose_dedups_supported_languages() {
        let pref = preference(&[("ja", "Japanese"), ("JA", "Japanese"), ("th", "Thai")], &[]);
        let (engine, _db, _tmp) = engine_with(Some(pref), false);

        let bundle = engine
            .propose("G1", "japanese twice")
            .await
            .expect("propose")
            .expect("bundle");

        let (confirm_data, _) = confirm_reply(&bundle).expect("confirm");
        let confirm = PayloadCodec::new(280).decode(confirm_data).expect("decode");
        assert_eq!(confirm.languages.len(), 2);
    }

    // ==================== Confirm Tests ====================

    #[tokio::test]
    async fn test_confirm_persists_and_enables() {
        let (engine, db, _tmp) = engine_with(None, false);
        db.record_prompt("G1").expect("prompt");

        let payload = EnrollmentPayload::confirm(
            vec![
                LanguageChoice::new("ja", "Japanese"),
                LanguageChoice::new("en", "English"),
            ],
            "ja",
            "All set.",
            "limit",
        );
        let bundle = engine
            .confirm("G1", &payload)
            .await
            .expect("confirm")
            .expect("bundle");

        assert!(bundle.first_text().unwrap().starts_with("All set."));
        assert_eq!(db.fetch_languages("G1").expect("langs"), vec!["en", "ja"]);
        assert!(db.is_translation_enabled("G1").expect("enabled"));
    }

    #[tokio::test]
    async fn test_confirm_duplicate_returns_nothing() {
        let (engine, db, _tmp) = engine_with(None, false);
        db.record_prompt("G1").expect("prompt");

        let payload = EnrollmentPayload::confirm(
            vec![LanguageChoice::new("ja", "Japanese")],
            "ja",
            "All set.",
            "limit",
        );
        assert!(engine
            .confirm("G1", &payload)
            .await
            .expect("first")
            .is_some());
        assert!(engine
            .confirm("G1", &payload)
            .await
            .expect("second")
            .is_none());

        assert_eq!(db.fetch_languages("G1").expect("langs"), vec!["ja"]);
    }

    #[tokio::test]
    async fn test_confirm_revalidates_stale_token_cap() {
        let (engine, db, _tmp) = engine_with(None, false);
        db.record_prompt("G1").expect("prompt");

        let payload = EnrollmentPayload::confirm(
            vec![
                LanguageChoice::new("ja", "Japanese"),
                LanguageChoice::new("th", "Thai"),
                LanguageChoice::new("ko", "Korean"),
                LanguageChoice::new("es", "Spanish"),
                LanguageChoice::new("fr", "French"),
                LanguageChoice::new("de", "German"),
            ],
            "en",
            "All set.",
            "Too many languages requested.",
        );
        let bundle = engine
            .confirm("G1", &payload)
            .await
            .expect("confirm")
            .expect("bundle");

        assert_eq!(bundle.first_text(), Some("Too many languages requested."));
        assert!(db.fetch_languages("G1").expect("langs").is_empty());
        // The gate is still open: a corrected confirm can succeed
        assert!(db
            .try_complete("G1", &[LanguageChoice::new("ja", "Japanese")])
            .expect("complete"));
    }

    #[tokio::test]
    async fn test_confirm_completion_includes_translations() {
        let (engine, db, _tmp) = engine_with(None, false);
        db.record_prompt("G1").expect("prompt");

        // EchoPort returns the same text per target, so the multilingual
        // completion dedups down to a single line
        let payload = EnrollmentPayload::confirm(
            vec![
                LanguageChoice::new("ja", "Japanese"),
                LanguageChoice::new("en", "English"),
            ],
            "ja",
            "All set.",
            "limit",
        );
        let bundle = engine
            .confirm("G1", &payload)
            .await
            .expect("confirm")
            .expect("bundle");

        assert_eq!(bundle.first_text(), Some("All set."));
    }

    // ==================== Cancel Tests ====================

    #[tokio::test]
    async fn test_cancel_disables_and_replies() {
        let (engine, db, _tmp) = engine_with(None, false);
        db.record_prompt("G1").expect("prompt");

        let payload = EnrollmentPayload::cancel("ja", "Cancelled. Tell me again.");
        let bundle = engine
            .cancel("G1", &payload)
            .await
            .expect("cancel")
            .expect("bundle");

        assert_eq!(bundle.first_text(), Some("Cancelled. Tell me again."));
        assert!(!db.is_translation_enabled("G1").expect("enabled"));
    }

    #[tokio::test]
    async fn test_cancel_duplicate_returns_nothing() {
        let (engine, db, _tmp) = engine_with(None, false);
        db.record_prompt("G1").expect("prompt");

        let payload = EnrollmentPayload::cancel("ja", "Cancelled.");
        assert!(engine.cancel("G1", &payload).await.expect("first").is_some());
        assert!(engine
            .cancel("G1", &payload)
            .await
            .expect("second")
            .is_none());
    }

    #[tokio::test]
    async fn test_cancel_without_text_uses_default() {
        let (engine, db, _tmp) = engine_with(None, false);
        db.record_prompt("G1").expect("prompt");

        let mut payload = EnrollmentPayload::cancel("ja", "x");
        payload.cancel_text = None;
        let bundle = engine
            .cancel("G1", &payload)
            .await
            .expect("cancel")
            .expect("bundle");

        assert_eq!(bundle.first_text(), Some(reply::build_cancel_message().as_str()));
    }
}
