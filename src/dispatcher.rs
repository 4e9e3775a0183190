use crate::config::Config;
use crate::db::Database;
use crate::enrollment::EnrollmentEngine;
use crate::error::FlowError;
use crate::flow::TranslationFlow;
use crate::gateway::{InterfaceTranslator, TranslationGateway};
use crate::ledger::{period_key_for, PlanTier, UsageLedger};
use crate::models::{
    ActionEvent, ChatScope, CommandDecision, JoinEvent, LanguageChoice, LanguageOperation,
    MessageEvent, Reply, ReplyBundle, StoredMessage, SubscriptionStatus,
};
use crate::payload::{PayloadAction, PayloadCodec, KIND_LANGUAGE_CONFIRM};
use crate::ports::{
    CommandRouter, LanguageDetector, LanguagePreferenceAnalyzer, SubscriptionPort, TranslationPort,
};
use crate::reply;
use crate::retry::RetryConfig;
use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Control-flow root: one call per inbound event, reply bundles out.
///
/// The caller owns platform delivery; this type owns the decision of what
/// (if anything) to say. One logical worker per event, no in-process
/// scheduling — all cross-event coordination goes through the datastore.
pub struct Dispatcher {
    db: Database,
    flow: TranslationFlow,
    enrollment: EnrollmentEngine,
    commands: Arc<dyn CommandRouter>,
    subscription: Arc<dyn SubscriptionPort>,
    interface: InterfaceTranslator,
    codec: PayloadCodec,
    free_limit: i64,
    pro_limit: i64,
    max_languages: usize,
    /// Last rate-limit notice per tenant. Owned state, deliberately not a
    /// process-global: concurrent workers each suppress their own repeats.
    rate_limit_notices: Mutex<HashMap<String, String>>,
}

impl Dispatcher {
    pub fn new(
        config: &Config,
        db: Database,
        translator: Arc<dyn TranslationPort>,
        analyzer: Arc<dyn LanguagePreferenceAnalyzer>,
        commands: Arc<dyn CommandRouter>,
        subscription: Arc<dyn SubscriptionPort>,
        detector: Arc<dyn LanguageDetector>,
    ) -> Self {
        let gateway = TranslationGateway::new(translator.clone(), detector);
        let interface = InterfaceTranslator::new(translator);
        let codec = PayloadCodec::new(config.payload_max_bytes);
        let ledger = UsageLedger::new(db.clone());
        let flow = TranslationFlow::new(
            db.clone(),
            ledger,
            gateway,
            RetryConfig::new(
                config.translation_retries,
                Duration::from_millis(config.retry_backoff_ms),
            ),
            config.max_context_messages,
        );
        let enrollment = EnrollmentEngine::new(
            db.clone(),
            analyzer,
            interface.clone(),
            codec.clone(),
            config.max_tenant_languages,
        );

        Self {
            db,
            flow,
            enrollment,
            commands,
            subscription,
            interface,
            codec,
            free_limit: config.free_plan_limit,
            pro_limit: config.pro_plan_limit,
            max_languages: config.max_tenant_languages,
            rate_limit_notices: Mutex::new(HashMap::new()),
        }
    }

    // ---- message events ----

    pub async fn handle_message(&self, event: &MessageEvent) -> Result<Option<ReplyBundle>> {
        // Direct chats get pointed at group usage
        if event.scope == ChatScope::Direct || event.tenant_id.is_none() {
            return Ok(Some(ReplyBundle::text(reply::DIRECT_GREETING)));
        }
        let tenant_id = event.tenant_id.clone().unwrap_or_default();
        let user_id = match &event.user_id {
            Some(user_id) => user_id.clone(),
            None => return Ok(None),
        };

        self.db.ensure_member(&tenant_id, &user_id)?;
        let sender_name = event.sender_name.clone().unwrap_or_else(|| user_id.clone());

        let result = self
            .process_group_message(event, &tenant_id, &sender_name)
            .await;

        // History feeds the next translation's context window; persistence
        // failures must not eat the reply
        let record = StoredMessage {
            tenant_id,
            user_id,
            sender_name,
            text: event.text.clone(),
            timestamp: event.timestamp(),
        };
        if let Err(e) = self.db.insert_message(&record) {
            error!("Failed to persist message: {:#}", e);
        }

        result
    }

    async fn process_group_message(
        &self,
        event: &MessageEvent,
        tenant_id: &str,
        sender_name: &str,
    ) -> Result<Option<ReplyBundle>> {
        if let Some(command_text) = &event.command {
            return self.handle_command(tenant_id, command_text).await;
        }
        self.handle_translation_flow(event, tenant_id, sender_name)
            .await
    }

    // ---- command events ----

    async fn handle_command(
        &self,
        tenant_id: &str,
        command_text: &str,
    ) -> Result<Option<ReplyBundle>> {
        let decision = match self.commands.decide(command_text).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!("Command routing failed: {}", e);
                return Ok(Some(ReplyBundle::text(reply::UNKNOWN_INSTRUCTION_MESSAGE)));
            }
        };

        match decision {
            CommandDecision::LanguageSettings {
                operation,
                ack_text,
                ..
            } => self.handle_language_settings(tenant_id, operation, &ack_text),
            CommandDecision::HowTo { .. } => Ok(Some(ReplyBundle::text(reply::HOWTO_MESSAGE))),
            CommandDecision::Pause { ack_text } => {
                self.db.set_translation_enabled(tenant_id, false)?;
                Ok(Some(ReplyBundle::text(ack_or(
                    &ack_text,
                    "I will pause the translation. Please mention me again when you want to resume.",
                ))))
            }
            CommandDecision::Resume { ack_text } => {
                self.db.set_translation_enabled(tenant_id, true)?;
                Ok(Some(ReplyBundle::text(ack_or(
                    &ack_text,
                    "I will resume the translation.",
                ))))
            }
            CommandDecision::Unknown { .. } => {
                Ok(Some(ReplyBundle::text(reply::UNKNOWN_INSTRUCTION_MESSAGE)))
            }
        }
    }

    fn handle_language_settings(
        &self,
        tenant_id: &str,
        operation: LanguageOperation,
        ack_text: &str,
    ) -> Result<Option<ReplyBundle>> {
        match operation {
            LanguageOperation::ResetAll => {
                self.db.reset_language_settings(tenant_id)?;
                self.db.set_translation_enabled(tenant_id, false)?;
                Ok(Some(ReplyBundle::text(reply::GROUP_PROMPT_MESSAGE)))
            }
            LanguageOperation::Add(add) => self.apply_language_mutation(tenant_id, add, Vec::new(), ack_text),
            LanguageOperation::Remove(remove) => {
                self.apply_language_mutation(tenant_id, Vec::new(), remove, ack_text)
            }
            LanguageOperation::AddAndRemove { add, remove } => {
                self.apply_language_mutation(tenant_id, add, remove, ack_text)
            }
        }
    }

    fn apply_language_mutation(
        &self,
        tenant_id: &str,
        add: Vec<LanguageChoice>,
        remove: Vec<String>,
        ack_text: &str,
    ) -> Result<Option<ReplyBundle>> {
        let existing = self.db.fetch_languages(tenant_id)?;
        let removed: Vec<String> = remove.iter().map(|c| c.to_lowercase()).collect();

        let mut resulting: Vec<String> = existing
            .iter()
            .filter(|code| !removed.contains(code))
            .cloned()
            .collect();
        let mut additions: Vec<LanguageChoice> = Vec::new();
        for lang in &add {
            let code = lang.code.to_lowercase();
            if code.is_empty() || resulting.contains(&code) {
                continue;
            }
            resulting.push(code.clone());
            additions.push(LanguageChoice::new(code, lang.name.clone()));
        }

        if resulting.len() > self.max_languages {
            return Ok(Some(ReplyBundle::text(reply::build_language_limit_message(
                self.max_languages,
            ))));
        }

        self.db.remove_languages(tenant_id, &removed)?;
        self.db.add_languages(tenant_id, &additions)?;
        info!(
            "Language settings updated for {}: now {:?}",
            tenant_id, resulting
        );
        Ok(Some(ReplyBundle::text(ack_or(ack_text, "Done."))))
    }

    // ---- translation flow ----

    async fn handle_translation_flow(
        &self,
        event: &MessageEvent,
        tenant_id: &str,
        sender_name: &str,
    ) -> Result<Option<ReplyBundle>> {
        let candidate_languages = self.candidate_languages(tenant_id)?;

        if candidate_languages.is_empty() {
            info!(
                "Tenant {} has no language preferences yet; attempting enrollment",
                tenant_id
            );
            return self.enrollment.propose(tenant_id, &event.text).await;
        }

        // Fail open: a broken settings read must not mute the group
        let enabled = match self.db.is_translation_enabled(tenant_id) {
            Ok(enabled) => enabled,
            Err(e) => {
                warn!("Translation-enabled lookup failed, failing open: {:#}", e);
                true
            }
        };
        if !enabled {
            return Ok(Some(self.pause_notice(tenant_id).await?));
        }

        let status = self.subscription_status(tenant_id);
        let paid = status.active;
        let limit = if paid { self.pro_limit } else { self.free_limit };
        let plan = PlanTier::for_paid(paid);

        let outcome = match self
            .flow
            .run(
                event,
                sender_name,
                &candidate_languages,
                paid,
                limit,
                plan,
                status.period_start,
                status.period_end,
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(e) if e.is_rate_limited() => {
                warn!("Translation provider rate limited; notifying tenant");
                return Ok(self.rate_limit_notice(tenant_id));
            }
            Err(FlowError::Provider(e)) => {
                error!("Translation pipeline failed: {}", e);
                return Err(e.into());
            }
            Err(FlowError::Storage(e)) => return Err(e),
        };

        let decision = outcome.decision;
        let mut bundle = ReplyBundle::default();
        if let Some(text) = outcome.reply_text {
            bundle.push(Reply::Text(text));
        }

        if decision.allowed && decision.should_notify {
            // Threshold crossing: translation and limit notice together
            let notice = self.quota_notice(tenant_id, paid, decision.limit, true).await;
            bundle.push(Reply::Text(notice));
            self.db
                .set_notified_plan(tenant_id, &decision.period_key, decision.plan.key())?;
        } else if !decision.allowed {
            if decision.stop_translation {
                self.db.set_translation_enabled(tenant_id, false)?;
            }
            if decision.should_notify {
                let notice = self
                    .quota_notice(tenant_id, paid, decision.limit, false)
                    .await;
                bundle.push(Reply::Text(notice));
                self.db
                    .set_notified_plan(tenant_id, &decision.period_key, decision.plan.key())?;
            }
        }

        if bundle.is_empty() {
            Ok(None)
        } else {
            Ok(Some(bundle))
        }
    }

    // ---- action (postback) events ----

    /// Decode the opaque token and dispatch the enrollment resolution.
    /// Foreign or malformed tokens are silently ignored: they may belong
    /// to an unrelated feature.
    pub async fn handle_action(&self, event: &ActionEvent) -> Result<Option<ReplyBundle>> {
        let tenant_id = match &event.tenant_id {
            Some(tenant_id) => tenant_id,
            None => return Ok(None),
        };
        if event.data.is_empty() {
            return Ok(None);
        }

        let payload = match self.codec.decode(&event.data) {
            Some(payload) => payload,
            None => {
                debug!("Ignoring unrelated postback");
                return Ok(None);
            }
        };
        if payload.kind != KIND_LANGUAGE_CONFIRM {
            return Ok(None);
        }

        match payload.action {
            PayloadAction::Confirm => self.enrollment.confirm(tenant_id, &payload).await,
            PayloadAction::Cancel => self.enrollment.cancel(tenant_id, &payload).await,
        }
    }

    // ---- join events ----

    /// Re-invite semantics: reset languages, re-arm the gate, and ask for
    /// the language list again.
    pub async fn handle_join(&self, event: &JoinEvent) -> Result<ReplyBundle> {
        self.db
            .record_bot_joined_at(&event.tenant_id, event.timestamp())?;
        self.db.reset_language_settings(&event.tenant_id)?;
        self.db.set_translation_enabled(&event.tenant_id, false)?;
        info!("Bot joined tenant {}", event.tenant_id);
        Ok(ReplyBundle::text(reply::GROUP_PROMPT_MESSAGE))
    }

    // ---- helpers ----

    fn candidate_languages(&self, tenant_id: &str) -> Result<Vec<String>> {
        let mut candidates = Vec::new();
        for code in self.db.fetch_languages(tenant_id)? {
            if code.is_empty() || candidates.contains(&code) {
                continue;
            }
            if candidates.len() < self.max_languages {
                candidates.push(code);
            }
        }
        Ok(candidates)
    }

    fn subscription_status(&self, tenant_id: &str) -> SubscriptionStatus {
        match self.subscription.subscription(tenant_id) {
            Ok(status) => status,
            Err(e) => {
                // Degrade to the free tier rather than refusing service
                warn!("Subscription lookup failed for {}: {:#}", tenant_id, e);
                SubscriptionStatus::default()
            }
        }
    }

    async fn quota_notice(&self, tenant_id: &str, paid: bool, limit: i64, warning: bool) -> String {
        let base = if warning {
            reply::quota_warning_text(paid, limit)
        } else {
            reply::over_quota_text(paid, limit)
        };
        let url = if paid {
            None
        } else {
            self.subscription.checkout_url(tenant_id)
        };
        let localized = self.multilingual_notice(&base, tenant_id).await;
        reply::build_notice_with_link(&localized, url.as_deref(), !paid)
    }

    async fn pause_notice(&self, tenant_id: &str) -> Result<ReplyBundle> {
        let status = self.subscription_status(tenant_id);
        let paid = status.active;
        let limit = if paid { self.pro_limit } else { self.free_limit };
        let period_key = period_key_for(paid, status.period_start, status.period_end, Utc::now());
        let usage = self.db.get_usage(tenant_id, &period_key)?;

        let base = if usage >= limit {
            reply::over_quota_text(paid, limit)
        } else {
            reply::pause_notice_text(paid)
        };
        let url = if paid {
            None
        } else {
            self.subscription.checkout_url(tenant_id)
        };
        let localized = self.multilingual_notice(&base, tenant_id).await;
        Ok(ReplyBundle::text(reply::build_notice_with_link(
            &localized,
            url.as_deref(),
            !paid,
        )))
    }

    /// Best-effort rendering of a notice in the tenant's languages.
    async fn multilingual_notice(&self, base: &str, tenant_id: &str) -> String {
        let languages = self.db.fetch_languages(tenant_id).unwrap_or_default();
        let targets: Vec<String> = languages
            .into_iter()
            .filter(|code| !code.starts_with("en"))
            .collect();
        if targets.is_empty() {
            return base.to_string();
        }

        let translations = self.interface.translate_into(base, &targets).await;
        if translations.is_empty() {
            return base.to_string();
        }

        let mut lines = vec![base.trim().to_string()];
        for item in translations {
            let cleaned = reply::strip_source_echo(base, &item.text);
            let cleaned = cleaned.trim();
            if !cleaned.is_empty() && !lines.iter().any(|l| l == cleaned) {
                lines.push(cleaned.to_string());
            }
        }
        reply::truncate_reply(&lines.join("\n\n"))
    }

    fn rate_limit_notice(&self, tenant_id: &str) -> Option<ReplyBundle> {
        let mut cache = self.rate_limit_notices.lock().unwrap();
        if cache.get(tenant_id).map(String::as_str) == Some(reply::RATE_LIMIT_MESSAGE) {
            return None;
        }
        cache.insert(tenant_id.to_string(), reply::RATE_LIMIT_MESSAGE.to_string());
        Some(ReplyBundle::text(reply::RATE_LIMIT_MESSAGE))
    }
}

fn ack_or(ack_text: &str, default: &str) -> String {
    if ack_text.trim().is_empty() {
        default.to_string()
    } else {
        ack_text.to_string()
    }
}
