use crate::db::Database;
use crate::error::{FlowError, ProviderError};
use crate::gateway::TranslationGateway;
use crate::ledger::{Decision, PlanTier, UsageLedger};
use crate::models::MessageEvent;
use crate::reply;
use crate::retry::{with_retry_if, RetryConfig};
use chrono::{DateTime, Utc};
use tracing::{error, warn};

/// Result of one translation-flow run. When `decision.allowed` is false the
/// caller composes the notice; `reply_text` is `None` both then and when
/// the provider returned nothing to say.
#[derive(Debug)]
pub struct FlowOutcome {
    pub decision: Decision,
    pub reply_text: Option<String>,
}

/// Quota evaluation, bounded context fetch, translation through the retry
/// policy, and reply composition — with compensation: a failed or empty
/// attempt decrements the exact increment its evaluation applied. Quota
/// must reflect only messages that produced a visible translation.
#[derive(Clone)]
pub struct TranslationFlow {
    db: Database,
    ledger: UsageLedger,
    gateway: TranslationGateway,
    retry: RetryConfig,
    max_context: usize,
}

impl TranslationFlow {
    pub fn new(
        db: Database,
        ledger: UsageLedger,
        gateway: TranslationGateway,
        retry: RetryConfig,
        max_context: usize,
    ) -> Self {
        Self {
            db,
            ledger,
            gateway,
            retry,
            max_context,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        event: &MessageEvent,
        sender_name: &str,
        candidate_languages: &[String],
        paid: bool,
        limit: i64,
        plan: PlanTier,
        period_start: Option<DateTime<Utc>>,
        period_end: Option<DateTime<Utc>>,
    ) -> Result<FlowOutcome, FlowError> {
        let tenant_id = event.tenant_id.as_deref().unwrap_or_default();

        let decision = self
            .ledger
            .evaluate(tenant_id, paid, limit, period_start, period_end, plan, 1)
            .map_err(FlowError::Storage)?;

        if !decision.allowed {
            return Ok(FlowOutcome {
                decision,
                reply_text: None,
            });
        }

        match self
            .translate_with_retry(tenant_id, event, sender_name, candidate_languages)
            .await
        {
            Ok(translations) if translations.is_empty() => {
                warn!(
                    "Translation returned no candidates | tenant={} languages={:?} plan={}",
                    tenant_id,
                    candidate_languages,
                    decision.plan.key()
                );
                self.rollback_quota(tenant_id, &decision);
                Ok(FlowOutcome {
                    decision,
                    reply_text: None,
                })
            }
            Ok(translations) => Ok(FlowOutcome {
                reply_text: Some(reply::build_translation_reply(&event.text, &translations)),
                decision,
            }),
            Err(e) => {
                self.rollback_quota(tenant_id, &decision);
                Err(e)
            }
        }
    }

    async fn translate_with_retry(
        &self,
        tenant_id: &str,
        event: &MessageEvent,
        sender_name: &str,
        candidate_languages: &[String],
    ) -> Result<Vec<crate::models::TranslationResult>, FlowError> {
        if candidate_languages.is_empty() {
            return Ok(Vec::new());
        }

        let context = self
            .db
            .fetch_recent_messages(tenant_id, self.max_context)
            .map_err(FlowError::Storage)?;
        let timestamp = event.timestamp();

        let results = with_retry_if(
            &self.retry,
            "translation",
            || {
                self.gateway.translate(
                    sender_name,
                    &event.text,
                    timestamp,
                    context.clone(),
                    candidate_languages,
                )
            },
            |e: &ProviderError| !e.is_terminal(),
        )
        .await
        .map_err(FlowError::Provider)?;
        Ok(results)
    }

    fn rollback_quota(&self, tenant_id: &str, decision: &Decision) {
        if let Err(e) = self.ledger.rollback(tenant_id, decision) {
            error!("Usage rollback failed for {}: {:#}", tenant_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ScriptDetector;
    use crate::models::{ChatScope, TranslationRequest, TranslationResult};
    use crate::ports::TranslationPort;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    // ==================== Test Doubles ====================

    enum PortBehavior {
        Succeed,
        Empty,
        Fail,
        RateLimit,
    }

    struct ScriptedPort {
        behavior: PortBehavior,
        calls: AtomicU32,
    }

    impl ScriptedPort {
        fn new(behavior: PortBehavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl TranslationPort for ScriptedPort {
        async fn translate(
            &self,
            request: &TranslationRequest,
        ) -> Result<Vec<TranslationResult>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                PortBehavior::Succeed => Ok(request
                    .candidate_languages
                    .iter()
                    .map(|lang| TranslationResult {
                        lang: lang.clone(),
                        text: format!("[{}] {}", lang, request.text),
                    })
                    .collect()),
                PortBehavior::Empty => Ok(Vec::new()),
                PortBehavior::Fail => Err(ProviderError::Other("boom".to_string())),
                PortBehavior::RateLimit => Err(ProviderError::RateLimited),
            }
        }
    }

    struct Harness {
        flow: TranslationFlow,
        db: Database,
        port: Arc<ScriptedPort>,
        _tmp: TempDir,
    }

    fn harness(behavior: PortBehavior) -> Harness {
        let tmp = TempDir::new().expect("temp dir");
        let db_path = tmp.path().join("flow.db");
        let db = Database::new(db_path.to_str().unwrap()).expect("db");
        let port = ScriptedPort::new(behavior);
        let flow = TranslationFlow::new(
            db.clone(),
            UsageLedger::new(db.clone()),
            TranslationGateway::new(port.clone(), Arc::new(ScriptDetector)),
            RetryConfig::new(2, Duration::from_millis(1)),
            5,
        );
        Harness {
            flow,
            db,
            port,
            _tmp: tmp,
        }
    }

    fn event(text: &str) -> MessageEvent {
        MessageEvent {
            scope: ChatScope::Group,
            tenant_id: Some("G1".to_string()),
            user_id: Some("U1".to_string()),
            sender_name: Some("Alice".to_string()),
            text: text.to_string(),
            timestamp_ms: 1_700_000_000_000,
            command: None,
        }
    }

    fn langs(codes: &[&str]) -> Vec<String> {
        codes.iter().map(|c| c.to_string()).collect()
    }

    async fn run(h: &Harness, candidates: &[String]) -> Result<FlowOutcome, FlowError> {
        h.flow
            .run(
                &event("hello"),
                "Alice",
                candidates,
                true,
                5,
                PlanTier::Pro,
                Some(Utc::now()),
                None,
            )
            .await
    }

    fn usage(h: &Harness) -> i64 {
        let key = crate::ledger::period_key_for(true, Some(Utc::now()), None, Utc::now());
        h.db.get_usage("G1", &key).expect("usage")
    }

    // ==================== Success Path ====================

    #[tokio::test]
    async fn test_successful_translation_charges_one() {
        let h = harness(PortBehavior::Succeed);

        let outcome = run(&h, &langs(&["ja", "th"])).await.expect("run");

        assert!(outcome.decision.allowed);
        let text = outcome.reply_text.expect("reply");
        assert!(text.contains("[ja] hello"));
        assert!(text.contains("[th] hello"));
        assert_eq!(usage(&h), 1);
    }

    // ==================== Rollback Paths ====================

    #[tokio::test]
    async fn test_provider_failure_rolls_back_and_propagates() {
        let h = harness(PortBehavior::Fail);

        let result = run(&h, &langs(&["ja"])).await;

        assert!(matches!(
            result,
            Err(FlowError::Provider(ProviderError::Other(_)))
        ));
        assert_eq!(usage(&h), 0, "a failed attempt must not be charged");
        // Transient errors burn every attempt before surfacing
        assert_eq!(h.port.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_result_rolls_back_without_raising() {
        let h = harness(PortBehavior::Empty);

        let outcome = run(&h, &langs(&["ja"])).await.expect("run");

        assert!(outcome.decision.allowed);
        assert!(outcome.reply_text.is_none());
        assert_eq!(usage(&h), 0, "a degenerate attempt must not be charged");
    }

    #[tokio::test]
    async fn test_all_candidates_equal_source_rolls_back() {
        let h = harness(PortBehavior::Succeed);

        // Japanese message, Japanese-only targets: the gateway filters
        // everything and the provider is never called
        let outcome = h
            .flow
            .run(
                &event("こんにちは、元気ですか"),
                "Alice",
                &langs(&["ja"]),
                true,
                5,
                PlanTier::Pro,
                Some(Utc::now()),
                None,
            )
            .await
            .expect("run");

        assert!(outcome.reply_text.is_none());
        assert_eq!(h.port.calls.load(Ordering::SeqCst), 0);
        assert_eq!(usage(&h), 0);
    }

    #[tokio::test]
    async fn test_rate_limit_is_terminal_and_rolled_back() {
        let h = harness(PortBehavior::RateLimit);

        let result = run(&h, &langs(&["ja"])).await;

        assert!(matches!(
            result,
            Err(FlowError::Provider(ProviderError::RateLimited))
        ));
        assert_eq!(
            h.port.calls.load(Ordering::SeqCst),
            1,
            "rate limits are never retried"
        );
        assert_eq!(usage(&h), 0);
    }

    // ==================== Quota Refusal Paths ====================

    #[tokio::test]
    async fn test_refusal_skips_provider_entirely() {
        let h = harness(PortBehavior::Succeed);
        let key = crate::ledger::period_key_for(true, Some(Utc::now()), None, Utc::now());
        h.db.increment_usage("G1", &key, 5).expect("seed");

        let outcome = run(&h, &langs(&["ja"])).await.expect("run");

        assert!(!outcome.decision.allowed);
        assert!(outcome.reply_text.is_none());
        assert_eq!(h.port.calls.load(Ordering::SeqCst), 0);
        assert_eq!(usage(&h), 5, "refusals do not touch the counter");
    }

    #[tokio::test]
    async fn test_threshold_message_is_translated_and_flagged() {
        let h = harness(PortBehavior::Succeed);
        let key = crate::ledger::period_key_for(true, Some(Utc::now()), None, Utc::now());
        h.db.increment_usage("G1", &key, 4).expect("seed");

        let outcome = run(&h, &langs(&["ja"])).await.expect("run");

        assert!(outcome.decision.allowed);
        assert!(outcome.decision.should_notify);
        assert!(outcome.reply_text.is_some());
        assert_eq!(usage(&h), 5);
    }

    #[tokio::test]
    async fn test_empty_candidates_roll_back_without_provider_call() {
        let h = harness(PortBehavior::Succeed);

        let outcome = run(&h, &[]).await.expect("run");

        assert!(outcome.reply_text.is_none());
        assert_eq!(h.port.calls.load(Ordering::SeqCst), 0);
        assert_eq!(usage(&h), 0);
    }
}
