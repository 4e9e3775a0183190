use crate::db::Database;
use anyhow::Result;
use chrono::{DateTime, Datelike, Duration, Utc};

/// Billing tier a usage decision was made under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanTier {
    Free,
    Pro,
}

impl PlanTier {
    pub fn key(self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Pro => "pro",
        }
    }

    pub fn for_paid(paid: bool) -> Self {
        if paid {
            PlanTier::Pro
        } else {
            PlanTier::Free
        }
    }
}

/// Outcome of a quota evaluation.
///
/// `allowed` gates the translation; `should_notify` asks the caller to send
/// the limit notice (and stamp the notified-plan marker); `stop_translation`
/// asks the caller to flip the tenant's enabled flag off (free tier only).
#[derive(Debug, Clone)]
pub struct Decision {
    pub allowed: bool,
    pub should_notify: bool,
    pub stop_translation: bool,
    pub usage: i64,
    pub limit: i64,
    pub period_key: String,
    pub plan: PlanTier,
    /// Increment applied by this evaluation; what a rollback must undo.
    pub(crate) applied: i64,
}

/// Accounting window key for a tenant.
///
/// Paid tenants anchor on the billing-period start (falling back to
/// `period_end - 31 days`); unpaid tenants anchor on the first day of the
/// calendar month. A plan change therefore starts a fresh counter under its
/// own anchor.
pub fn period_key_for(
    paid: bool,
    period_start: Option<DateTime<Utc>>,
    period_end: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> String {
    if paid {
        let anchor = period_start.or_else(|| period_end.map(|end| end - Duration::days(31)));
        if let Some(anchor) = anchor {
            return anchor.date_naive().format("%Y-%m-%d").to_string();
        }
    }
    format!("{:04}-{:02}-01", now.year(), now.month())
}

/// Stateless quota decision function over the usage-counter store.
#[derive(Clone)]
pub struct UsageLedger {
    db: Database,
}

impl UsageLedger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Decide whether a message may be translated, incrementing the
    /// period's counter when it may.
    ///
    /// The threshold-crossing message (usage lands exactly on the limit) is
    /// both allowed and flagged for notification: the user gets the
    /// translation and the limit notice together.
    #[allow(clippy::too_many_arguments)]
    pub fn evaluate(
        &self,
        tenant_id: &str,
        paid: bool,
        limit: i64,
        period_start: Option<DateTime<Utc>>,
        period_end: Option<DateTime<Utc>>,
        plan: PlanTier,
        increment: i64,
    ) -> Result<Decision> {
        let period_key = period_key_for(paid, period_start, period_end, Utc::now());
        let already_notified =
            self.db.notified_plan(tenant_id, &period_key)?.as_deref() == Some(plan.key());
        let usage = self.db.get_usage(tenant_id, &period_key)?;

        // Free tier already announced this period: refuse silently, no
        // counter churn on every further message.
        if !paid && already_notified {
            return Ok(Decision {
                allowed: false,
                should_notify: false,
                stop_translation: false,
                usage,
                limit,
                period_key,
                plan,
                applied: 0,
            });
        }

        if usage >= limit {
            return Ok(Decision {
                allowed: false,
                should_notify: !already_notified,
                stop_translation: !paid,
                usage,
                limit,
                period_key,
                plan,
                applied: 0,
            });
        }

        let usage_after = self.db.increment_usage(tenant_id, &period_key, increment)?;

        if usage_after > limit {
            return Ok(Decision {
                allowed: false,
                should_notify: !already_notified,
                stop_translation: !paid,
                usage: usage_after,
                limit,
                period_key,
                plan,
                applied: 0,
            });
        }

        Ok(Decision {
            allowed: true,
            should_notify: usage_after == limit && !already_notified,
            stop_translation: false,
            usage: usage_after,
            limit,
            period_key,
            plan,
            applied: increment,
        })
    }

    /// Undo the increment a decision applied. Quota must reflect only
    /// messages that produced a visible translation.
    pub fn rollback(&self, tenant_id: &str, decision: &Decision) -> Result<()> {
        if decision.applied != 0 {
            self.db
                .increment_usage(tenant_id, &decision.period_key, -decision.applied)?;
        }
        Ok(())
    }
}
