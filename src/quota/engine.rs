//! The quota engine: admission decisions and usage accounting.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::TollgateConfig;
use crate::error::Result;
use crate::store::{FileStore, UsageStore};

use super::ledger::{UsageLedger, UsageRecord};
use super::rules::{Period, QuotaConfiguration, QuotaRule};

/// Sentinel reported by [`QuotaEngine::remaining_quota`] for unlimited
/// tiers.
pub const UNLIMITED: i64 = -1;

/// Suggested interval for [`QuotaEngine::run_compaction`].
pub const DEFAULT_COMPACTION_INTERVAL: std::time::Duration =
    std::time::Duration::from_secs(3600);

/// Remaining quota for an identity, one value per tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemainingQuota {
    /// Remaining actions under the scope's own rule, or [`UNLIMITED`].
    /// May go negative if usage overshot the limit through the
    /// check-then-act race; callers clamp for display.
    pub scope_remaining: i64,
    /// Remaining actions under the global rule, or [`UNLIMITED`].
    pub global_remaining: i64,
}

impl RemainingQuota {
    /// Both tiers unlimited.
    pub const fn unlimited() -> Self {
        Self {
            scope_remaining: UNLIMITED,
            global_remaining: UNLIMITED,
        }
    }
}

/// Per-identity, multi-tier quota enforcer.
///
/// Composes the validated rules, the usage ledger, a clock, and an
/// optional durable store. Callers ask [`can_proceed`] before performing
/// the paid external action and [`record`] after it succeeds; the two
/// are deliberately not one atomic transaction (serializing them would
/// block concurrent users on I/O-bound external calls), so an identity
/// can transiently overshoot its limit by the number of in-flight calls.
///
/// [`can_proceed`]: QuotaEngine::can_proceed
/// [`record`]: QuotaEngine::record
pub struct QuotaEngine {
    /// Validated quota rules, immutable for the engine's lifetime.
    config: QuotaConfiguration,
    /// Identities exempt from every rule and from ledger accounting.
    privileged: HashSet<String>,
    /// The usage ledger, exclusively owned by this engine.
    ledger: UsageLedger,
    /// Time source for window computations.
    clock: Arc<dyn Clock>,
    /// Durable store, when cross-restart durability is enabled.
    store: Option<Arc<dyn UsageStore>>,
}

impl QuotaEngine {
    /// Create an engine with no durable store.
    pub fn new(
        config: QuotaConfiguration,
        privileged: HashSet<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            privileged,
            ledger: UsageLedger::new(),
            clock,
            store: None,
        }
    }

    /// Create an engine backed by a durable store, hydrating the ledger
    /// from it.
    ///
    /// A failed load logs a warning and starts with an empty ledger; it
    /// never aborts startup.
    pub async fn open(
        config: QuotaConfiguration,
        privileged: HashSet<String>,
        clock: Arc<dyn Clock>,
        store: Arc<dyn UsageStore>,
    ) -> Self {
        let ledger = match store.load().await {
            Ok(records) => {
                info!(count = records.len(), "Loaded usage ledger from store");
                UsageLedger::from_records(records)
            }
            Err(e) => {
                warn!(error = %e, "Failed to load usage ledger, starting empty");
                UsageLedger::new()
            }
        };

        Self {
            config,
            privileged,
            ledger,
            clock,
            store: Some(store),
        }
    }

    /// Build an engine from parsed settings.
    ///
    /// Invalid limits are fatal here; everything downstream sees only
    /// validated rules. When persistence is enabled the ledger is
    /// hydrated from the configured file.
    pub async fn from_config(config: &TollgateConfig) -> Result<Self> {
        let rules = config.quotas.build()?;
        let privileged = config.privileged_set();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        if config.persistence.enabled {
            let store: Arc<dyn UsageStore> = Arc::new(FileStore::new(&config.persistence.path));
            Ok(Self::open(rules, privileged, clock, store).await)
        } else {
            Ok(Self::new(rules, privileged, clock))
        }
    }

    /// Decide whether `identity` may perform an action in `scope` now.
    ///
    /// Pure read; nothing is consumed until [`record`] is called. Any
    /// internal fault while evaluating fails open: denying legitimate
    /// actions on an engine bug is worse than under-enforcing a quota
    /// once.
    ///
    /// [`record`]: QuotaEngine::record
    pub fn can_proceed(&self, identity: &str, scope: &str) -> bool {
        if self.privileged.contains(identity) {
            trace!(identity, scope, "Privileged identity bypasses quota checks");
            return true;
        }

        let now = self.clock.now();
        match self.evaluate(identity, scope, now) {
            Ok(allowed) => allowed,
            Err(e) => {
                warn!(
                    error = %e,
                    identity,
                    scope,
                    "Quota evaluation failed, allowing action"
                );
                true
            }
        }
    }

    /// Evaluate the per-scope rule, then the global rule.
    ///
    /// The scope rule runs first so a scope-capped denial never touches
    /// the global window and deny logs name the tier that fired.
    fn evaluate(&self, identity: &str, scope: &str, now: DateTime<Utc>) -> Result<bool> {
        if let Some(rule) = self.config.scope_rule(scope) {
            let since = rule.period.window_start(now)?;
            let count = self.ledger.count_scoped(identity, scope, since);
            if count >= rule.limit as usize {
                debug!(
                    identity,
                    scope,
                    count,
                    limit = rule.limit,
                    "Scope quota exhausted"
                );
                return Ok(false);
            }
        }

        if let Some(rule) = self.config.global_rule() {
            let since = rule.period.window_start(now)?;
            let count = self.ledger.count_identity(identity, since);
            if count >= rule.limit as usize {
                debug!(
                    identity,
                    scope,
                    count,
                    limit = rule.limit,
                    "Global quota exhausted"
                );
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Record that `identity` completed an action in `scope`.
    ///
    /// Privileged identities are never written to the ledger. When
    /// durability is enabled the full ledger snapshot is persisted in the
    /// background; a failed save is logged and the in-memory record
    /// stands regardless.
    pub fn record(&self, identity: &str, scope: &str) {
        if self.privileged.contains(identity) {
            trace!(identity, scope, "Privileged identity usage is not recorded");
            return;
        }

        self.ledger.append(UsageRecord {
            identity: identity.to_string(),
            scope: scope.to_string(),
            occurred_at: self.clock.now(),
        });
        self.persist_in_background();
    }

    /// Remaining quota for `identity` in `scope`, per tier.
    ///
    /// Privileged identities report both tiers unlimited.
    pub fn remaining_quota(&self, identity: &str, scope: &str) -> RemainingQuota {
        if self.privileged.contains(identity) {
            return RemainingQuota::unlimited();
        }

        let now = self.clock.now();
        RemainingQuota {
            scope_remaining: self.remaining_for(self.config.scope_rule(scope), now, |since| {
                self.ledger.count_scoped(identity, scope, since)
            }),
            global_remaining: self.remaining_for(self.config.global_rule(), now, |since| {
                self.ledger.count_identity(identity, since)
            }),
        }
    }

    fn remaining_for(
        &self,
        rule: Option<&QuotaRule>,
        now: DateTime<Utc>,
        count: impl Fn(DateTime<Utc>) -> usize,
    ) -> i64 {
        let Some(rule) = rule else {
            return UNLIMITED;
        };
        match rule.period.window_start(now) {
            Ok(since) => rule.limit as i64 - count(since) as i64,
            Err(e) => {
                warn!(error = %e, "Quota evaluation failed, reporting unlimited");
                UNLIMITED
            }
        }
    }

    /// The configured rule for `scope`, or `None` if the scope has no
    /// cap of its own. For caller-side display.
    pub fn scope_limit(&self, scope: &str) -> Option<&QuotaRule> {
        self.config.scope_rule(scope)
    }

    /// The configured global rule, or `None` if globally unlimited. For
    /// caller-side display.
    pub fn global_limit(&self) -> Option<&QuotaRule> {
        self.config.global_rule()
    }

    /// Drop every record older than the longest configured window (the
    /// monthly one), returning how many were removed.
    pub fn compact(&self) -> usize {
        let now = self.clock.now();
        let cutoff = match Period::Monthly.window_start(now) {
            Ok(cutoff) => cutoff,
            Err(e) => {
                warn!(error = %e, "Skipping compaction");
                return 0;
            }
        };

        let removed = self.ledger.retain_newer_than(cutoff);
        if removed > 0 {
            debug!(
                removed,
                remaining = self.ledger.len(),
                "Compacted usage ledger"
            );
        }
        removed
    }

    /// Run retention compaction on a fixed interval.
    ///
    /// The only autonomous background activity in the engine. The
    /// compacted ledger is persisted when durability is enabled and the
    /// sweep actually removed records.
    pub fn run_compaction(
        self: Arc<Self>,
        every: std::time::Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; consume it so the
            // sweep runs on the interval, not at spawn.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if self.compact() > 0 {
                    if let Err(e) = self.persist().await {
                        error!(error = %e, "Failed to persist compacted ledger");
                    }
                }
            }
        })
    }

    /// Persist the current ledger snapshot, awaiting completion.
    ///
    /// No-op without a store. Useful at shutdown; the per-record path
    /// persists in the background instead.
    pub async fn persist(&self) -> Result<()> {
        if let Some(store) = &self.store {
            store.save(&self.ledger.snapshot()).await?;
        }
        Ok(())
    }

    fn persist_in_background(&self) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let snapshot = self.ledger.snapshot();
        tokio::spawn(async move {
            if let Err(e) = store.save(&snapshot).await {
                error!(error = %e, "Failed to persist usage ledger");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::FileStore;
    use chrono::{Duration, TimeZone};
    use std::collections::HashMap;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap()
    }

    /// Global 2/daily, "search" 1/daily — the relay's reference config.
    fn relay_config() -> QuotaConfiguration {
        let mut per_scope = HashMap::new();
        per_scope.insert(
            "search".to_string(),
            QuotaRule {
                limit: 1,
                period: Period::Daily,
            },
        );
        QuotaConfiguration::new(
            Some(QuotaRule {
                limit: 2,
                period: Period::Daily,
            }),
            per_scope,
        )
    }

    fn engine_with(
        config: QuotaConfiguration,
        privileged: &[&str],
    ) -> (QuotaEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(base_time()));
        let engine = QuotaEngine::new(
            config,
            privileged.iter().map(|s| s.to_string()).collect(),
            clock.clone(),
        );
        (engine, clock)
    }

    #[test]
    fn test_scope_then_global_caps() {
        let (engine, _clock) = engine_with(relay_config(), &[]);

        assert!(engine.can_proceed("u1", "search"));
        engine.record("u1", "search");
        // Scope cap of 1 hit.
        assert!(!engine.can_proceed("u1", "search"));

        // "summarize" has no cap of its own; global still has room.
        assert!(engine.can_proceed("u1", "summarize"));
        engine.record("u1", "summarize");
        // Global cap of 2 hit.
        assert!(!engine.can_proceed("u1", "summarize"));
    }

    #[test]
    fn test_identities_are_independent() {
        let (engine, _clock) = engine_with(relay_config(), &[]);

        engine.record("u1", "search");
        assert!(!engine.can_proceed("u1", "search"));
        assert!(engine.can_proceed("u2", "search"));
    }

    #[test]
    fn test_blocked_until_window_expiry() {
        let mut per_scope = HashMap::new();
        per_scope.insert(
            "search".to_string(),
            QuotaRule {
                limit: 2,
                period: Period::Hourly,
            },
        );
        let (engine, clock) = engine_with(QuotaConfiguration::new(None, per_scope), &[]);

        engine.record("u1", "search");
        clock.advance(Duration::minutes(30));
        engine.record("u1", "search");
        assert!(!engine.can_proceed("u1", "search"));

        // 31 more minutes age the first record out of the hourly window.
        clock.advance(Duration::minutes(31));
        assert!(engine.can_proceed("u1", "search"));
    }

    #[test]
    fn test_privileged_identity_bypasses_and_is_never_recorded() {
        let (engine, _clock) = engine_with(relay_config(), &["ADMIN"]);

        for _ in 0..100 {
            assert!(engine.can_proceed("ADMIN", "search"));
            engine.record("ADMIN", "search");
        }

        assert_eq!(engine.remaining_quota("ADMIN", "search"), RemainingQuota::unlimited());
        // ADMIN's traffic never counted toward anyone's window.
        let remaining = engine.remaining_quota("u1", "search");
        assert_eq!(remaining.scope_remaining, 1);
        assert_eq!(remaining.global_remaining, 2);
    }

    #[test]
    fn test_unlimited_tier_reports_sentinel() {
        let (engine, _clock) = engine_with(QuotaConfiguration::unlimited(), &[]);

        engine.record("u1", "search");
        engine.record("u1", "search");

        let remaining = engine.remaining_quota("u1", "search");
        assert_eq!(remaining.scope_remaining, UNLIMITED);
        assert_eq!(remaining.global_remaining, UNLIMITED);
        assert!(engine.can_proceed("u1", "search"));
    }

    #[test]
    fn test_remaining_goes_negative_on_overshoot() {
        let (engine, _clock) = engine_with(relay_config(), &[]);

        // Three in-flight calls all passed can_proceed before any record:
        // the ledger overshoots and remaining reports the raw value.
        engine.record("u1", "search");
        engine.record("u1", "search");
        engine.record("u1", "search");

        let remaining = engine.remaining_quota("u1", "search");
        assert_eq!(remaining.scope_remaining, -2);
        assert_eq!(remaining.global_remaining, -1);
    }

    #[test]
    fn test_zero_limit_denies_everything() {
        let (engine, _clock) = engine_with(
            QuotaConfiguration::new(
                Some(QuotaRule {
                    limit: 0,
                    period: Period::Daily,
                }),
                HashMap::new(),
            ),
            &[],
        );

        assert!(!engine.can_proceed("u1", "search"));
        assert_eq!(engine.remaining_quota("u1", "search").global_remaining, 0);
    }

    #[test]
    fn test_limit_accessors() {
        let (engine, _clock) = engine_with(relay_config(), &[]);

        assert_eq!(engine.scope_limit("search").unwrap().limit, 1);
        assert!(engine.scope_limit("summarize").is_none());
        assert_eq!(engine.global_limit().unwrap().limit, 2);

        let (unlimited, _clock) = engine_with(QuotaConfiguration::unlimited(), &[]);
        assert!(unlimited.global_limit().is_none());
    }

    #[test]
    fn test_compaction_keeps_monthly_window() {
        let mut per_scope = HashMap::new();
        per_scope.insert(
            "search".to_string(),
            QuotaRule {
                limit: 1,
                period: Period::Monthly,
            },
        );
        let (engine, clock) = engine_with(QuotaConfiguration::new(None, per_scope), &[]);

        engine.record("u1", "search");
        clock.advance(Duration::days(29));
        assert!(!engine.can_proceed("u1", "search"));

        // Record is 29 days old: compaction must not remove it or the
        // identity would unblock ahead of natural window expiry.
        assert_eq!(engine.compact(), 0);
        assert!(!engine.can_proceed("u1", "search"));

        clock.advance(Duration::days(2));
        assert_eq!(engine.compact(), 1);
        assert!(engine.can_proceed("u1", "search"));
    }

    #[tokio::test]
    async fn test_restart_round_trip_preserves_decisions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage_ledger.json");
        let clock = Arc::new(ManualClock::new(base_time()));
        let store: Arc<dyn UsageStore> = Arc::new(FileStore::new(&path));

        let engine = QuotaEngine::open(
            relay_config(),
            HashSet::new(),
            clock.clone(),
            store.clone(),
        )
        .await;
        engine.record("u1", "search");
        engine.persist().await.unwrap();
        assert!(!engine.can_proceed("u1", "search"));
        drop(engine);

        // Simulated restart: same store, same clock.
        let reopened = QuotaEngine::open(relay_config(), HashSet::new(), clock, store).await;
        assert!(!reopened.can_proceed("u1", "search"));
        assert!(reopened.can_proceed("u1", "summarize"));
        assert_eq!(reopened.remaining_quota("u1", "search").global_remaining, 1);
    }

    #[tokio::test]
    async fn test_from_config_wires_rules_and_privileged_set() {
        let yaml = r#"
quotas:
  global:
    limit: 1
    period: daily
privileged_identities: "ADMIN"
"#;
        let config: TollgateConfig = serde_yaml::from_str(yaml).unwrap();
        let engine = QuotaEngine::from_config(&config).await.unwrap();

        assert!(engine.can_proceed("u1", "search"));
        engine.record("u1", "search");
        assert!(!engine.can_proceed("u1", "summarize"));
        assert!(engine.can_proceed("ADMIN", "search"));
    }

    #[tokio::test]
    async fn test_from_config_rejects_invalid_limit() {
        let yaml = r#"
quotas:
  global:
    limit: -5
    period: daily
"#;
        let config: TollgateConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(QuotaEngine::from_config(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_open_with_unreadable_store_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage_ledger.json");
        tokio::fs::write(&path, "not json").await.unwrap();

        let clock = Arc::new(ManualClock::new(base_time()));
        let engine = QuotaEngine::open(
            relay_config(),
            HashSet::new(),
            clock,
            Arc::new(FileStore::new(&path)),
        )
        .await;

        assert!(engine.can_proceed("u1", "search"));
    }
}
