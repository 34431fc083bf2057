//! Quota rules: rolling-window periods and validated limit configuration.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TollgateError};

/// Rolling-window period for a quota rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl Period {
    /// Get the duration of this period's rolling window.
    pub fn duration(&self) -> Duration {
        match self {
            Period::Hourly => Duration::hours(1),
            Period::Daily => Duration::hours(24),
            Period::Weekly => Duration::days(7),
            Period::Monthly => Duration::days(30),
        }
    }

    /// Compute the start of the window ending at `now`.
    ///
    /// Usage is counted over `[window_start, now)`.
    pub fn window_start(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        now.checked_sub_signed(self.duration()).ok_or_else(|| {
            TollgateError::Evaluation(format!(
                "window start underflow for {:?} period at {}",
                self, now
            ))
        })
    }
}

/// A hard cap on actions within one rolling window.
///
/// Unlimited tiers are not represented as rules; they are the absence of
/// one (see [`QuotaConfiguration`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaRule {
    /// Maximum actions allowed in the window. Zero is a valid cap and
    /// denies every action.
    pub limit: u32,
    /// Rolling window the limit applies over.
    pub period: Period,
}

/// The full set of quota rules the engine enforces.
///
/// One optional global rule (any scope counts against it) plus zero or
/// more per-scope rules. A scope absent from the map is capped only by
/// the global rule; `global: None` means no global cap either.
#[derive(Debug, Clone, Default)]
pub struct QuotaConfiguration {
    global: Option<QuotaRule>,
    per_scope: HashMap<String, QuotaRule>,
}

impl QuotaConfiguration {
    /// Create a configuration from already-validated rules.
    pub fn new(global: Option<QuotaRule>, per_scope: HashMap<String, QuotaRule>) -> Self {
        Self { global, per_scope }
    }

    /// A configuration with no caps at all.
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// The global rule, or `None` if globally unlimited.
    pub fn global_rule(&self) -> Option<&QuotaRule> {
        self.global.as_ref()
    }

    /// The rule for a specific scope, or `None` if the scope has no cap
    /// of its own.
    pub fn scope_rule(&self, scope: &str) -> Option<&QuotaRule> {
        self.per_scope.get(scope)
    }
}
