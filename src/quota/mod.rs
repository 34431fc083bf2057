//! Quota enforcement logic and state management.

mod engine;
mod ledger;
mod rules;

pub use engine::{QuotaEngine, RemainingQuota, DEFAULT_COMPACTION_INTERVAL, UNLIMITED};
pub use ledger::{UsageLedger, UsageRecord};
pub use rules::{Period, QuotaConfiguration, QuotaRule};
