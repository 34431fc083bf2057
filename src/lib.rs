//! Tollgate - Per-Identity Usage Quota Enforcement
//!
//! This crate implements the quota enforcer that gates every paid API
//! call made by a chat-platform command relay. Usage is tracked per
//! end-user identity, per logical command, and globally, over rolling
//! time windows, with optional cross-restart durability and a bypass
//! for privileged identities. The embedding dispatch layer calls
//! [`quota::QuotaEngine::can_proceed`] before the external call and
//! [`quota::QuotaEngine::record`] after it succeeds.

pub mod clock;
pub mod config;
pub mod error;
pub mod quota;
pub mod store;
