//! Durable storage for the usage ledger.

mod file;

pub use file::FileStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::quota::UsageRecord;

/// Backend holding a serialized copy of the usage ledger across process
/// restarts.
///
/// Implementations replace the stored sequence wholesale on every save;
/// an append log is acceptable provided read-back yields the same
/// records.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Load every stored record. A store that has never been written
    /// returns an empty list, not an error.
    async fn load(&self) -> Result<Vec<UsageRecord>>;

    /// Replace the stored records with the given snapshot.
    async fn save(&self, records: &[UsageRecord]) -> Result<()>;
}
