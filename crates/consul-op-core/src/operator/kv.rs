//! Key-value accessor.

use super::Operator;
use crate::{backend::KvPair, Error, Result};

impl Operator {
    /// Value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the key has never been written (or was deleted);
    /// an empty value is returned as an empty vector
    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.get_with_version(key).await.map(|(value, _)| value)
    }

    /// Value stored under `key` with its modify index.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the key has no entry
    pub async fn get_with_version(&self, key: &str) -> Result<(Vec<u8>, u64)> {
        self.lookup(key)
            .await?
            .map(|pair| (pair.value, pair.modify_index))
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    /// Full entry for `key`, `None` when absent.
    pub async fn lookup(&self, key: &str) -> Result<Option<KvPair>> {
        self.backend()?.kv_get(key).await
    }

    /// Unconditionally write `value` under `key`.
    pub async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.backend()?.kv_put(key, value).await?;
        tracing::debug!("Stored {} bytes under '{key}'", value.len());
        Ok(())
    }

    /// Delete `key`. Deleting an absent key succeeds.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.backend()?.kv_delete(key).await?;
        tracing::debug!("Deleted '{key}'");
        Ok(())
    }
}
