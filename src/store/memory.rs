use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{BypassRecord, BypassStore, StoreError};
use crate::directory::Domain;

/// Process-local bypass store.
///
/// Clones share the same map, so a test can keep a handle and inspect what
/// the controller wrote.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<RwLock<BTreeMap<Domain, BypassRecord>>>,
    blocking_enabled: Arc<RwLock<Option<bool>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl BypassStore for MemoryStore {
    async fn get(&self, domain: &Domain) -> Result<Option<BypassRecord>, StoreError> {
        Ok(self.records.read().get(domain).cloned())
    }

    async fn put(&self, domain: Domain, record: BypassRecord) -> Result<(), StoreError> {
        self.records.write().insert(domain, record);
        Ok(())
    }

    async fn delete(&self, domain: &Domain) -> Result<(), StoreError> {
        self.records.write().remove(domain);
        Ok(())
    }

    async fn all_entries(&self) -> Result<Vec<(Domain, BypassRecord)>, StoreError> {
        Ok(self
            .records
            .read()
            .iter()
            .map(|(d, r)| (d.clone(), r.clone()))
            .collect())
    }

    async fn blocking_enabled(&self) -> Result<Option<bool>, StoreError> {
        Ok(*self.blocking_enabled.read())
    }

    async fn set_blocking_enabled(&self, enabled: bool) -> Result<(), StoreError> {
        *self.blocking_enabled.write() = Some(enabled);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Timestamp;
    use crate::store::BypassKind;

    fn record(domain: &Domain) -> BypassRecord {
        BypassRecord {
            domain: domain.clone(),
            kind: BypassKind::Emergency,
            start_time: Timestamp::from_millis(1),
            end_time: None,
            duration_minutes: None,
            original_url: format!("https://{domain}"),
        }
    }

    #[tokio::test]
    async fn should_replace_record_on_second_put() {
        let store = MemoryStore::new();
        let domain: Domain = "reddit.com".parse().unwrap();

        store.put(domain.clone(), record(&domain)).await.unwrap();
        let mut updated = record(&domain);
        updated.original_url = "https://reddit.com/r/rust".to_string();
        store.put(domain.clone(), updated.clone()).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&domain).await.unwrap(), Some(updated));
    }

    #[tokio::test]
    async fn should_succeed_when_deleting_missing_record() {
        let store = MemoryStore::new();
        let domain: Domain = "reddit.com".parse().unwrap();

        store.delete(&domain).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn should_share_records_across_clones() {
        let store = MemoryStore::new();
        let handle = store.clone();
        let domain: Domain = "x.com".parse().unwrap();

        store.put(domain.clone(), record(&domain)).await.unwrap();

        let entries = handle.all_entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, domain);
    }

    #[tokio::test]
    async fn should_keep_blocking_switch_apart_from_records() {
        let store = MemoryStore::new();
        assert_eq!(store.blocking_enabled().await.unwrap(), None);

        store.set_blocking_enabled(false).await.unwrap();

        assert_eq!(store.clone().blocking_enabled().await.unwrap(), Some(false));
        assert!(store.is_empty());
    }
}
