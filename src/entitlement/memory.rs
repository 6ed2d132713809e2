use async_trait::async_trait;
use dashmap::DashMap;

use super::{EntitlementStore, UserEntitlement};
use crate::error::StoreError;

// Process-local store, used when no store URL is configured
#[derive(Default)]
pub struct InMemoryEntitlementStore {
    records: DashMap<i64, UserEntitlement>,
}

impl InMemoryEntitlementStore {
    pub fn new() -> Self {
        Self::default()
    }

    // Seed or overwrite a record.
    pub fn insert(&self, record: UserEntitlement) {
        self.records.insert(record.identity, record);
    }

    pub fn get(&self, identity: i64) -> Option<UserEntitlement> {
        self.records.get(&identity).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl EntitlementStore for InMemoryEntitlementStore {
    async fn upsert(&self, identity: i64) -> Result<UserEntitlement, StoreError> {
        let record = self
            .records
            .entry(identity)
            .or_insert_with(|| UserEntitlement::new(identity));
        Ok(record.value().clone())
    }

    async fn compare_and_decrement(
        &self,
        identity: i64,
        expected: u32,
    ) -> Result<Option<UserEntitlement>, StoreError> {
        let Some(mut record) = self.records.get_mut(&identity) else {
            return Ok(None);
        };

        if expected == 0 || record.trial_credits_remaining != expected {
            return Ok(None);
        }
        record.trial_credits_remaining = expected - 1;
        Ok(Some(record.clone()))
    }

    async fn compare_and_increment(
        &self,
        identity: i64,
        expected: u32,
    ) -> Result<Option<UserEntitlement>, StoreError> {
        let Some(mut record) = self.records.get_mut(&identity) else {
            return Ok(None);
        };

        if record.trial_credits_remaining != expected {
            return Ok(None);
        }
        record.trial_credits_remaining = expected.saturating_add(1);
        Ok(Some(record.clone()))
    }
}
