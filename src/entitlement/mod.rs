mod memory;
mod rest;

pub use memory::InMemoryEntitlementStore;
pub use rest::RestEntitlementStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::StoreError;

pub const DEFAULT_TRIAL_CREDITS: u32 = 5;
pub const DEFAULT_BILLING_REFERENCE: &str = "placeholder";

// Upper bound on conditional update retries for one charge or refund
const MAX_CHARGE_ATTEMPTS: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntitlement {
    pub identity: i64,
    pub subscription_active: bool,
    pub trial_credits_remaining: u32,
    pub billing_reference: String,
}

impl UserEntitlement {
    // Record created on first contact
    pub fn new(identity: i64) -> Self {
        Self {
            identity,
            subscription_active: false,
            trial_credits_remaining: DEFAULT_TRIAL_CREDITS,
            billing_reference: DEFAULT_BILLING_REFERENCE.to_string(),
        }
    }
}

// Persistent entitlement records keyed by identity.
// upsert creates the default record if absent and otherwise returns the stored
// one unchanged; it must be atomic at the storage layer. The conditional
// updates only apply while credits still equal `expected`, and Ok(None) means
// another writer won or the record does not exist.
#[async_trait]
pub trait EntitlementStore: Send + Sync {
    async fn upsert(&self, identity: i64) -> Result<UserEntitlement, StoreError>;

    async fn compare_and_decrement(
        &self,
        identity: i64,
        expected: u32,
    ) -> Result<Option<UserEntitlement>, StoreError>;

    async fn compare_and_increment(
        &self,
        identity: i64,
        expected: u32,
    ) -> Result<Option<UserEntitlement>, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeOutcome {
    Charged { remaining: u32 },
    Exhausted,
}

// Fetch-or-create and charge entitlements, each store call bounded by a timeout
#[derive(Clone)]
pub struct EntitlementResolver {
    store: Arc<dyn EntitlementStore>,
    timeout: Duration,
}

impl EntitlementResolver {
    pub fn new(store: Arc<dyn EntitlementStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub async fn resolve(&self, identity: i64) -> Result<UserEntitlement, StoreError> {
        self.bounded(self.store.upsert(identity)).await
    }

    // Takes one credit from a record `resolve` returned. Lost races re-read and retry.
    pub async fn charge(&self, read: &UserEntitlement) -> Result<ChargeOutcome, StoreError> {
        let identity = read.identity;
        let mut expected = read.trial_credits_remaining;

        for attempt in 1..=MAX_CHARGE_ATTEMPTS {
            if expected == 0 {
                return Ok(ChargeOutcome::Exhausted);
            }

            let updated = self
                .bounded(self.store.compare_and_decrement(identity, expected))
                .await?;

            match updated {
                Some(record) => {
                    debug!(
                        identity,
                        remaining = record.trial_credits_remaining,
                        "Charged one trial credit"
                    );
                    return Ok(ChargeOutcome::Charged {
                        remaining: record.trial_credits_remaining,
                    });
                }
                None => {
                    debug!(identity, attempt, expected, "Credit update conflicted, re-reading");
                    expected = self.resolve(identity).await?.trial_credits_remaining;
                }
            }
        }

        warn!(identity, "Charge retries exhausted");
        Err(StoreError::Contention {
            identity,
            attempts: MAX_CHARGE_ATTEMPTS,
        })
    }

    // Give one credit back, returns the new balance
    pub async fn refund(&self, identity: i64) -> Result<u32, StoreError> {
        for attempt in 1..=MAX_CHARGE_ATTEMPTS {
            let expected = self.resolve(identity).await?.trial_credits_remaining;
            let updated = self
                .bounded(self.store.compare_and_increment(identity, expected))
                .await?;

            if let Some(record) = updated {
                debug!(
                    identity,
                    remaining = record.trial_credits_remaining,
                    "Refunded one trial credit"
                );
                return Ok(record.trial_credits_remaining);
            }
            debug!(identity, attempt, "Refund conflicted, re-reading");
        }

        warn!(identity, "Refund retries exhausted");
        Err(StoreError::Contention {
            identity,
            attempts: MAX_CHARGE_ATTEMPTS,
        })
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
    }
}
