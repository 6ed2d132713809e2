use async_trait::async_trait;
use reqwest::{RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{EntitlementStore, UserEntitlement};
use crate::error::StoreError;

// Entitlements kept in a PostgREST table, `identity` is the unique column
pub struct RestEntitlementStore {
    client: reqwest::Client,
    table_url: String,
    api_key: String,
}

// Row shape sent on insert
#[derive(Serialize)]
struct NewRow<'a> {
    identity: i64,
    subscription_active: bool,
    trial_credits_remaining: u32,
    billing_reference: &'a str,
}

#[derive(Serialize)]
struct CreditPatch {
    trial_credits_remaining: u32,
}

#[derive(Deserialize)]
struct Row {
    identity: i64,
    #[serde(default)]
    subscription_active: bool,
    trial_credits_remaining: i64,
    #[serde(default)]
    billing_reference: Option<String>,
}

impl From<Row> for UserEntitlement {
    fn from(row: Row) -> Self {
        Self {
            identity: row.identity,
            subscription_active: row.subscription_active,
            // a negative column value is treated as no credits
            trial_credits_remaining: u32::try_from(row.trial_credits_remaining).unwrap_or(0),
            billing_reference: row
                .billing_reference
                .unwrap_or_else(|| super::DEFAULT_BILLING_REFERENCE.to_string()),
        }
    }
}

impl RestEntitlementStore {
    // base_url like "https://xyz.supabase.co", table like "users"
    pub fn new(client: reqwest::Client, base_url: &str, table: &str, api_key: String) -> Self {
        Self {
            client,
            table_url: format!("{}/rest/v1/{}", base_url.trim_end_matches('/'), table),
            api_key,
        }
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    async fn rows(response: Response) -> Result<Vec<Row>, StoreError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Status {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<Vec<Row>>()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))
    }

    // Conditional PATCH; an empty result array means the filter matched nothing
    async fn swap_credits(
        &self,
        identity: i64,
        expected: u32,
        next: u32,
    ) -> Result<Option<UserEntitlement>, StoreError> {
        let response = self
            .authed(self.client.patch(format!(
                "{}?identity=eq.{}&trial_credits_remaining=eq.{}",
                self.table_url, identity, expected
            )))
            .header("Prefer", "return=representation")
            .json(&CreditPatch {
                trial_credits_remaining: next,
            })
            .send()
            .await?;

        Ok(Self::rows(response).await?.into_iter().next().map(Into::into))
    }

    async fn fetch(&self, identity: i64) -> Result<Option<UserEntitlement>, StoreError> {
        let response = self
            .authed(
                self.client
                    .get(format!("{}?identity=eq.{}&select=*", self.table_url, identity)),
            )
            .send()
            .await?;

        Ok(Self::rows(response).await?.into_iter().next().map(Into::into))
    }
}

#[async_trait]
impl EntitlementStore for RestEntitlementStore {
    async fn upsert(&self, identity: i64) -> Result<UserEntitlement, StoreError> {
        let defaults = UserEntitlement::new(identity);
        let row = NewRow {
            identity,
            subscription_active: defaults.subscription_active,
            trial_credits_remaining: defaults.trial_credits_remaining,
            billing_reference: &defaults.billing_reference,
        };

        // ignore-duplicates keeps an existing row untouched
        let response = self
            .authed(self.client.post(format!("{}?on_conflict=identity", self.table_url)))
            .header("Prefer", "resolution=ignore-duplicates,return=representation")
            .json(&[row])
            .send()
            .await?;

        if let Some(created) = Self::rows(response).await?.into_iter().next() {
            debug!(identity, "Created entitlement record");
            return Ok(created.into());
        }

        self.fetch(identity)
            .await?
            .ok_or_else(|| StoreError::Decode(format!("record {} missing after upsert", identity)))
    }

    async fn compare_and_decrement(
        &self,
        identity: i64,
        expected: u32,
    ) -> Result<Option<UserEntitlement>, StoreError> {
        if expected == 0 {
            return Ok(None);
        }
        self.swap_credits(identity, expected, expected - 1).await
    }

    async fn compare_and_increment(
        &self,
        identity: i64,
        expected: u32,
    ) -> Result<Option<UserEntitlement>, StoreError> {
        self.swap_credits(identity, expected, expected.saturating_add(1))
            .await
    }
}
