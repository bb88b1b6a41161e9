//! Bucket lifecycle rules.
//!
//! Rules are evaluated by the storage service, not by this process. The
//! manager declares the full rule set once at startup and only patches the
//! bucket when its stored rules differ from that set in any field, including
//! rule kinds and conditions this crate does not model.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::client::ObjectStoreClient;
use crate::error::StorageResult;

/// One backend-enforced rule, in the Cloud Storage JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleRule {
    pub action: RuleAction,
    pub condition: RuleCondition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RuleAction {
    Delete,
    SetStorageClass {
        #[serde(rename = "storageClass")]
        storage_class: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleCondition {
    /// Object age in days
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matches_prefix: Vec<String>,
}

impl LifecycleRule {
    pub fn delete_after(days: u32, prefix: impl Into<String>) -> Self {
        Self {
            action: RuleAction::Delete,
            condition: RuleCondition {
                age: Some(days),
                matches_prefix: vec![prefix.into()],
            },
        }
    }

    pub fn transition_after(
        days: u32,
        prefix: impl Into<String>,
        storage_class: impl Into<String>,
    ) -> Self {
        Self {
            action: RuleAction::SetStorageClass {
                storage_class: storage_class.into(),
            },
            condition: RuleCondition {
                age: Some(days),
                matches_prefix: vec![prefix.into()],
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOutcome {
    Applied,
    Unchanged,
}

/// Retention policy for the billing bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecyclePolicyManager {
    pub archive_prefix: String,
    pub archive_days: u32,
    pub readings_prefix: String,
    pub readings_days: u32,
    pub bills_prefix: String,
    pub bills_days: u32,
    pub cold_storage_class: String,
}

impl Default for LifecyclePolicyManager {
    fn default() -> Self {
        Self {
            archive_prefix: "zip/".into(),
            archive_days: 1,
            readings_prefix: "readings/".into(),
            readings_days: 365,
            bills_prefix: "bills/".into(),
            bills_days: 365,
            cold_storage_class: "ARCHIVE".into(),
        }
    }
}

impl LifecyclePolicyManager {
    pub fn rules(&self) -> Vec<LifecycleRule> {
        vec![
            LifecycleRule::delete_after(self.archive_days, &self.archive_prefix),
            LifecycleRule::delete_after(self.readings_days, &self.readings_prefix),
            LifecycleRule::transition_after(
                self.bills_days,
                &self.bills_prefix,
                &self.cold_storage_class,
            ),
        ]
    }

    pub async fn apply(
        &self,
        client: &ObjectStoreClient,
        bucket: &str,
    ) -> StorageResult<LifecycleOutcome> {
        let rules = self.rules();
        let current = client.lifecycle_policy(bucket).await?;
        if is_current(&current, &rules)? {
            info!(bucket = %bucket, "Lifecycle rules already up to date");
            return Ok(LifecycleOutcome::Unchanged);
        }

        client.set_lifecycle_policy(bucket, &rules).await?;
        info!(bucket = %bucket, rules = rules.len(), "Lifecycle rules set");
        Ok(LifecycleOutcome::Applied)
    }
}

/// Whether the stored rules are exactly `rules`, compared as JSON.
pub fn is_current(stored: &Value, rules: &[LifecycleRule]) -> StorageResult<bool> {
    Ok(*stored == serde_json::to_value(rules)?)
}
