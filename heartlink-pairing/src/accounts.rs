//! Account standing, as reported by the account directory service.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use heartlink_shared::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Inactive,
    Suspended,
}

#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// The subset of `user_ids` that must not take part in pairing.
    async fn disallowed(&self, user_ids: &[Uuid]) -> AppResult<HashSet<Uuid>>;
}

#[derive(Serialize)]
struct StatusQuery<'a> {
    user_ids: &'a [Uuid],
}

#[derive(Deserialize)]
struct StatusEntry {
    user_id: Uuid,
    status: AccountStatus,
}

/// Batch lookup against `POST {base}/internal/accounts/status`.
///
/// Fails closed: an account missing from the answer is treated as disallowed,
/// and an unreachable directory is reported as `ServiceUnavailable`.
pub struct HttpAccountDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAccountDirectory {
    pub fn new(base_url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl AccountDirectory for HttpAccountDirectory {
    async fn disallowed(&self, user_ids: &[Uuid]) -> AppResult<HashSet<Uuid>> {
        if user_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let url = format!("{}/internal/accounts/status", self.base_url);
        let entries: Vec<StatusEntry> = self
            .client
            .post(&url)
            .json(&StatusQuery { user_ids })
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| {
                tracing::warn!(error = %e, "account directory unreachable");
                AppError::unavailable("account directory is unavailable")
            })?
            .json()
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "account directory returned an unreadable body");
                AppError::unavailable("account directory is unavailable")
            })?;

        let statuses: HashMap<Uuid, AccountStatus> =
            entries.into_iter().map(|e| (e.user_id, e.status)).collect();
        Ok(user_ids
            .iter()
            .filter(|id| statuses.get(id) != Some(&AccountStatus::Active))
            .copied()
            .collect())
    }
}

/// Fixed answer, for deployments without a directory and for tests.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    blocked: HashSet<Uuid>,
}

impl StaticDirectory {
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn blocking(blocked: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            blocked: blocked.into_iter().collect(),
        }
    }
}

#[async_trait]
impl AccountDirectory for StaticDirectory {
    async fn disallowed(&self, user_ids: &[Uuid]) -> AppResult<HashSet<Uuid>> {
        Ok(user_ids
            .iter()
            .filter(|id| self.blocked.contains(id))
            .copied()
            .collect())
    }
}
