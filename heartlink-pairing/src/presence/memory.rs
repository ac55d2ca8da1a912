use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use heartlink_shared::errors::AppResult;
use uuid::Uuid;

use crate::models::{PresenceRecord, PresenceStatus};

use super::PresenceStore;

/// Process-local presence, for single-node runs and tests.
#[derive(Default)]
pub struct MemoryPresence {
    records: DashMap<Uuid, PresenceRecord>,
}

impl MemoryPresence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PresenceStore for MemoryPresence {
    async fn mark_online(&self, user_id: Uuid, session_id: Option<Uuid>, now: DateTime<Utc>) -> AppResult<()> {
        self.records.insert(
            user_id,
            PresenceRecord {
                user_id,
                status: PresenceStatus::Online,
                last_seen: now,
                session_id,
            },
        );
        Ok(())
    }

    async fn touch(&self, user_id: Uuid, now: DateTime<Utc>) -> AppResult<()> {
        if let Some(mut record) = self.records.get_mut(&user_id) {
            if record.status == PresenceStatus::Online {
                record.last_seen = now;
            }
        }
        Ok(())
    }

    async fn mark_offline(&self, user_id: Uuid, now: DateTime<Utc>) -> AppResult<()> {
        self.records
            .entry(user_id)
            .and_modify(|record| {
                record.status = PresenceStatus::Offline;
                record.last_seen = now;
                record.session_id = None;
            })
            .or_insert(PresenceRecord {
                user_id,
                status: PresenceStatus::Offline,
                last_seen: now,
                session_id: None,
            });
        Ok(())
    }

    async fn get(&self, user_id: Uuid) -> AppResult<Option<PresenceRecord>> {
        Ok(self.records.get(&user_id).map(|r| r.clone()))
    }

    async fn get_many(&self, user_ids: &[Uuid]) -> AppResult<HashMap<Uuid, PresenceRecord>> {
        Ok(user_ids
            .iter()
            .filter_map(|id| self.records.get(id).map(|r| (*id, r.clone())))
            .collect())
    }

    async fn online_users(&self, since: DateTime<Utc>) -> AppResult<Vec<Uuid>> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.status == PresenceStatus::Online && r.last_seen >= since)
            .map(|r| r.user_id)
            .collect())
    }

    async fn ping(&self) -> AppResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn offline_keeps_last_seen() {
        let presence = MemoryPresence::new();
        let user = Uuid::new_v4();
        let t0 = Utc::now();
        presence.mark_online(user, None, t0).await.unwrap();
        let t1 = t0 + chrono::Duration::seconds(5);
        presence.mark_offline(user, t1).await.unwrap();

        let record = presence.get(user).await.unwrap().unwrap();
        assert_eq!(record.status, PresenceStatus::Offline);
        assert_eq!(record.last_seen, t1);
        assert!(presence.online_users(t0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn touch_does_not_revive_offline_users() {
        let presence = MemoryPresence::new();
        let user = Uuid::new_v4();
        let now = Utc::now();
        presence.mark_offline(user, now).await.unwrap();
        presence.touch(user, now + chrono::Duration::seconds(30)).await.unwrap();
        assert_eq!(presence.get(user).await.unwrap().unwrap().last_seen, now);
    }
}
