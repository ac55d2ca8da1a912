use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use heartlink_shared::clients::redis::RedisClient;
use heartlink_shared::errors::{AppError, AppResult};
use uuid::Uuid;

use crate::models::{PresenceRecord, PresenceStatus};

use super::PresenceStore;

const RECORD_PREFIX: &str = "presence";
/// Sorted set of online users scored by last-seen (unix millis).
const ONLINE_SET: &str = "presence:online";

fn record_key(user_id: &Uuid) -> String {
    format!("{RECORD_PREFIX}:{user_id}")
}

fn unavailable(e: redis::RedisError) -> AppError {
    tracing::error!(error = %e, "presence store error");
    AppError::unavailable("presence store is unavailable")
}

/// Presence shared by every process through Redis. Records carry no TTL:
/// a record left online by a crashed writer ages out through `last_seen`.
#[derive(Clone)]
pub struct RedisPresence {
    redis: RedisClient,
}

impl RedisPresence {
    pub fn new(redis: RedisClient) -> Self {
        Self { redis }
    }

    async fn write(&self, record: &PresenceRecord) -> AppResult<()> {
        let data = serde_json::to_string(record).map_err(|e| AppError::Internal(e.into()))?;
        let member = record.user_id.to_string();
        self.redis
            .set_persistent(&record_key(&record.user_id), &data)
            .await
            .map_err(unavailable)?;
        match record.status {
            PresenceStatus::Online => self
                .redis
                .zadd(ONLINE_SET, &member, record.last_seen.timestamp_millis() as f64)
                .await
                .map_err(unavailable),
            PresenceStatus::Offline => self.redis.zrem(ONLINE_SET, &member).await.map_err(unavailable),
        }
    }
}

#[async_trait]
impl PresenceStore for RedisPresence {
    async fn mark_online(&self, user_id: Uuid, session_id: Option<Uuid>, now: DateTime<Utc>) -> AppResult<()> {
        self.write(&PresenceRecord {
            user_id,
            status: PresenceStatus::Online,
            last_seen: now,
            session_id,
        })
        .await
    }

    async fn touch(&self, user_id: Uuid, now: DateTime<Utc>) -> AppResult<()> {
        match self.get(user_id).await? {
            Some(mut record) if record.status == PresenceStatus::Online => {
                record.last_seen = now;
                self.write(&record).await
            }
            _ => Ok(()),
        }
    }

    async fn mark_offline(&self, user_id: Uuid, now: DateTime<Utc>) -> AppResult<()> {
        self.write(&PresenceRecord {
            user_id,
            status: PresenceStatus::Offline,
            last_seen: now,
            session_id: None,
        })
        .await
    }

    async fn get(&self, user_id: Uuid) -> AppResult<Option<PresenceRecord>> {
        let data = self.redis.get(&record_key(&user_id)).await.map_err(unavailable)?;
        Ok(data.and_then(|d| serde_json::from_str(&d).ok()))
    }

    async fn get_many(&self, user_ids: &[Uuid]) -> AppResult<HashMap<Uuid, PresenceRecord>> {
        let keys: Vec<String> = user_ids.iter().map(record_key).collect();
        let values = self.redis.mget(&keys).await.map_err(unavailable)?;
        Ok(values
            .into_iter()
            .flatten()
            .filter_map(|data| serde_json::from_str::<PresenceRecord>(&data).ok())
            .map(|record| (record.user_id, record))
            .collect())
    }

    async fn online_users(&self, since: DateTime<Utc>) -> AppResult<Vec<Uuid>> {
        let members = self
            .redis
            .zrangebyscore_from(ONLINE_SET, since.timestamp_millis() as f64)
            .await
            .map_err(unavailable)?;
        Ok(members.iter().filter_map(|m| m.parse().ok()).collect())
    }

    async fn ping(&self) -> AppResult<()> {
        self.redis.ping().await.map_err(unavailable)
    }
}
