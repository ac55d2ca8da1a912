//! Who is online, since when, and in which session.
//!
//! The realtime gateway is the only writer. The matcher, the sweeper and the
//! online-users route read.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use heartlink_shared::errors::AppResult;
use uuid::Uuid;

use crate::models::PresenceRecord;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryPresence;
pub use self::redis::RedisPresence;

#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn mark_online(&self, user_id: Uuid, session_id: Option<Uuid>, now: DateTime<Utc>) -> AppResult<()>;

    /// Refresh `last_seen` of an online user. No-op for unknown or offline users.
    async fn touch(&self, user_id: Uuid, now: DateTime<Utc>) -> AppResult<()>;

    async fn mark_offline(&self, user_id: Uuid, now: DateTime<Utc>) -> AppResult<()>;

    async fn get(&self, user_id: Uuid) -> AppResult<Option<PresenceRecord>>;

    async fn get_many(&self, user_ids: &[Uuid]) -> AppResult<HashMap<Uuid, PresenceRecord>>;

    /// Users marked online whose `last_seen` is at or after `since`.
    async fn online_users(&self, since: DateTime<Utc>) -> AppResult<Vec<Uuid>>;

    async fn ping(&self) -> AppResult<()>;
}
