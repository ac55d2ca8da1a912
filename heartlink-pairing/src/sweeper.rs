use std::sync::Arc;

use chrono::{DateTime, Utc};
use heartlink_shared::errors::AppResult;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::config::AppConfig;
use crate::models::{end_reason, PresenceRecord, Session};
use crate::presence::PresenceStore;
use crate::sessions::SessionRegistry;
use crate::store::PairingStore;

#[derive(Debug, Clone, Copy)]
pub struct SweepSettings {
    pub interval: std::time::Duration,
    pub max_wait: chrono::Duration,
    pub waiting_session_ttl: chrono::Duration,
    pub offline_grace: chrono::Duration,
    pub presence_stale_after: chrono::Duration,
}

impl SweepSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            interval: config.sweep_interval(),
            max_wait: config.pairing_max_wait(),
            waiting_session_ttl: config.waiting_session_ttl(),
            offline_grace: config.offline_grace(),
            presence_stale_after: config.presence_stale_after(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired_requests: usize,
    pub closed_waiting: usize,
    pub ended_idle: usize,
}

/// Moves abandoned requests and sessions to their terminal states. Only ever
/// runs on its own timer.
pub struct Sweeper {
    store: Arc<dyn PairingStore>,
    presence: Arc<dyn PresenceStore>,
    sessions: SessionRegistry,
    settings: SweepSettings,
}

impl Sweeper {
    pub fn new(
        store: Arc<dyn PairingStore>,
        presence: Arc<dyn PresenceStore>,
        sessions: SessionRegistry,
        settings: SweepSettings,
    ) -> Self {
        Self {
            store,
            presence,
            sessions,
            settings,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval_secs = self.settings.interval.as_secs(), "sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep_once(Utc::now()).await {
                        Ok(report) if report != SweepReport::default() => {
                            tracing::info!(
                                expired_requests = report.expired_requests,
                                closed_waiting = report.closed_waiting,
                                ended_idle = report.ended_idle,
                                "sweep pass"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "sweep pass failed; retrying next tick"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("sweeper stopped");
    }

    pub async fn sweep_once(&self, now: DateTime<Utc>) -> AppResult<SweepReport> {
        let expired = self.store.expire_pending(now - self.settings.max_wait, now).await?;
        record("expired_request", expired.len());
        for request in &expired {
            tracing::debug!(request_id = %request.id, user_id = %request.requester_id, "pairing request expired");
        }

        let closed = self
            .store
            .close_waiting_sessions(now - self.settings.waiting_session_ttl, now)
            .await?;
        record("unmatched_session", closed.len());

        let ended_idle = self.end_idle_sessions(now).await?;
        record("idle_session", ended_idle);

        Ok(SweepReport {
            expired_requests: expired.len(),
            closed_waiting: closed.len(),
            ended_idle,
        })
    }

    async fn end_idle_sessions(&self, now: DateTime<Utc>) -> AppResult<usize> {
        let active = self.store.active_sessions().await?;
        if active.is_empty() {
            return Ok(0);
        }

        let users: Vec<_> = active.iter().flat_map(Session::participants).collect();
        let presence = self.presence.get_many(&users).await?;

        let mut ended = 0;
        for session in active {
            let idle = session
                .participants()
                .iter()
                .all(|user| self.gone_beyond_grace(&session, presence.get(user), now));
            if !idle {
                continue;
            }
            if self.sessions.end(session.id, end_reason::IDLE, now).await?.is_some() {
                ended += 1;
            }
        }
        Ok(ended)
    }

    /// Offline, or online but stale, for longer than the grace period. A user
    /// with no presence record is measured from when the session started.
    fn gone_beyond_grace(&self, session: &Session, record: Option<&PresenceRecord>, now: DateTime<Utc>) -> bool {
        let last_seen = match record {
            Some(r) if r.is_online(now, self.settings.presence_stale_after) => return false,
            Some(r) => r.last_seen,
            None => session.started_at.unwrap_or(session.created_at),
        };
        now - last_seen > self.settings.offline_grace
    }
}

fn record(kind: &'static str, count: usize) {
    if count > 0 {
        metrics::counter!("heartlink_sweeper_transitions_total", "kind" => kind).increment(count as u64);
    }
}
