use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::models::{PairingRequest, PresenceRecord};
use crate::store::ActivityStats;

/// Everything the ranking looks at for one candidate request.
#[derive(Debug, Clone)]
pub struct CandidateSignals {
    pub request: PairingRequest,
    pub presence: Option<PresenceRecord>,
    pub activity: ActivityStats,
}

#[derive(Debug, Clone)]
pub struct RankedCandidate {
    pub request: PairingRequest,
    pub score: f64,
}

// -- Weights --
// Heuristic. The only firm rule is that reachable, active candidates win.
const W_PRESENCE: f64 = 0.45;
const W_ACTIVITY: f64 = 0.25;
const W_COMPLETION: f64 = 0.20;
const W_JITTER: f64 = 0.10;

/// Messages in the activity window at which the activity score reaches ~63%.
const ACTIVITY_SCALE: f64 = 20.0;
/// Minutes after going offline at which the presence score has decayed by 1/e.
const PRESENCE_DECAY_MINS: f64 = 30.0;

/// Online (and fresh) → 1.0. Offline or stale decays from 0.6 with time since
/// last seen. Never seen → 0.
fn presence_score(now: DateTime<Utc>, presence: Option<&PresenceRecord>, stale_after: chrono::Duration) -> f64 {
    match presence {
        Some(record) if record.is_online(now, stale_after) => 1.0,
        Some(record) => {
            let mins = ((now - record.last_seen).num_seconds().max(0) as f64) / 60.0;
            0.6 * (-mins / PRESENCE_DECAY_MINS).exp()
        }
        None => 0.0,
    }
}

fn activity_score(stats: &ActivityStats) -> f64 {
    1.0 - (-(stats.recent_messages as f64) / ACTIVITY_SCALE).exp()
}

/// Share of past requests that ended matched. Newcomers get a neutral 0.5.
fn completion_score(stats: &ActivityStats) -> f64 {
    if stats.completed == 0 {
        return 0.5;
    }
    (stats.matched as f64 / stats.completed as f64).clamp(0.0, 1.0)
}

pub fn calculate_score<R: Rng>(
    now: DateTime<Utc>,
    signals: &CandidateSignals,
    stale_after: chrono::Duration,
    rng: &mut R,
) -> f64 {
    W_PRESENCE * presence_score(now, signals.presence.as_ref(), stale_after)
        + W_ACTIVITY * activity_score(&signals.activity)
        + W_COMPLETION * completion_score(&signals.activity)
        + W_JITTER * rng.gen::<f64>()
}

/// Best candidate first. Equal scores fall back to the longest-waiting request.
pub fn rank_candidates<R: Rng>(
    now: DateTime<Utc>,
    candidates: Vec<CandidateSignals>,
    stale_after: chrono::Duration,
    rng: &mut R,
) -> Vec<RankedCandidate> {
    let mut ranked: Vec<RankedCandidate> = candidates
        .into_iter()
        .map(|signals| RankedCandidate {
            score: calculate_score(now, &signals, stale_after, rng),
            request: signals.request,
        })
        .collect();

    ranked.sort_by(rank_order);
    ranked
}

fn rank_order(a: &RankedCandidate, b: &RankedCandidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.request.created_at.cmp(&b.request.created_at))
        .then_with(|| a.request.id.cmp(&b.request.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PresenceStatus, RequestStatus};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use uuid::Uuid;

    const STALE: i64 = 90;

    fn request(created_at: DateTime<Utc>) -> PairingRequest {
        PairingRequest {
            id: Uuid::new_v4(),
            requester_id: Uuid::new_v4(),
            status: RequestStatus::Pending,
            session_id: Some(Uuid::new_v4()),
            matched_with: None,
            created_at,
            responded_at: None,
        }
    }

    fn presence(user_id: Uuid, status: PresenceStatus, last_seen: DateTime<Utc>) -> PresenceRecord {
        PresenceRecord {
            user_id,
            status,
            last_seen,
            session_id: None,
        }
    }

    #[test]
    fn online_candidate_outranks_offline_one() {
        let now = Utc::now();
        let offline_req = request(now - chrono::Duration::minutes(5));
        let online_req = request(now);
        let signals = vec![
            CandidateSignals {
                presence: Some(presence(
                    offline_req.requester_id,
                    PresenceStatus::Offline,
                    now - chrono::Duration::minutes(20),
                )),
                request: offline_req,
                activity: ActivityStats::default(),
            },
            CandidateSignals {
                presence: Some(presence(online_req.requester_id, PresenceStatus::Online, now)),
                request: online_req.clone(),
                activity: ActivityStats::default(),
            },
        ];

        // Presence gap alone exceeds the full jitter range, for any seed.
        for seed in 0..32 {
            let mut rng = StdRng::seed_from_u64(seed);
            let ranked = rank_candidates(now, signals.clone(), chrono::Duration::seconds(STALE), &mut rng);
            assert_eq!(ranked[0].request.id, online_req.id, "seed {seed}");
        }
    }

    #[test]
    fn stale_online_record_scores_as_offline() {
        let now = Utc::now();
        let user = Uuid::new_v4();
        let stale = presence(user, PresenceStatus::Online, now - chrono::Duration::minutes(10));
        let score = presence_score(now, Some(&stale), chrono::Duration::seconds(STALE));
        assert!(score < 0.6);
        assert!(score > 0.0);
    }

    #[test]
    fn activity_saturates() {
        let quiet = activity_score(&ActivityStats::default());
        let busy = activity_score(&ActivityStats {
            recent_messages: 200,
            ..Default::default()
        });
        assert_eq!(quiet, 0.0);
        assert!(busy > 0.99 && busy <= 1.0);
    }

    #[test]
    fn completion_is_neutral_without_history() {
        assert_eq!(completion_score(&ActivityStats::default()), 0.5);
        let flaky = ActivityStats {
            recent_messages: 0,
            matched: 1,
            completed: 4,
        };
        assert_eq!(completion_score(&flaky), 0.25);
    }

    #[test]
    fn equal_scores_prefer_oldest_request() {
        let now = Utc::now();
        let older = request(now - chrono::Duration::minutes(3));
        let newer = request(now);
        let mut ranked = vec![
            RankedCandidate { request: newer, score: 0.5 },
            RankedCandidate { request: older.clone(), score: 0.5 },
        ];
        ranked.sort_by(rank_order);
        assert_eq!(ranked[0].request.id, older.id);
    }
}
