use std::sync::atomic::Ordering;
use std::time::{Instant, SystemTime};

use super::agent_internal::*;
use super::*;
use crate::stats::*;

/// Maps a monotonic instant onto the wall clock.
fn to_system_time(now: SystemTime, instant_now: Instant, t: Instant) -> SystemTime {
    now.checked_sub(instant_now.saturating_duration_since(t))
        .unwrap_or(now)
}

fn candidate_stats(c: &Candidate, timestamp: SystemTime) -> CandidateStats {
    CandidateStats {
        timestamp,
        id: c.id(),
        network_type: c.network_type(),
        ip: c.address().to_owned(),
        port: c.port(),
        candidate_type: c.candidate_type(),
        priority: c.priority(),
        related_address: c
            .related_address()
            .map(|r| format!("{}:{}", r.address, r.port)),
        relay_protocol: c.relay_protocol().to_owned(),
        deleted: c.is_closed(),
    }
}

impl AgentInternal {
    pub(crate) fn get_candidate_pairs_stats(&self) -> Vec<CandidatePairStats> {
        let now = SystemTime::now();
        let instant_now = Instant::now();

        self.checklist
            .iter()
            .map(|p| CandidatePairStats {
                timestamp: now,
                local_candidate_id: p.local.id(),
                remote_candidate_id: p.remote.id(),
                state: p.state(),
                nominated: p.nominated(),
                priority: p.priority(),
                requests_sent: p.requests_sent.load(Ordering::SeqCst),
                responses_received: p.responses_received.load(Ordering::SeqCst),
                binding_request_count: p.binding_request_count(),
                last_request_timestamp: p
                    .last_request_sent()
                    .map(|t| to_system_time(now, instant_now, t)),
                last_response_timestamp: p
                    .last_response_received()
                    .map(|t| to_system_time(now, instant_now, t)),
            })
            .collect()
    }

    pub(crate) fn get_local_candidates_stats(&self) -> Vec<CandidateStats> {
        let now = SystemTime::now();
        self.local_candidates
            .values()
            .flatten()
            .map(|c| candidate_stats(c, now))
            .collect()
    }

    pub(crate) fn get_remote_candidates_stats(&self) -> Vec<CandidateStats> {
        let now = SystemTime::now();
        self.remote_candidates
            .values()
            .flatten()
            .map(|c| candidate_stats(c, now))
            .collect()
    }
}

impl Agent {
    /// Returns a list of candidate pair stats.
    pub async fn get_candidate_pairs_stats(&self) -> Vec<CandidatePairStats> {
        self.runner
            .run(|ai| ai.get_candidate_pairs_stats())
            .await
            .unwrap_or_default()
    }

    /// Returns a list of local candidates stats.
    pub async fn get_local_candidates_stats(&self) -> Vec<CandidateStats> {
        self.runner
            .run(|ai| ai.get_local_candidates_stats())
            .await
            .unwrap_or_default()
    }

    /// Returns a list of remote candidates stats.
    pub async fn get_remote_candidates_stats(&self) -> Vec<CandidateStats> {
        self.runner
            .run(|ai| ai.get_remote_candidates_stats())
            .await
            .unwrap_or_default()
    }
}
