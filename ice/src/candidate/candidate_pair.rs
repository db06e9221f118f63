use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use super::*;

/// Represent the ICE candidate pair state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CandidatePairState {
    #[serde(rename = "unspecified")]
    Unspecified = 0,

    /// Means a check has not been performed for this pair.
    #[serde(rename = "waiting")]
    Waiting = 1,

    /// Means a check has been sent for this pair, but the transaction is in progress.
    #[serde(rename = "in-progress")]
    InProgress = 2,

    /// Means a check for this pair was already done and failed, either never producing any response
    /// or producing an unrecoverable failure response.
    #[serde(rename = "failed")]
    Failed = 3,

    /// Means a check for this pair was already done and produced a successful result.
    #[serde(rename = "succeeded")]
    Succeeded = 4,
}

impl From<u8> for CandidatePairState {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::Waiting,
            2 => Self::InProgress,
            3 => Self::Failed,
            4 => Self::Succeeded,
            _ => Self::Unspecified,
        }
    }
}

impl Default for CandidatePairState {
    fn default() -> Self {
        Self::Unspecified
    }
}

impl fmt::Display for CandidatePairState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::Waiting => "waiting",
            Self::InProgress => "in-progress",
            Self::Failed => "failed",
            Self::Succeeded => "succeeded",
            Self::Unspecified => "unspecified",
        };

        write!(f, "{s}")
    }
}

/// Represents a combination of a local and remote candidate.
pub struct CandidatePair {
    pub(crate) ice_role_controlling: AtomicBool,
    pub remote: Arc<Candidate>,
    pub local: Arc<Candidate>,
    pub(crate) binding_request_count: AtomicU16,
    pub(crate) state: AtomicU8, // convert it to CandidatePairState,
    pub(crate) nominated: AtomicBool,

    pub(crate) requests_sent: AtomicU32,
    pub(crate) responses_received: AtomicU32,
    baseline_time: Instant,
    last_request_sent: AtomicU64,
    last_response_received: AtomicU64,
}

impl fmt::Debug for CandidatePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "prio {} (local, prio {}) {} <-> {} (remote, prio {})",
            self.priority(),
            self.local.priority(),
            self.local,
            self.remote,
            self.remote.priority()
        )
    }
}

impl fmt::Display for CandidatePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "prio {} (local, prio {}) {} <-> {} (remote, prio {})",
            self.priority(),
            self.local.priority(),
            self.local,
            self.remote,
            self.remote.priority()
        )
    }
}

impl PartialEq for CandidatePair {
    fn eq(&self, other: &Self) -> bool {
        self.local.equal(&other.local) && self.remote.equal(&other.remote)
    }
}

impl CandidatePair {
    #[must_use]
    pub fn new(local: Arc<Candidate>, remote: Arc<Candidate>, controlling: bool) -> Self {
        Self {
            ice_role_controlling: AtomicBool::new(controlling),
            remote,
            local,
            state: AtomicU8::new(CandidatePairState::Waiting as u8),
            binding_request_count: AtomicU16::new(0),
            nominated: AtomicBool::new(false),
            requests_sent: AtomicU32::new(0),
            responses_received: AtomicU32::new(0),
            baseline_time: Instant::now(),
            last_request_sent: AtomicU64::new(0),
            last_response_received: AtomicU64::new(0),
        }
    }

    /// RFC 5245 - 5.7.2.  Computing Pair Priority and Ordering Pairs
    /// Let G be the priority for the candidate provided by the controlling
    /// agent.  Let D be the priority for the candidate provided by the
    /// controlled agent.
    /// pair priority = 2^32*MIN(G,D) + 2*MAX(G,D) + (G>D?1:0)
    pub fn priority(&self) -> u64 {
        let (g, d) = if self.ice_role_controlling.load(Ordering::SeqCst) {
            (self.local.priority(), self.remote.priority())
        } else {
            (self.remote.priority(), self.local.priority())
        };

        // 1<<32 overflows uint32; and if both g && d are
        // maxUint32, this result would overflow uint64
        ((1 << 32_u64) - 1) * u64::from(std::cmp::min(g, d))
            + 2 * u64::from(std::cmp::max(g, d))
            + u64::from(g > d)
    }

    pub fn state(&self) -> CandidatePairState {
        self.state.load(Ordering::SeqCst).into()
    }

    pub(crate) fn set_state(&self, state: CandidatePairState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn nominated(&self) -> bool {
        self.nominated.load(Ordering::SeqCst)
    }

    pub(crate) fn set_nominated(&self, nominated: bool) {
        self.nominated.store(nominated, Ordering::SeqCst);
    }

    pub fn binding_request_count(&self) -> u16 {
        self.binding_request_count.load(Ordering::SeqCst)
    }

    pub(crate) fn set_ice_role_controlling(&self, controlling: bool) {
        self.ice_role_controlling
            .store(controlling, Ordering::SeqCst);
    }

    /// Sends `b` from the local candidate of the pair to its remote candidate.
    pub async fn write(&self, b: &[u8]) -> Result<usize, crate::error::Error> {
        self.local.write_to(b, &self.remote).await
    }

    /// Books an outgoing binding request for the retry counter and the stats.
    pub(crate) fn on_request_sent(&self) {
        self.binding_request_count.fetch_add(1, Ordering::SeqCst);
        self.requests_sent.fetch_add(1, Ordering::SeqCst);
        self.last_request_sent
            .store(self.since_baseline(), Ordering::SeqCst);
    }

    /// Books an answered check. An answer clears the retry counter.
    pub(crate) fn on_response_received(&self) {
        self.binding_request_count.store(0, Ordering::SeqCst);
        self.responses_received.fetch_add(1, Ordering::SeqCst);
        self.last_response_received
            .store(self.since_baseline(), Ordering::SeqCst);
    }

    /// Puts the pair back in the checklist as if it had never been checked.
    pub(crate) fn reset(&self) {
        self.set_state(CandidatePairState::Waiting);
        self.binding_request_count.store(0, Ordering::SeqCst);
        self.set_nominated(false);
    }

    pub(crate) fn last_request_sent(&self) -> Option<Instant> {
        let n = self.last_request_sent.load(Ordering::SeqCst);
        (n != 0).then(|| self.baseline_time + Duration::from_nanos(n))
    }

    pub(crate) fn last_response_received(&self) -> Option<Instant> {
        let n = self.last_response_received.load(Ordering::SeqCst);
        (n != 0).then(|| self.baseline_time + Duration::from_nanos(n))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn since_baseline(&self) -> u64 {
        // never zero, zero marks "not yet"
        (Instant::now().duration_since(self.baseline_time).as_nanos() as u64).max(1)
    }
}
