use super::candidate_host::CandidateHostConfig;
use super::candidate_pair::*;
use super::candidate_peer_reflexive::CandidatePeerReflexiveConfig;
use super::candidate_relay::CandidateRelayConfig;
use super::candidate_server_reflexive::CandidateServerReflexiveConfig;
use super::*;
use crate::error::Result;

pub(crate) fn host_candidate() -> Result<Candidate> {
    CandidateHostConfig {
        base_config: CandidateConfig {
            network: "udp".to_owned(),
            address: "0.0.0.0".to_owned(),
            component: COMPONENT_RTP,
            ..Default::default()
        },
        ..Default::default()
    }
    .new_candidate_host()
}

pub(crate) fn prflx_candidate() -> Result<Candidate> {
    CandidatePeerReflexiveConfig {
        base_config: CandidateConfig {
            network: "udp".to_owned(),
            address: "0.0.0.0".to_owned(),
            component: COMPONENT_RTP,
            ..Default::default()
        },
        ..Default::default()
    }
    .new_candidate_peer_reflexive()
}

pub(crate) fn srflx_candidate() -> Result<Candidate> {
    CandidateServerReflexiveConfig {
        base_config: CandidateConfig {
            network: "udp".to_owned(),
            address: "0.0.0.0".to_owned(),
            component: COMPONENT_RTP,
            ..Default::default()
        },
        ..Default::default()
    }
    .new_candidate_server_reflexive()
}

pub(crate) fn relay_candidate() -> Result<Candidate> {
    CandidateRelayConfig {
        base_config: CandidateConfig {
            network: "udp".to_owned(),
            address: "0.0.0.0".to_owned(),
            component: COMPONENT_RTP,
            ..Default::default()
        },
        ..Default::default()
    }
    .new_candidate_relay()
}

#[test]
fn test_candidate_pair_priority() -> Result<()> {
    let host = Arc::new(host_candidate()?);
    let prflx = Arc::new(prflx_candidate()?);
    let srflx = Arc::new(srflx_candidate()?);
    let relay = Arc::new(relay_candidate()?);

    let tests = vec![
        (
            CandidatePair::new(Arc::clone(&host), Arc::clone(&host), false),
            9_151_314_440_652_587_007,
        ),
        (
            CandidatePair::new(Arc::clone(&host), Arc::clone(&host), true),
            9_151_314_440_652_587_007,
        ),
        (
            CandidatePair::new(Arc::clone(&host), Arc::clone(&prflx), true),
            7_277_816_996_102_668_288,
        ),
        (
            CandidatePair::new(Arc::clone(&host), Arc::clone(&prflx), false),
            7_277_816_996_102_668_287,
        ),
        (
            CandidatePair::new(Arc::clone(&host), Arc::clone(&srflx), true),
            7_998_392_936_314_175_488,
        ),
        (
            CandidatePair::new(Arc::clone(&host), Arc::clone(&srflx), false),
            7_998_392_936_314_175_487,
        ),
        (
            CandidatePair::new(Arc::clone(&host), Arc::clone(&relay), true),
            72_057_593_987_596_288,
        ),
        (
            CandidatePair::new(Arc::clone(&host), Arc::clone(&relay), false),
            72_057_593_987_596_287,
        ),
    ];

    for (pair, want) in tests {
        let got = pair.priority();
        assert_eq!(
            got, want,
            "CandidatePair({pair}).Priority() = {got}, want {want}"
        );
    }

    Ok(())
}

#[test]
fn test_candidate_pair_equality() -> Result<()> {
    let pair_a = CandidatePair::new(
        Arc::new(host_candidate()?),
        Arc::new(srflx_candidate()?),
        true,
    );
    let pair_b = CandidatePair::new(
        Arc::new(host_candidate()?),
        Arc::new(srflx_candidate()?),
        false,
    );
    let pair_c = CandidatePair::new(
        Arc::new(host_candidate()?),
        Arc::new(relay_candidate()?),
        false,
    );

    assert_eq!(pair_a, pair_b, "Expected {pair_a} to equal {pair_b}");
    assert_ne!(pair_a, pair_c, "Expected {pair_a} to differ from {pair_c}");

    Ok(())
}

#[test]
fn test_candidate_pair_reset() -> Result<()> {
    let pair = CandidatePair::new(
        Arc::new(host_candidate()?),
        Arc::new(host_candidate()?),
        true,
    );
    assert_eq!(pair.state(), CandidatePairState::Waiting);
    assert!(pair.last_request_sent().is_none());

    pair.on_request_sent();
    pair.on_request_sent();
    pair.set_state(CandidatePairState::Succeeded);
    pair.set_nominated(true);
    assert_eq!(pair.binding_request_count(), 2);
    assert!(pair.last_request_sent().is_some());

    pair.reset();
    assert_eq!(pair.state(), CandidatePairState::Waiting);
    assert_eq!(pair.binding_request_count(), 0);
    assert!(!pair.nominated());
    assert_eq!(
        pair.requests_sent.load(std::sync::atomic::Ordering::SeqCst),
        2,
        "reset keeps the stats counters"
    );

    Ok(())
}
