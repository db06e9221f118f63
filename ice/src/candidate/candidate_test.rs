use std::time::Duration;

use tokio::net::UdpSocket;

use super::candidate_host::CandidateHostConfig;
use super::candidate_pair_test::*;
use super::*;
use crate::error::*;

#[test]
fn test_candidate_priority() -> Result<()> {
    let tests = vec![
        (
            Candidate {
                candidate_type: CandidateType::Host,
                component: COMPONENT_RTP,
                ..Default::default()
            },
            2_130_706_431,
        ),
        (
            Candidate {
                candidate_type: CandidateType::Host,
                component: COMPONENT_RTP,
                local_preference: DEFAULT_LOCAL_PREFERENCE - 1,
                ..Default::default()
            },
            2_130_706_175,
        ),
        (
            Candidate {
                candidate_type: CandidateType::ServerReflexive,
                component: COMPONENT_RTP,
                ..Default::default()
            },
            1_862_270_975,
        ),
        (
            Candidate {
                candidate_type: CandidateType::PeerReflexive,
                component: COMPONENT_RTP,
                ..Default::default()
            },
            1_694_498_815,
        ),
        (
            Candidate {
                candidate_type: CandidateType::Relay,
                component: COMPONENT_RTP,
                ..Default::default()
            },
            16_777_215,
        ),
        (
            Candidate {
                candidate_type: CandidateType::Host,
                component: COMPONENT_RTCP,
                ..Default::default()
            },
            2_130_706_430,
        ),
    ];

    for (candidate, want) in tests {
        let got = candidate.priority();
        assert_eq!(
            got, want,
            "Candidate({candidate}).Priority() = {got}, want {want}"
        );
    }

    Ok(())
}

#[test]
fn test_candidate_priority_follows_type_preference() -> Result<()> {
    // the type preference dominates whatever address or local preference is used
    let worst_host = Candidate {
        candidate_type: CandidateType::Host,
        address: "10.0.0.1".to_owned(),
        component: COMPONENT_RTCP,
        local_preference: 0,
        ..Default::default()
    };
    let best_srflx = Candidate {
        candidate_type: CandidateType::ServerReflexive,
        address: "1.2.3.4".to_owned(),
        component: COMPONENT_RTP,
        ..Default::default()
    };
    let best_prflx = Candidate {
        candidate_type: CandidateType::PeerReflexive,
        address: "1.2.3.4".to_owned(),
        component: COMPONENT_RTP,
        ..Default::default()
    };
    let best_relay = Candidate {
        candidate_type: CandidateType::Relay,
        address: "1.2.3.4".to_owned(),
        component: COMPONENT_RTP,
        ..Default::default()
    };

    assert!(worst_host.priority() > best_srflx.priority());
    assert!(best_srflx.priority() > best_prflx.priority());
    assert!(best_prflx.priority() > best_relay.priority());

    Ok(())
}

#[test]
fn test_candidate_foundation() -> Result<()> {
    // All fields are the same
    assert_eq!(
        Candidate {
            candidate_type: CandidateType::Host,
            network_type: NetworkType::Udp4,
            address: "A".to_owned(),
            ..Default::default()
        }
        .foundation(),
        Candidate {
            candidate_type: CandidateType::Host,
            network_type: NetworkType::Udp4,
            address: "A".to_owned(),
            ..Default::default()
        }
        .foundation()
    );

    // Different Address
    assert_ne!(
        Candidate {
            candidate_type: CandidateType::Host,
            network_type: NetworkType::Udp4,
            address: "A".to_owned(),
            ..Default::default()
        }
        .foundation(),
        Candidate {
            candidate_type: CandidateType::Host,
            network_type: NetworkType::Udp4,
            address: "B".to_owned(),
            ..Default::default()
        }
        .foundation(),
    );

    // Different networkType
    assert_ne!(
        Candidate {
            candidate_type: CandidateType::Host,
            network_type: NetworkType::Udp4,
            address: "A".to_owned(),
            ..Default::default()
        }
        .foundation(),
        Candidate {
            candidate_type: CandidateType::Host,
            network_type: NetworkType::Udp6,
            address: "A".to_owned(),
            ..Default::default()
        }
        .foundation(),
    );

    // Different candidateType
    assert_ne!(
        Candidate {
            candidate_type: CandidateType::Host,
            network_type: NetworkType::Udp4,
            address: "A".to_owned(),
            ..Default::default()
        }
        .foundation(),
        Candidate {
            candidate_type: CandidateType::PeerReflexive,
            network_type: NetworkType::Udp4,
            address: "A".to_owned(),
            ..Default::default()
        }
        .foundation(),
    );

    // Port has no effect
    assert_eq!(
        Candidate {
            candidate_type: CandidateType::Host,
            network_type: NetworkType::Udp4,
            address: "A".to_owned(),
            port: 8080,
            ..Default::default()
        }
        .foundation(),
        Candidate {
            candidate_type: CandidateType::Host,
            network_type: NetworkType::Udp4,
            address: "A".to_owned(),
            port: 80,
            ..Default::default()
        }
        .foundation(),
    );

    Ok(())
}

#[test]
fn test_candidate_equality() -> Result<()> {
    let a = host_candidate()?;
    let b = host_candidate()?;
    let c = srflx_candidate()?;

    assert!(a.equal(&a), "equal must be reflexive");
    assert!(a.equal(&b) && b.equal(&a), "equal must be symmetric");
    assert_ne!(a.id(), b.id(), "ids are not part of the equality");
    assert!(!a.equal(&c));

    let d = CandidateHostConfig {
        base_config: CandidateConfig {
            network: "udp".to_owned(),
            address: "0.0.0.0".to_owned(),
            port: 1234,
            component: COMPONENT_RTP,
            ..Default::default()
        },
        ..Default::default()
    }
    .new_candidate_host()?;
    assert!(!a.equal(&d), "port is part of the equality");

    Ok(())
}

#[test]
fn test_candidate_marshal() -> Result<()> {
    let tests = vec![
        (
            "750 1 udp 500 fcd9:e3b8:12ce:9fc5:74a5:c6bb:d8b:e08a 53987 typ host",
            CandidateType::Host,
            NetworkType::Udp6,
            "fcd9:e3b8:12ce:9fc5:74a5:c6bb:d8b:e08a",
            53987,
            None,
        ),
        (
            "4273957277 1 udp 2130706431 10.0.75.1 53634 typ host",
            CandidateType::Host,
            NetworkType::Udp4,
            "10.0.75.1",
            53634,
            None,
        ),
        (
            "647372371 1 udp 1694498815 191.228.238.68 53991 typ srflx raddr 192.168.0.274 rport 53991",
            CandidateType::ServerReflexive,
            NetworkType::Udp4,
            "191.228.238.68",
            53991,
            Some(CandidateRelatedAddress {
                address: "192.168.0.274".to_owned(),
                port: 53991,
            }),
        ),
        (
            "1052353102 1 udp 1694498815 10.0.0.5 4000 typ prflx raddr 10.0.0.1 rport 4001",
            CandidateType::PeerReflexive,
            NetworkType::Udp4,
            "10.0.0.5",
            4000,
            Some(CandidateRelatedAddress {
                address: "10.0.0.1".to_owned(),
                port: 4001,
            }),
        ),
        (
            "848194626 1 udp 16777215 50.0.0.1 5000 typ relay raddr 192.168.0.1 rport 5001",
            CandidateType::Relay,
            NetworkType::Udp4,
            "50.0.0.1",
            5000,
            Some(CandidateRelatedAddress {
                address: "192.168.0.1".to_owned(),
                port: 5001,
            }),
        ),
    ];

    for (raw, candidate_type, network_type, address, port, related_address) in tests {
        let c = unmarshal_candidate(raw)?;

        assert_eq!(c.candidate_type(), candidate_type, "{raw}");
        assert_eq!(c.network_type(), network_type, "{raw}");
        assert_eq!(c.address(), address, "{raw}");
        assert_eq!(c.port(), port, "{raw}");
        assert_eq!(c.related_address(), related_address, "{raw}");
        assert_eq!(c.marshal(), raw, "marshal must give back the original value");
    }

    Ok(())
}

#[test]
fn test_candidate_unmarshal_failure() -> Result<()> {
    let tests = vec![
        ("", Error::ErrAttributeTooShortIceCandidate),
        (
            "1938809241 1 udp 2122262783 192.168.0.196 typ host",
            Error::ErrAttributeTooShortIceCandidate,
        ),
        (
            "4207374051 1 udp 1685790463 191.228.238.68 53991 typ srflx raddr 192.168.0.278",
            Error::ErrParseRelatedAddr,
        ),
        (
            "4207374051 1 udp 1685790463 191.228.238.68 53991 typ srflx raddr 192.168.0.278 rport port",
            Error::ErrParseRelatedAddr,
        ),
        (
            "4207374051 1 udp 1685790463 191.228.238.68 53991 typ vip",
            Error::ErrUnknownCandidateType,
        ),
        (
            "4207374051 1 udp 1685790463 not-an-ip 53991 typ relay raddr 1.2.3.4 rport 5",
            Error::ErrAddressParseFailed,
        ),
        (
            "4207374051 1 sctp 1685790463 191.228.238.68 53991 typ host",
            Error::ErrDetermineNetworkType,
        ),
    ];

    for (raw, expected_err) in tests {
        match unmarshal_candidate(raw) {
            Ok(c) => panic!("expected {expected_err} for {raw}, got candidate {c}"),
            Err(err) => assert_eq!(err, expected_err, "{raw}"),
        }
    }

    Ok(())
}

#[tokio::test]
async fn test_candidate_write_to_and_close() -> Result<()> {
    let sock = UdpSocket::bind("127.0.0.1:0").await?;
    let local_addr = sock.local_addr()?;
    let peer = UdpSocket::bind("127.0.0.1:0").await?;
    let peer_addr = peer.local_addr()?;

    let local = CandidateHostConfig {
        base_config: CandidateConfig {
            network: "udp".to_owned(),
            address: local_addr.ip().to_string(),
            port: local_addr.port(),
            component: COMPONENT_RTP,
            conn: Some(Arc::new(sock)),
            ..Default::default()
        },
        ..Default::default()
    }
    .new_candidate_host()?;
    let remote = CandidateHostConfig {
        base_config: CandidateConfig {
            network: "udp".to_owned(),
            address: peer_addr.ip().to_string(),
            port: peer_addr.port(),
            component: COMPONENT_RTP,
            ..Default::default()
        },
        ..Default::default()
    }
    .new_candidate_host()?;

    let before = local.last_sent();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let n = local.write_to(b"ping", &remote).await?;
    assert_eq!(n, 4);
    assert!(local.last_sent() > before, "write_to must refresh last_sent");

    let mut buf = [0u8; 16];
    let (n, from) = tokio::time::timeout(Duration::from_secs(1), peer.recv_from(&mut buf))
        .await
        .map_err(|_| Error::Other("peer never received".to_owned()))??;
    assert_eq!(&buf[..n], b"ping");
    assert_eq!(from, local_addr);

    let mut closed_rx = local.closed_rx();
    assert!(!local.is_closed());
    local.close().await?;
    assert!(local.is_closed());
    assert!(*closed_rx.borrow_and_update());
    assert_eq!(local.close().await, Err(Error::ErrClosed));

    Ok(())
}
