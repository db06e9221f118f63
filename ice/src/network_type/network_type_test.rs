use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::*;

#[test]
fn test_network_type_parsing_success() -> Result<()> {
    let ipv4: IpAddr = Ipv4Addr::new(192, 168, 0, 1).into();
    let ipv6: IpAddr = Ipv6Addr::new(0xfe80, 0, 0, 0, 0xa0ef, 0xa0ef, 0xa0ef, 0xa0ef).into();

    let tests = vec![
        ("lowercase UDP4", "udp", ipv4, NetworkType::Udp4),
        ("uppercase UDP4", "UDP", ipv4, NetworkType::Udp4),
        ("lowercase UDP6", "udp", ipv6, NetworkType::Udp6),
        ("uppercase UDP6", "UDP", ipv6, NetworkType::Udp6),
        ("lowercase TCP4", "tcp", ipv4, NetworkType::Tcp4),
        ("uppercase TCP6", "TCP", ipv6, NetworkType::Tcp6),
    ];

    for (name, in_network, in_ip, expected) in tests {
        let actual = determine_network_type(in_network, &in_ip)?;
        assert_eq!(
            actual, expected,
            "NetworkTypeParsing failed: {name} {in_network} {in_ip} {actual} {expected}",
        );
    }

    Ok(())
}

#[test]
fn test_network_type_parsing_failure() -> Result<()> {
    let ipv6: IpAddr = Ipv6Addr::new(0xfe80, 0, 0, 0, 0xa0ef, 0xa0ef, 0xa0ef, 0xa0ef).into();

    let tests = vec![("invalid network", "junkNetwork", ipv6)];
    for (name, in_network, in_ip) in tests {
        let result = determine_network_type(in_network, &in_ip);
        assert!(
            result.is_err(),
            "NetworkTypeParsing should fail: {name} {in_network} {in_ip}",
        );
    }

    Ok(())
}

#[test]
fn test_network_type_is_udp() -> Result<()> {
    assert!(NetworkType::Udp4.is_udp());
    assert!(NetworkType::Udp6.is_udp());
    assert!(!NetworkType::Udp4.is_tcp());
    assert!(!NetworkType::Udp6.is_tcp());
    assert!(NetworkType::Tcp4.is_reliable());
    assert_eq!(NetworkType::from("udp6"), NetworkType::Udp6);
    assert_eq!(NetworkType::Tcp6.network_short(), "tcp");

    Ok(())
}
