use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use ::rand::{thread_rng, Rng};
use stun::agent::TransactionId;
use stun::message::*;
use stun::xoraddr::XorMappedAddress;
use tokio::sync::watch;
use util::vnet::net::*;
use util::Conn;
use waitgroup::WaitGroup;

use super::agent_config::*;
use super::agent_runner::{wait_closed, AgentRunner};
use super::*;
use crate::candidate::candidate_host::CandidateHostConfig;
use crate::candidate::candidate_relay::CandidateRelayConfig;
use crate::candidate::candidate_server_reflexive::CandidateServerReflexiveConfig;
use crate::external_ip_mapper::ExternalIpMapper;
use crate::mdns::MulticastDnsMode;
use crate::stream_conn::{dial_dtls, dial_tcp, dial_tls, ControlConn};
use crate::url::{ProtoType, SchemeType, Url};

/// Everything one gathering run needs, detached from the `Agent` so it can move into a task.
#[derive(Clone)]
pub(crate) struct GatherCandidatesInternalParams {
    pub(crate) runner: AgentRunner,
    pub(crate) urls: Vec<Url>,
    pub(crate) network_types: Vec<NetworkType>,
    pub(crate) candidate_types: Vec<CandidateType>,
    pub(crate) port_max: u16,
    pub(crate) port_min: u16,
    pub(crate) mdns_mode: MulticastDnsMode,
    pub(crate) mdns_name: String,
    pub(crate) net: Arc<Net>,
    pub(crate) interface_filter: Arc<Option<InterfaceFilterFn>>,
    pub(crate) ip_filter: Arc<Option<IpFilterFn>>,
    pub(crate) include_loopback: bool,
    pub(crate) ext_ip_mapper: Arc<Option<ExternalIpMapper>>,
    pub(crate) insecure_skip_verify: bool,
    pub(crate) closed_rx: watch::Receiver<bool>,
}

impl Agent {
    /// Starts gathering local candidates. Each one is reported through `on_candidate`, followed
    /// by `None` once gathering completed. Without trickle this only returns after completion.
    pub async fn gather_candidates(&self) -> Result<()> {
        if self.handlers.on_candidate_hdlr.load().is_none() {
            return Err(Error::ErrNoOnCandidateHandler);
        }

        self.runner
            .run(|ai| {
                if ai.gathering_state != GatheringState::New {
                    return Err(Error::ErrMultipleGatherAttempted);
                }
                ai.set_gathering_state(GatheringState::Gathering);
                Ok(())
            })
            .await??;

        let params = self.gather_params();
        let handle = tokio::spawn(async move {
            Self::gather_candidates_internal(params).await;
        });

        if self.trickle {
            *self.gather_handle.lock().await = Some(handle);
        } else if let Err(err) = handle.await {
            log::error!("gathering task failed: {}", err);
        }

        Ok(())
    }

    pub(crate) fn gather_params(&self) -> GatherCandidatesInternalParams {
        GatherCandidatesInternalParams {
            runner: self.runner.clone(),
            urls: self.urls.clone(),
            network_types: self.network_types.clone(),
            candidate_types: self.candidate_types.clone(),
            port_max: self.port_max,
            port_min: self.port_min,
            mdns_mode: self.mdns_mode,
            mdns_name: self.mdns_name.clone(),
            net: Arc::clone(&self.net),
            interface_filter: Arc::clone(&self.interface_filter),
            ip_filter: Arc::clone(&self.ip_filter),
            include_loopback: self.include_loopback,
            ext_ip_mapper: Arc::clone(&self.ext_ip_mapper),
            insecure_skip_verify: self.insecure_skip_verify,
            closed_rx: self.closed_tx.subscribe(),
        }
    }

    pub(crate) async fn gather_candidates_internal(params: GatherCandidatesInternalParams) {
        let wg = WaitGroup::new();

        for t in &params.candidate_types {
            match t {
                CandidateType::Host => {
                    let w = wg.worker();
                    let host_params = params.clone();
                    tokio::spawn(async move {
                        let _d = w;
                        let params = host_params;
                        let closed_rx = params.closed_rx.clone();
                        tokio::select! {
                            _ = Self::gather_candidates_local(params) => {},
                            _ = wait_closed(closed_rx) => {},
                        }
                    });
                }
                CandidateType::ServerReflexive => {
                    let w = wg.worker();
                    let srflx_params = params.clone();
                    tokio::spawn(async move {
                        let _d = w;
                        let params = srflx_params;
                        let closed_rx = params.closed_rx.clone();
                        tokio::select! {
                            _ = Self::gather_candidates_srflx(params) => {},
                            _ = wait_closed(closed_rx) => {},
                        }
                    });

                    let srflx_mapped = params
                        .ext_ip_mapper
                        .as_ref()
                        .as_ref()
                        .map_or(false, |m| m.candidate_type == CandidateType::ServerReflexive);
                    if srflx_mapped {
                        let w = wg.worker();
                        let mapped_params = params.clone();
                        tokio::spawn(async move {
                            let _d = w;
                            let params = mapped_params;
                            let closed_rx = params.closed_rx.clone();
                            tokio::select! {
                                _ = Self::gather_candidates_srflx_mapped(params) => {},
                                _ = wait_closed(closed_rx) => {},
                            }
                        });
                    }
                }
                CandidateType::Relay => {
                    let w = wg.worker();
                    let relay_params = params.clone();
                    tokio::spawn(async move {
                        let _d = w;
                        let params = relay_params;
                        Self::gather_candidates_relay(params).await;
                    });
                }
                _ => {}
            }
        }

        // Block until all STUN and TURN URLs have been gathered (or timed out)
        wg.wait().await;

        if let Err(err) = params
            .runner
            .run(|ai| ai.set_gathering_state(GatheringState::Complete))
            .await
        {
            log::debug!("gathering ended without completing: {}", err);
        }
    }

    async fn gather_candidates_local(params: GatherCandidatesInternalParams) {
        let ips = local_interfaces(
            &params.net,
            &params.interface_filter,
            &params.ip_filter,
            &params.network_types,
            params.include_loopback,
        )
        .await;

        let host_mapper = params
            .ext_ip_mapper
            .as_ref()
            .as_ref()
            .filter(|m| m.candidate_type == CandidateType::Host);

        for (index, ip) in ips.into_iter().enumerate() {
            let mut mapped_ip = ip;

            if params.mdns_mode != MulticastDnsMode::QueryAndGather {
                if let Some(mapper) = host_mapper {
                    match mapper.find_external_ip(&ip.to_string()) {
                        Ok(ext_ip) => mapped_ip = ext_ip,
                        Err(err) => {
                            log::warn!(
                                "1:1 NAT mapping is enabled but no external IP is found for {}: {}",
                                ip,
                                err
                            );
                        }
                    }
                }
            }

            let address = if params.mdns_mode == MulticastDnsMode::QueryAndGather {
                params.mdns_name.clone()
            } else {
                mapped_ip.to_string()
            };

            let conn = match listen_udp_in_port_range(
                &params.net,
                params.port_max,
                params.port_min,
                SocketAddr::new(ip, 0),
            )
            .await
            {
                Ok(conn) => conn,
                Err(err) => {
                    log::warn!("could not listen udp {}: {}", ip, err);
                    continue;
                }
            };

            let port = match conn.local_addr() {
                Ok(addr) => addr.port(),
                Err(err) => {
                    log::warn!("could not get local addr: {}", err);
                    let _ = conn.close().await;
                    continue;
                }
            };

            let host_config = CandidateHostConfig {
                base_config: CandidateConfig {
                    network: UDP.to_owned(),
                    address,
                    port,
                    component: COMPONENT_RTP,
                    conn: Some(conn),
                    ..CandidateConfig::default()
                },
                local_preference: Some(DEFAULT_LOCAL_PREFERENCE.saturating_sub(index as u16)),
            };

            let candidate = match host_config.new_candidate_host() {
                Ok(mut candidate) => {
                    if params.mdns_mode == MulticastDnsMode::QueryAndGather {
                        if let Err(err) = candidate.set_ip(&ip) {
                            log::warn!(
                                "Failed to create host candidate: {} {} {}: {}",
                                UDP,
                                mapped_ip,
                                port,
                                err
                            );
                            let _ = candidate.close().await;
                            continue;
                        }
                    }
                    Arc::new(candidate)
                }
                Err(err) => {
                    log::warn!(
                        "Failed to create host candidate: {} {} {}: {}",
                        UDP,
                        mapped_ip,
                        port,
                        err
                    );
                    continue;
                }
            };

            if let Err(err) = params.runner.add_candidate(candidate).await {
                log::warn!("Failed to append to localCandidates and run onCandidateHdlr: {}", err);
                return;
            }
        }
    }

    async fn gather_candidates_srflx_mapped(params: GatherCandidatesInternalParams) {
        let wg = WaitGroup::new();

        for network_type in params.network_types.iter().copied() {
            if network_type.is_tcp() {
                continue;
            }

            let w = wg.worker();
            let params = params.clone();
            tokio::spawn(async move {
                let _d = w;

                let laddr = SocketAddr::new(unspecified_ip(network_type), 0);
                let conn = match listen_udp_in_port_range(
                    &params.net,
                    params.port_max,
                    params.port_min,
                    laddr,
                )
                .await
                {
                    Ok(conn) => conn,
                    Err(err) => {
                        log::warn!("Failed to listen {}: {}", laddr, err);
                        return;
                    }
                };

                let laddr = match conn.local_addr() {
                    Ok(laddr) => laddr,
                    Err(err) => {
                        log::warn!("Failed to get local addr: {}", err);
                        let _ = conn.close().await;
                        return;
                    }
                };

                let mapped_ip = match params.ext_ip_mapper.as_ref() {
                    Some(mapper) => match mapper.find_external_ip(&laddr.ip().to_string()) {
                        Ok(ip) => ip,
                        Err(err) => {
                            log::warn!(
                                "1:1 NAT mapping is enabled but no external IP is found for {}: {}",
                                laddr,
                                err
                            );
                            let _ = conn.close().await;
                            return;
                        }
                    },
                    None => {
                        let _ = conn.close().await;
                        return;
                    }
                };

                let srflx_config = CandidateServerReflexiveConfig {
                    base_config: CandidateConfig {
                        network: network_type.network_short(),
                        address: mapped_ip.to_string(),
                        port: laddr.port(),
                        component: COMPONENT_RTP,
                        conn: Some(conn),
                        ..CandidateConfig::default()
                    },
                    rel_addr: laddr.ip().to_string(),
                    rel_port: laddr.port(),
                };

                match srflx_config.new_candidate_server_reflexive() {
                    Ok(candidate) => {
                        if let Err(err) = params.runner.add_candidate(Arc::new(candidate)).await {
                            log::warn!(
                                "Failed to append to localCandidates and run onCandidateHdlr: {}",
                                err
                            );
                        }
                    }
                    Err(err) => {
                        log::warn!(
                            "Failed to create server reflexive candidate: {} {} {}: {}",
                            network_type,
                            mapped_ip,
                            laddr.port(),
                            err
                        );
                    }
                }
            });
        }

        wg.wait().await;
    }

    async fn gather_candidates_srflx(params: GatherCandidatesInternalParams) {
        let wg = WaitGroup::new();

        for network_type in params.network_types.iter().copied() {
            if network_type.is_tcp() {
                continue;
            }

            for url in params.urls.iter().filter(|u| u.scheme == SchemeType::Stun) {
                let w = wg.worker();
                let url = url.clone();
                let params = params.clone();
                tokio::spawn(async move {
                    let _d = w;

                    let stun_server = host_port(&url.host, url.port);
                    let server_addr = match params
                        .net
                        .resolve_addr(network_type.is_ipv4(), &stun_server)
                        .await
                    {
                        Ok(addr) => addr,
                        Err(err) => {
                            log::warn!("failed to resolve stun host: {}: {}", stun_server, err);
                            return;
                        }
                    };

                    let laddr = SocketAddr::new(unspecified_ip(network_type), 0);
                    let conn = match listen_udp_in_port_range(
                        &params.net,
                        params.port_max,
                        params.port_min,
                        laddr,
                    )
                    .await
                    {
                        Ok(conn) => conn,
                        Err(err) => {
                            log::warn!("Failed to listen for {}: {}", server_addr, err);
                            return;
                        }
                    };

                    let xoraddr =
                        match get_xormapped_addr(&conn, server_addr, STUN_GATHER_TIMEOUT).await {
                            Ok(xoraddr) => xoraddr,
                            Err(err) => {
                                log::warn!(
                                    "could not get server reflexive address {} {}: {}",
                                    network_type,
                                    url,
                                    err
                                );
                                let _ = conn.close().await;
                                return;
                            }
                        };

                    let laddr = match conn.local_addr() {
                        Ok(laddr) => laddr,
                        Err(err) => {
                            log::warn!("Failed to get local addr: {}", err);
                            let _ = conn.close().await;
                            return;
                        }
                    };

                    let srflx_config = CandidateServerReflexiveConfig {
                        base_config: CandidateConfig {
                            network: network_type.network_short(),
                            address: xoraddr.ip.to_string(),
                            port: xoraddr.port,
                            component: COMPONENT_RTP,
                            conn: Some(conn),
                            ..CandidateConfig::default()
                        },
                        rel_addr: laddr.ip().to_string(),
                        rel_port: laddr.port(),
                    };

                    match srflx_config.new_candidate_server_reflexive() {
                        Ok(candidate) => {
                            if let Err(err) =
                                params.runner.add_candidate(Arc::new(candidate)).await
                            {
                                log::warn!(
                                    "Failed to append to localCandidates and run onCandidateHdlr: {}",
                                    err
                                );
                            }
                        }
                        Err(err) => {
                            log::warn!(
                                "Failed to create server reflexive candidate: {} {} {}: {}",
                                network_type,
                                xoraddr.ip,
                                xoraddr.port,
                                err
                            );
                        }
                    }
                });
            }
        }

        wg.wait().await;
    }

    async fn gather_candidates_relay(params: GatherCandidatesInternalParams) {
        let wg = WaitGroup::new();

        for url in params.urls.iter() {
            if url.scheme != SchemeType::Turn && url.scheme != SchemeType::Turns {
                continue;
            }
            if url.username.is_empty() {
                log::error!("Failed to gather relay candidates: {}", Error::ErrUsernameEmpty);
                continue;
            }
            if url.password.is_empty() {
                log::error!("Failed to gather relay candidates: {}", Error::ErrPasswordEmpty);
                continue;
            }

            let w = wg.worker();
            let url = url.clone();
            let params = params.clone();
            tokio::spawn(async move {
                let _d = w;
                if let Err(err) = Self::gather_candidate_relay(&params, &url).await {
                    log::warn!("Failed to gather relay candidate from {}: {}", url, err);
                }
            });
        }

        wg.wait().await;
    }

    pub(crate) async fn gather_candidate_relay(
        params: &GatherCandidatesInternalParams,
        url: &Url,
    ) -> Result<()> {
        let turn_server_addr = host_port(&url.host, url.port);
        let use_ipv4 = relay_uses_ipv4(url, &params.network_types);

        let (loc_conn, rel_addr, rel_port, relay_protocol): (Arc<dyn Conn + Send + Sync>, _, _, _) =
            match (url.scheme, url.proto) {
                (SchemeType::Turn, ProtoType::Udp) => {
                    let any_ip = if use_ipv4 {
                        Ipv4Addr::UNSPECIFIED.into()
                    } else {
                        Ipv6Addr::UNSPECIFIED.into()
                    };
                    let conn = params.net.bind(SocketAddr::new(any_ip, 0)).await?;
                    let local_addr = conn.local_addr()?;
                    (
                        Arc::new(ControlConn::new(conn)),
                        local_addr.ip(),
                        local_addr.port(),
                        "udp",
                    )
                }
                (SchemeType::Turn, ProtoType::Tcp) => {
                    let server_addr = params.net.resolve_addr(use_ipv4, &turn_server_addr).await?;
                    let conn = tokio::select! {
                        result = dial_tcp(server_addr) => result?,
                        _ = wait_closed(params.closed_rx.clone()) => return Err(Error::ErrClosed),
                    };
                    let local_addr = conn.local_addr()?;
                    (
                        Arc::new(ControlConn::new(Arc::new(conn))),
                        local_addr.ip(),
                        local_addr.port(),
                        "tcp",
                    )
                }
                (SchemeType::Turns, ProtoType::Tcp) => {
                    let server_addr = params.net.resolve_addr(use_ipv4, &turn_server_addr).await?;
                    let conn = tokio::select! {
                        result = dial_tls(server_addr, &url.host, params.insecure_skip_verify) => result?,
                        _ = wait_closed(params.closed_rx.clone()) => return Err(Error::ErrClosed),
                    };
                    let local_addr = conn.local_addr()?;
                    (
                        Arc::new(ControlConn::new(Arc::new(conn))),
                        local_addr.ip(),
                        local_addr.port(),
                        "tls",
                    )
                }
                (SchemeType::Turns, ProtoType::Udp) => {
                    let server_addr = params.net.resolve_addr(use_ipv4, &turn_server_addr).await?;
                    let conn = tokio::select! {
                        result = dial_dtls(&params.net, server_addr, &url.host, params.insecure_skip_verify) => result?,
                        _ = wait_closed(params.closed_rx.clone()) => return Err(Error::ErrClosed),
                    };
                    let local_addr = Conn::local_addr(&conn)?;
                    (
                        Arc::new(ControlConn::connected(Arc::new(conn), server_addr)),
                        local_addr.ip(),
                        local_addr.port(),
                        "dtls",
                    )
                }
                _ => return Err(Error::ErrUnsupportedRelayTransport),
            };

        let cfg = turn::client::ClientConfig {
            stun_serv_addr: String::new(),
            turn_serv_addr: turn_server_addr,
            username: url.username.clone(),
            password: url.password.clone(),
            realm: String::new(),
            software: String::new(),
            rto_in_ms: 0,
            conn: Arc::clone(&loc_conn),
            vnet: Some(Arc::clone(&params.net)),
        };

        let client = match turn::client::Client::new(cfg).await {
            Ok(client) => Arc::new(client),
            Err(err) => {
                let _ = loc_conn.close().await;
                return Err(err.into());
            }
        };

        if let Err(err) = client.listen().await {
            let _ = client.close().await;
            let _ = loc_conn.close().await;
            return Err(err.into());
        }

        let relay_conn = tokio::select! {
            result = client.allocate() => match result {
                Ok(relay_conn) => relay_conn,
                Err(err) => {
                    let _ = client.close().await;
                    let _ = loc_conn.close().await;
                    return Err(err.into());
                }
            },
            _ = wait_closed(params.closed_rx.clone()) => {
                let _ = client.close().await;
                let _ = loc_conn.close().await;
                return Err(Error::ErrClosed);
            }
        };

        let raddr = relay_conn.local_addr()?;
        let relay_config = CandidateRelayConfig {
            base_config: CandidateConfig {
                network: UDP.to_owned(),
                address: raddr.ip().to_string(),
                port: raddr.port(),
                component: COMPONENT_RTP,
                conn: Some(Arc::new(relay_conn)),
                ..CandidateConfig::default()
            },
            rel_addr: rel_addr.to_string(),
            rel_port,
            relay_protocol: relay_protocol.to_owned(),
            relay_client: Some(Arc::clone(&client)),
            relay_control_conn: Some(Arc::clone(&loc_conn)),
        };

        let candidate = match relay_config.new_candidate_relay() {
            Ok(candidate) => Arc::new(candidate),
            Err(err) => {
                let _ = client.close().await;
                let _ = loc_conn.close().await;
                return Err(err);
            }
        };

        params.runner.add_candidate(candidate).await
    }
}

/// Joins `host` and `port`, bracketing IPv6 literals.
fn host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Address family used towards a TURN server: the one of an IP literal host, otherwise IPv4
/// unless only IPv6 network types are enabled.
pub(crate) fn relay_uses_ipv4(url: &Url, network_types: &[NetworkType]) -> bool {
    match url.host.parse::<IpAddr>() {
        Ok(ip) => ip.is_ipv4(),
        Err(_) => network_types.is_empty() || network_types.iter().any(|t| t.is_ipv4()),
    }
}

fn unspecified_ip(network_type: NetworkType) -> IpAddr {
    if network_type.is_ipv4() {
        Ipv4Addr::UNSPECIFIED.into()
    } else {
        Ipv6Addr::UNSPECIFIED.into()
    }
}

fn is_link_local_v6(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

/// Lists the addresses host candidates are gathered on, after applying the interface and IP
/// filters and the configured network types.
pub(crate) async fn local_interfaces(
    net: &Arc<Net>,
    interface_filter: &Arc<Option<InterfaceFilterFn>>,
    ip_filter: &Arc<Option<IpFilterFn>>,
    network_types: &[NetworkType],
    include_loopback: bool,
) -> Vec<IpAddr> {
    let mut ips = vec![];
    let interfaces = net.get_interfaces().await;

    let (mut ipv4_requested, mut ipv6_requested) = (false, false);
    for typ in network_types {
        if typ.is_ipv4() {
            ipv4_requested = true;
        }
        if typ.is_ipv6() {
            ipv6_requested = true;
        }
    }

    for iface in interfaces {
        if let Some(filter) = interface_filter.as_ref() {
            if !filter(iface.name()) {
                continue;
            }
        }

        for ipnet in iface.addrs() {
            let ip = ipnet.addr();

            if ip.is_loopback() && !include_loopback {
                continue;
            }

            let family_ok = match ip {
                IpAddr::V4(_) => ipv4_requested,
                IpAddr::V6(v6) => ipv6_requested && !is_link_local_v6(&v6),
            };
            if !family_ok {
                continue;
            }

            if let Some(filter) = ip_filter.as_ref() {
                if !filter(ip) {
                    continue;
                }
            }

            if !ips.contains(&ip) {
                ips.push(ip);
            }
        }
    }

    ips
}

/// Binds a UDP socket on `laddr.ip()` with a port from `[port_min, port_max]`, starting the
/// search at a random port. A zero bound means the range is open on that side.
pub(crate) async fn listen_udp_in_port_range(
    net: &Arc<Net>,
    port_max: u16,
    port_min: u16,
    laddr: SocketAddr,
) -> Result<Arc<dyn Conn + Send + Sync>> {
    if laddr.port() != 0 || (port_min == 0 && port_max == 0) {
        return Ok(net.bind(laddr).await?);
    }

    let i = if port_min == 0 { 1 } else { port_min };
    let j = if port_max == 0 { 0xFFFF } else { port_max };
    if i > j {
        return Err(Error::ErrPort);
    }

    let port_start = thread_rng().gen_range(i..=j);
    let mut port_current = port_start;
    loop {
        let addr = SocketAddr::new(laddr.ip(), port_current);
        match net.bind(addr).await {
            Ok(conn) => return Ok(conn),
            Err(err) => log::debug!("failed to listen {}: {}", addr, err),
        };

        port_current = if port_current >= j { i } else { port_current + 1 };
        if port_current == port_start {
            break;
        }
    }

    Err(Error::ErrPort)
}

/// Sends a STUN Binding request to `server_addr` over `conn` and returns the XOR-MAPPED-ADDRESS
/// of the answer.
pub(crate) async fn get_xormapped_addr(
    conn: &Arc<dyn Conn + Send + Sync>,
    server_addr: SocketAddr,
    deadline: Duration,
) -> Result<XorMappedAddress> {
    let mut req = Message::new();
    req.build(&[Box::new(TransactionId::new()), Box::new(BINDING_REQUEST)])?;

    conn.send_to(&req.raw, server_addr).await?;

    let mut buf = vec![0u8; RECEIVE_MTU];
    let res = tokio::time::timeout(deadline, async {
        loop {
            let (n, src) = conn.recv_from(&mut buf).await?;
            if src != server_addr || !is_message(&buf[..n]) {
                continue;
            }

            let mut res = Message {
                raw: buf[..n].to_vec(),
                ..Message::default()
            };
            if res.decode().is_err() || res.transaction_id != req.transaction_id {
                continue;
            }
            return Ok::<Message, Error>(res);
        }
    })
    .await
    .map_err(|_| Error::ErrGetXorMappedAddrResponse)??;

    let mut addr = XorMappedAddress::default();
    addr.get_from(&res)?;
    Ok(addr)
}
