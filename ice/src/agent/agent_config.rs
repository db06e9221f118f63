use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use util::vnet::net::*;

use super::agent_internal::*;
use super::*;
use crate::error::*;
use crate::external_ip_mapper::ExternalIpMapper;
use crate::mdns::*;
use crate::network_type::*;
use crate::url::*;

/// The interval at which the agent runs its task loop while connecting.
pub(crate) const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(2);

/// The interval used to keep candidates alive.
pub(crate) const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// The default time without traffic till the selected pair is dropped and the agent goes
/// disconnected.
pub(crate) const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Time after which the controlling agent nominates the best valid pair regardless of the
/// acceptance waits.
pub(crate) const DEFAULT_CANDIDATE_SELECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Wait time before nominating a host candidate.
pub(crate) const DEFAULT_HOST_ACCEPTANCE_MIN_WAIT: Duration = Duration::from_secs(0);

/// Wait time before nominating a srflx candidate.
pub(crate) const DEFAULT_SRFLX_ACCEPTANCE_MIN_WAIT: Duration = Duration::from_millis(500);

/// Wait time before nominating a prflx candidate.
pub(crate) const DEFAULT_PRFLX_ACCEPTANCE_MIN_WAIT: Duration = Duration::from_millis(1000);

/// Wait time before nominating a relay candidate.
pub(crate) const DEFAULT_RELAY_ACCEPTANCE_MIN_WAIT: Duration = Duration::from_millis(2000);

/// Max binding request before considering a pair failed.
pub(crate) const DEFAULT_MAX_BINDING_REQUESTS: u16 = 7;

/// The number of bytes that can be buffered before we start to error.
pub(crate) const MAX_BUFFER_SIZE: usize = 1000 * 1000; // 1MB

/// Wait time before binding requests can be deleted.
pub(crate) const MAX_BINDING_REQUEST_TIMEOUT: Duration = Duration::from_millis(500);

/// How long a srflx gathering attempt waits for the STUN server.
pub(crate) const STUN_GATHER_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) fn default_candidate_types() -> Vec<CandidateType> {
    vec![
        CandidateType::Host,
        CandidateType::ServerReflexive,
        CandidateType::Relay,
    ]
}

pub type InterfaceFilterFn = Box<dyn (Fn(&str) -> bool) + Send + Sync>;
pub type IpFilterFn = Box<dyn (Fn(IpAddr) -> bool) + Send + Sync>;

/// Collects the arguments to `ice::Agent` construction into a single structure, for
/// future-proofness of the interface.
#[derive(Default)]
pub struct AgentConfig {
    pub urls: Vec<Url>,

    /// Lower bound of the port range used for local sockets. 0 means no bound.
    pub port_min: u16,
    /// Upper bound of the port range used for local sockets. 0 means no bound.
    pub port_max: u16,

    /// It is used to perform connectivity checks. The values MUST be unguessable, with at least
    /// 128 bits of random number generator output used to generate the password, and at least 24
    /// bits of output to generate the username fragment.
    pub local_ufrag: String,
    /// It is used to perform connectivity checks. The values MUST be unguessable, with at least
    /// 128 bits of random number generator output used to generate the password, and at least 24
    /// bits of output to generate the username fragment.
    pub local_pwd: String,

    /// When false, `gather_candidates` only returns once gathering completed.
    pub trickle: bool,

    /// Controls mDNS behavior for the ICE agent.
    pub multicast_dns_mode: MulticastDnsMode,

    /// Controls the hostname for this agent. If none is specified a random one will be generated.
    pub multicast_dns_host_name: String,

    /// Defaults to 5 seconds when this property is nil.
    pub multicast_dns_query_timeout: Option<Duration>,

    /// Overrides the multicast group address, mostly useful for tests.
    pub multicast_dns_dest_addr: String,

    /// Defaults to 30 seconds when this property is nil.
    /// If the duration is 0, the selected pair never times out.
    pub connection_timeout: Option<Duration>,

    /// Determines how often should we send ICE keepalives (should be less then
    /// connection_timeout above) when this is nil, it defaults to 10 seconds.
    /// A keepalive interval of 0 means we never send keepalive packets
    pub keepalive_interval: Option<Duration>,

    /// Controls how often our internal task loop runs when in the connecting state.
    /// Only useful for testing.
    pub check_interval: Duration,

    /// An optional configuration for disabling or enabling support for specific network types.
    pub network_types: Vec<NetworkType>,

    /// An optional configuration for disabling or enabling support for specific candidate types.
    pub candidate_types: Vec<CandidateType>,

    /// The max amount of binding requests the agent will send over a candidate pair for validation
    /// or nomination, if after max_binding_requests the candidate is yet to answer a binding
    /// request or a nomination we set the pair as failed.
    pub max_binding_requests: Option<u16>,

    /// Defaults to 10 seconds. Past it the controlling agent nominates the best valid pair
    /// without waiting for the per type acceptance delays.
    pub candidate_selection_timeout: Option<Duration>,

    /// Lite agents do not perform connectivity check and only provide host candidates.
    pub lite: bool,

    /// Specifies the candidate type the 1:1 NAT IP addresses are announced as.
    /// Either host (default) or srflx.
    pub nat_1to1_ip_candidate_type: CandidateType,

    /// External IP addresses of 1:1 (D)NAT, each either `ext` or `ext/local`.
    pub nat_1to1_ips: Vec<String>,

    /// Specify a minimum wait time before selecting host candidates.
    pub host_acceptance_min_wait: Option<Duration>,
    /// Specify a minimum wait time before selecting srflx candidates.
    pub srflx_acceptance_min_wait: Option<Duration>,
    /// Specify a minimum wait time before selecting prflx candidates.
    pub prflx_acceptance_min_wait: Option<Duration>,
    /// Specify a minimum wait time before selecting relay candidates.
    pub relay_acceptance_min_wait: Option<Duration>,

    /// Network abstraction used for interfaces, sockets and name resolution.
    /// Defaults to the native stack.
    pub net: Option<Arc<Net>>,

    /// A function that you can use in order to whitelist or blacklist the interfaces which are
    /// used to gather ICE candidates.
    pub interface_filter: Arc<Option<InterfaceFilterFn>>,

    /// A function that you can use in order to whitelist or blacklist the ips which are used to
    /// gather ICE candidates.
    pub ip_filter: Arc<Option<IpFilterFn>>,

    /// Gather host candidates on loopback addresses as well.
    pub include_loopback: bool,

    /// Controls if self-signed certificates are accepted when connecting to TURN servers via TLS.
    pub insecure_skip_verify: bool,
}

impl AgentConfig {
    /// Populates an agent and falls back to defaults if fields are unset.
    pub(crate) fn init_with_defaults(&self, a: &mut AgentInternal) {
        a.max_binding_requests = self
            .max_binding_requests
            .unwrap_or(DEFAULT_MAX_BINDING_REQUESTS);

        a.host_acceptance_min_wait = self
            .host_acceptance_min_wait
            .unwrap_or(DEFAULT_HOST_ACCEPTANCE_MIN_WAIT);
        a.srflx_acceptance_min_wait = self
            .srflx_acceptance_min_wait
            .unwrap_or(DEFAULT_SRFLX_ACCEPTANCE_MIN_WAIT);
        a.prflx_acceptance_min_wait = self
            .prflx_acceptance_min_wait
            .unwrap_or(DEFAULT_PRFLX_ACCEPTANCE_MIN_WAIT);
        a.relay_acceptance_min_wait = self
            .relay_acceptance_min_wait
            .unwrap_or(DEFAULT_RELAY_ACCEPTANCE_MIN_WAIT);

        a.connection_timeout = self
            .connection_timeout
            .unwrap_or(DEFAULT_CONNECTION_TIMEOUT);
        a.keepalive_interval = self
            .keepalive_interval
            .unwrap_or(DEFAULT_KEEPALIVE_INTERVAL);
        a.candidate_selection_timeout = self
            .candidate_selection_timeout
            .unwrap_or(DEFAULT_CANDIDATE_SELECTION_TIMEOUT);

        if self.check_interval == Duration::from_secs(0) {
            a.check_interval = DEFAULT_CHECK_INTERVAL;
        } else {
            a.check_interval = self.check_interval;
        }
    }

    pub(crate) fn init_ext_ip_mapping(
        &self,
        mdns_mode: MulticastDnsMode,
        candidate_types: &[CandidateType],
    ) -> Result<Option<ExternalIpMapper>> {
        let ext_ip_mapper =
            ExternalIpMapper::new(self.nat_1to1_ip_candidate_type, &self.nat_1to1_ips)?;

        if let Some(m) = &ext_ip_mapper {
            if m.candidate_type == CandidateType::Host {
                if mdns_mode == MulticastDnsMode::QueryAndGather {
                    return Err(Error::ErrMulticastDnsWithNat1to1IpMapping);
                }
                if !contains_candidate_type(CandidateType::Host, candidate_types) {
                    return Err(Error::ErrIneffectiveNat1to1IpMappingHost);
                }
            } else if m.candidate_type == CandidateType::ServerReflexive
                && !contains_candidate_type(CandidateType::ServerReflexive, candidate_types)
            {
                return Err(Error::ErrIneffectiveNat1to1IpMappingSrflx);
            }
        }

        Ok(ext_ip_mapper)
    }
}
