#[cfg(test)]
mod agent_transport_test;

pub mod agent_config;
pub mod agent_gather;
pub(crate) mod agent_internal;
pub(crate) mod agent_runner;
pub mod agent_selector;
pub mod agent_stats;
pub mod agent_transport;

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use agent_config::*;
use agent_internal::*;
use agent_runner::*;
use agent_transport::*;
use arc_swap::ArcSwapOption;
use mdns::conn::DnsConn;
use stun::agent::TransactionId;
use stun::attributes::*;
use stun::integrity::*;
use stun::message::*;
use stun::textattrs::*;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use util::vnet::net::*;

use crate::candidate::candidate_pair::*;
use crate::candidate::*;
use crate::error::*;
use crate::external_ip_mapper::ExternalIpMapper;
use crate::mdns::*;
use crate::network_type::*;
use crate::state::*;
use crate::url::*;

#[derive(Debug, Clone)]
pub(crate) struct BindingRequest {
    pub(crate) timestamp: Instant,
    pub(crate) transaction_id: TransactionId,
    pub(crate) destination: SocketAddr,
    pub(crate) is_use_candidate: bool,
}

impl Default for BindingRequest {
    fn default() -> Self {
        Self {
            timestamp: Instant::now(),
            transaction_id: TransactionId::default(),
            destination: SocketAddr::new(Ipv4Addr::new(0, 0, 0, 0).into(), 0),
            is_use_candidate: false,
        }
    }
}

#[derive(Default, Clone)]
pub(crate) struct UfragPwd {
    pub(crate) local_ufrag: String,
    pub(crate) local_pwd: String,
    pub(crate) remote_ufrag: String,
    pub(crate) remote_pwd: String,
}

pub(crate) fn assert_inbound_username(m: &Message, expected_username: &str) -> Result<()> {
    let mut username = Username::new(ATTR_USERNAME, String::new());
    username.get_from(m)?;

    if username.to_string() != expected_username {
        return Err(Error::Other(format!(
            "{:?} expected({}) actual({})",
            Error::ErrMismatchUsername,
            expected_username,
            username,
        )));
    }

    Ok(())
}

pub(crate) fn assert_inbound_message_integrity(m: &mut Message, key: &[u8]) -> Result<()> {
    let message_integrity_attr = MessageIntegrity(key.to_vec());
    Ok(message_integrity_attr.check(m)?)
}

pub type OnConnectionStateChangeHdlrFn = Box<
    dyn (FnMut(ConnectionState) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>)
        + Send
        + Sync,
>;
pub type OnSelectedCandidatePairChangeHdlrFn = Box<
    dyn (FnMut(&Arc<Candidate>, &Arc<Candidate>) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>)
        + Send
        + Sync,
>;
pub type OnCandidateHdlrFn = Box<
    dyn (FnMut(Option<Arc<Candidate>>) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>)
        + Send
        + Sync,
>;

#[derive(Default)]
pub(crate) struct AgentHandlers {
    pub(crate) on_connection_state_change_hdlr: ArcSwapOption<Mutex<OnConnectionStateChangeHdlrFn>>,
    pub(crate) on_selected_candidate_pair_change_hdlr:
        ArcSwapOption<Mutex<OnSelectedCandidatePairChangeHdlrFn>>,
    pub(crate) on_candidate_hdlr: ArcSwapOption<Mutex<OnCandidateHdlrFn>>,
}

impl AgentHandlers {
    async fn on_connection_state_change(&self, s: ConnectionState) {
        if let Some(handler) = self.on_connection_state_change_hdlr.load_full() {
            let mut f = handler.lock().await;
            f(s).await;
        }
    }

    async fn on_selected_candidate_pair_change(&self, p: &CandidatePair) {
        if let Some(handler) = self.on_selected_candidate_pair_change_hdlr.load_full() {
            let mut f = handler.lock().await;
            f(&p.local, &p.remote).await;
        }
    }

    async fn on_candidate(&self, c: Option<Arc<Candidate>>) {
        if let Some(handler) = self.on_candidate_hdlr.load_full() {
            let mut f = handler.lock().await;
            f(c).await;
        }
    }

    /// Delivers the events queued by the agent state to the user handlers, outside the agent
    /// lock and in order. Ends once the agent dropped its senders.
    fn start_on_connection_state_change_routine(
        self: &Arc<Self>,
        chan_receivers: ChanReceivers,
    ) -> (mpsc::Receiver<()>, mpsc::Receiver<()>) {
        let ChanReceivers {
            mut chan_state_rx,
            mut chan_candidate_rx,
            mut chan_candidate_pair_rx,
            force_candidate_contact_rx,
            on_connected_rx,
        } = chan_receivers;

        let handlers = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(p) = chan_candidate_pair_rx.recv().await {
                handlers.on_selected_candidate_pair_change(&p).await;
            }
        });

        let handlers = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    opt_state = chan_state_rx.recv() => {
                        if let Some(s) = opt_state {
                            handlers.on_connection_state_change(s).await;
                        } else {
                            while let Some(c) = chan_candidate_rx.recv().await {
                                handlers.on_candidate(c).await;
                            }
                            break;
                        }
                    },
                    opt_cand = chan_candidate_rx.recv() => {
                        if let Some(c) = opt_cand {
                            handlers.on_candidate(c).await;
                        } else {
                            while let Some(s) = chan_state_rx.recv().await {
                                handlers.on_connection_state_change(s).await;
                            }
                            break;
                        }
                    }
                }
            }
        });

        (force_candidate_contact_rx, on_connected_rx)
    }
}

/// Represents the ICE agent.
pub struct Agent {
    pub(crate) runner: AgentRunner,
    pub(crate) handlers: Arc<AgentHandlers>,
    pub(crate) closed_tx: watch::Sender<bool>,

    pub(crate) on_connected_rx: Mutex<Option<mpsc::Receiver<()>>>,
    pub(crate) force_candidate_contact_rx: Mutex<Option<mpsc::Receiver<()>>>,
    pub(crate) gather_handle: Mutex<Option<JoinHandle<()>>>,

    pub(crate) trickle: bool,
    pub(crate) candidate_types: Vec<CandidateType>,
    pub(crate) urls: Vec<Url>,
    pub(crate) network_types: Vec<NetworkType>,
    pub(crate) port_min: u16,
    pub(crate) port_max: u16,

    pub(crate) mdns_mode: MulticastDnsMode,
    pub(crate) mdns_name: String,
    pub(crate) mdns_query_timeout: Duration,

    pub(crate) net: Arc<Net>,
    pub(crate) interface_filter: Arc<Option<InterfaceFilterFn>>,
    pub(crate) ip_filter: Arc<Option<IpFilterFn>>,
    pub(crate) include_loopback: bool,
    pub(crate) ext_ip_mapper: Arc<Option<ExternalIpMapper>>,
    pub(crate) insecure_skip_verify: bool,
}

impl Agent {
    /// Creates a new Agent.
    pub async fn new(config: AgentConfig) -> Result<Self> {
        if config.port_max < config.port_min {
            return Err(Error::ErrInvalidPortRange);
        }

        let mdns_name = if config.multicast_dns_host_name.is_empty() {
            generate_multicast_dns_name()
        } else {
            config.multicast_dns_host_name.clone()
        };
        if !is_valid_multicast_dns_name(&mdns_name) {
            return Err(Error::ErrInvalidMulticastDnshostName);
        }
        let mdns_mode = config.multicast_dns_mode;

        let candidate_types = if config.candidate_types.is_empty() {
            default_candidate_types()
        } else {
            config.candidate_types.clone()
        };

        if config.lite && (candidate_types.len() != 1 || candidate_types[0] != CandidateType::Host)
        {
            return Err(Error::ErrLiteUsingNonHostCandidates);
        }

        if !config.urls.is_empty()
            && !contains_candidate_type(CandidateType::ServerReflexive, &candidate_types)
            && !contains_candidate_type(CandidateType::Relay, &candidate_types)
        {
            return Err(Error::ErrUselessUrlsProvided);
        }

        let ext_ip_mapper = config.init_ext_ip_mapping(mdns_mode, &candidate_types)?;

        let net = match &config.net {
            Some(net) => {
                if net.is_virtual() {
                    log::warn!("vnet is enabled");
                }
                Arc::clone(net)
            }
            None => Arc::new(Net::new(None)),
        };

        let network_types = if config.network_types.is_empty() {
            supported_network_types()
        } else {
            config.network_types.clone()
        };

        let agent_conn = Arc::new(AgentConn::new());
        let (mut ai, chan_receivers) = AgentInternal::new(&config, Arc::clone(&agent_conn));
        config.init_with_defaults(&mut ai);

        // Restart is also used to initialize the agent for the first time
        ai.restart(config.local_ufrag.clone(), config.local_pwd.clone())?;

        ai.mdns_conn = match create_multicast_dns(
            mdns_mode,
            &mdns_name,
            &config.multicast_dns_dest_addr,
        ) {
            Ok(c) => c,
            Err(err) => {
                // Opportunistic mDNS: If we can't open the connection, that's ok: we
                // can continue without it.
                log::warn!("Failed to initialize mDNS {}: {}", mdns_name, err);
                None
            }
        };

        let handlers = Arc::new(AgentHandlers::default());
        let (force_candidate_contact_rx, on_connected_rx) =
            handlers.start_on_connection_state_change_routine(chan_receivers);

        let (closed_tx, closed_rx) = watch::channel(false);
        let runner = AgentRunner {
            internal: Arc::new(Mutex::new(ai)),
            agent_conn,
            closed_rx,
        };

        Ok(Self {
            runner,
            handlers,
            closed_tx,

            on_connected_rx: Mutex::new(Some(on_connected_rx)),
            force_candidate_contact_rx: Mutex::new(Some(force_candidate_contact_rx)),
            gather_handle: Mutex::new(None),

            trickle: config.trickle,
            candidate_types,
            urls: config.urls.clone(),
            network_types,
            port_min: config.port_min,
            port_max: config.port_max,

            mdns_mode,
            mdns_name,
            mdns_query_timeout: config
                .multicast_dns_query_timeout
                .unwrap_or(DEFAULT_MDNS_QUERY_TIMEOUT),

            net,
            interface_filter: Arc::clone(&config.interface_filter),
            ip_filter: Arc::clone(&config.ip_filter),
            include_loopback: config.include_loopback,
            ext_ip_mapper: Arc::new(ext_ip_mapper),
            insecure_skip_verify: config.insecure_skip_verify,
        })
    }

    pub fn get_bytes_received(&self) -> usize {
        self.runner.agent_conn.bytes_received()
    }

    pub fn get_bytes_sent(&self) -> usize {
        self.runner.agent_conn.bytes_sent()
    }

    /// Sets a handler that is fired when the connection state changes.
    pub fn on_connection_state_change(&self, f: OnConnectionStateChangeHdlrFn) {
        self.handlers
            .on_connection_state_change_hdlr
            .store(Some(Arc::new(Mutex::new(f))));
    }

    /// Sets a handler that is fired when the final candidate pair is selected.
    pub fn on_selected_candidate_pair_change(&self, f: OnSelectedCandidatePairChangeHdlrFn) {
        self.handlers
            .on_selected_candidate_pair_change_hdlr
            .store(Some(Arc::new(Mutex::new(f))));
    }

    /// Sets a handler that is fired when new candidates gathered. When the gathering process
    /// complete the last candidate is nil.
    pub fn on_candidate(&self, f: OnCandidateHdlrFn) {
        self.handlers
            .on_candidate_hdlr
            .store(Some(Arc::new(Mutex::new(f))));
    }

    /// Adds a new remote candidate. A `.local` host candidate is resolved through mDNS first
    /// and only added once its address is known.
    pub async fn add_remote_candidate(&self, c: Candidate) -> Result<()> {
        if c.candidate_type() == CandidateType::Host && is_multicast_dns_address(c.address()) {
            let mdns_conn = self.runner.run(|ai| ai.mdns_conn.clone()).await?;
            let mdns_conn = match mdns_conn {
                Some(mdns_conn) => mdns_conn,
                None => {
                    log::warn!(
                        "remote mDNS candidate added, but mDNS is disabled: ({})",
                        c.address()
                    );
                    return Ok(());
                }
            };

            let runner = self.runner.clone();
            let query_timeout = self.mdns_query_timeout;
            tokio::spawn(async move {
                Self::resolve_and_add_multicast_candidate(runner, mdns_conn, c, query_timeout)
                    .await;
            });
            return Ok(());
        }

        let c = Arc::new(c);
        self.runner.run(|ai| ai.add_remote_candidate(&c)).await
    }

    async fn resolve_and_add_multicast_candidate(
        runner: AgentRunner,
        mdns_conn: Arc<DnsConn>,
        mut c: Candidate,
        query_timeout: Duration,
    ) {
        let closed_rx = runner.closed_rx.clone();
        let ip = tokio::select! {
            result = resolve_multicast_dns(&mdns_conn, c.address(), query_timeout) => match result {
                Ok(ip) => ip,
                Err(err) => {
                    log::warn!("Failed to discover mDNS candidate {}: {}", c.address(), err);
                    return;
                }
            },
            _ = wait_closed(closed_rx) => return,
        };

        if let Err(err) = c.set_ip(&ip) {
            log::warn!("Failed to discover mDNS candidate {}: {}", c.address(), err);
            return;
        }

        let c = Arc::new(c);
        if let Err(err) = runner.run(|ai| ai.add_remote_candidate(&c)).await {
            log::warn!("Failed to add mDNS candidate {}: {}", c.address(), err);
        }
    }

    /// Returns the local candidates.
    pub async fn get_local_candidates(&self) -> Result<Vec<Arc<Candidate>>> {
        self.runner.run(|ai| ai.get_local_candidates()).await
    }

    /// Returns the local user credentials.
    pub async fn get_local_user_credentials(&self) -> Result<(String, String)> {
        self.runner
            .run(|ai| {
                (
                    ai.ufrag_pwd.local_ufrag.clone(),
                    ai.ufrag_pwd.local_pwd.clone(),
                )
            })
            .await
    }

    /// Returns the remote user credentials.
    pub async fn get_remote_user_credentials(&self) -> Result<(String, String)> {
        self.runner
            .run(|ai| {
                (
                    ai.ufrag_pwd.remote_ufrag.clone(),
                    ai.ufrag_pwd.remote_pwd.clone(),
                )
            })
            .await
    }

    /// Sets the credentials of the remote agent.
    pub async fn set_remote_credentials(
        &self,
        remote_ufrag: String,
        remote_pwd: String,
    ) -> Result<()> {
        self.runner
            .run(|ai| ai.set_remote_credentials(remote_ufrag, remote_pwd))
            .await?
    }

    /// Returns the selected pair or none if there is none.
    pub fn get_selected_candidate_pair(&self) -> Option<Arc<CandidatePair>> {
        self.runner.agent_conn.get_selected_pair()
    }

    /// Returns the current connection state, `Closed` once the agent was closed.
    pub async fn get_connection_state(&self) -> ConnectionState {
        self.runner
            .run(|ai| ai.connection_state)
            .await
            .unwrap_or(ConnectionState::Closed)
    }

    pub async fn get_gathering_state(&self) -> Result<GatheringState> {
        self.runner.run(|ai| ai.gathering_state).await
    }

    /// Restarts the ICE Agent with the provided ufrag/pwd
    /// If no ufrag/pwd is provided the Agent will generate one itself.
    ///
    /// Restart must only be called when `GatheringState` is `GatheringStateComplete`
    /// a user must then call `GatherCandidates` explicitly to start generating new ones.
    pub async fn restart(&self, ufrag: String, pwd: String) -> Result<()> {
        let released = self.runner.run(|ai| ai.restart(ufrag, pwd)).await??;
        close_candidates(released).await;
        Ok(())
    }

    /// Cleans up the Agent. Gathering, receive loops and the task loop stop, every candidate is
    /// closed and pending `connect`/`accept` calls fail with `ErrClosed`.
    pub async fn close(&self) -> Result<()> {
        if self.closed_tx.send_replace(true) {
            return Ok(());
        }

        let gather_handle = self.gather_handle.lock().await.take();
        if let Some(gather_handle) = gather_handle {
            if let Err(err) = gather_handle.await {
                log::warn!("gathering task failed: {}", err);
            }
        }

        let (released, mdns_conn) = {
            let mut ai = self.runner.internal.lock().await;
            ai.update_connection_state(ConnectionState::Closed);
            ai.set_selected_pair(None);
            ai.nominated_pair = None;
            ai.checklist.clear();
            let released = ai.delete_all_candidates();

            ai.chan_state_tx.take();
            ai.chan_candidate_tx.take();
            ai.chan_candidate_pair_tx.take();
            ai.on_connected_tx.take();

            (released, ai.mdns_conn.take())
        };

        close_candidates(released).await;
        self.runner.agent_conn.shutdown().await;

        if let Some(mdns_conn) = mdns_conn {
            if let Err(err) = mdns_conn.close().await {
                log::warn!("Failed to close mDNS Conn: {}", err);
            }
        }

        Ok(())
    }
}

async fn close_candidates(candidates: Vec<Arc<Candidate>>) {
    for c in candidates {
        if let Err(err) = c.close().await {
            log::debug!("Failed to close candidate {}: {}", c, err);
        }
    }
}
