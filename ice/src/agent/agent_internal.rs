use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mdns::conn::DnsConn;
use stun::agent::TransactionId;
use stun::attributes::*;
use stun::fingerprint::*;
use stun::integrity::*;
use stun::message::*;
use stun::xoraddr::*;
use tokio::sync::mpsc;

use super::agent_config::*;
use super::agent_transport::AgentConn;
use super::*;
use crate::attributes::{control::*, priority::*};
use crate::candidate::candidate_pair::*;
use crate::candidate::candidate_peer_reflexive::*;
use crate::rand::*;

/// Receiving ends of the channels owned by `AgentInternal`.
pub(crate) struct ChanReceivers {
    pub(crate) chan_state_rx: mpsc::UnboundedReceiver<ConnectionState>,
    pub(crate) chan_candidate_rx: mpsc::UnboundedReceiver<Option<Arc<Candidate>>>,
    pub(crate) chan_candidate_pair_rx: mpsc::UnboundedReceiver<Arc<CandidatePair>>,
    pub(crate) force_candidate_contact_rx: mpsc::Receiver<()>,
    pub(crate) on_connected_rx: mpsc::Receiver<()>,
}

/// The mutable state of an agent. Only ever touched through `AgentRunner::run`.
pub(crate) struct AgentInternal {
    pub(crate) tie_breaker: u64,
    pub(crate) is_controlling: bool,
    pub(crate) lite: bool,
    pub(crate) started: bool,

    pub(crate) start_time: Instant,

    pub(crate) connection_state: ConnectionState,
    pub(crate) gathering_state: GatheringState,

    pub(crate) ufrag_pwd: UfragPwd,

    pub(crate) local_candidates: HashMap<NetworkType, Vec<Arc<Candidate>>>,
    pub(crate) remote_candidates: HashMap<NetworkType, Vec<Arc<Candidate>>>,
    pub(crate) checklist: Vec<Arc<CandidatePair>>,
    pub(crate) nominated_pair: Option<Arc<CandidatePair>>,

    // LRU of outbound Binding request Transaction IDs
    pub(crate) pending_binding_requests: Vec<BindingRequest>,

    pub(crate) agent_conn: Arc<AgentConn>,
    pub(crate) mdns_conn: Option<Arc<DnsConn>>,

    pub(crate) chan_state_tx: Option<mpsc::UnboundedSender<ConnectionState>>,
    pub(crate) chan_candidate_tx: Option<mpsc::UnboundedSender<Option<Arc<Candidate>>>>,
    pub(crate) chan_candidate_pair_tx: Option<mpsc::UnboundedSender<Arc<CandidatePair>>>,
    pub(crate) force_candidate_contact_tx: mpsc::Sender<()>,
    pub(crate) on_connected_tx: Option<mpsc::Sender<()>>,

    // the following variables won't be changed after init_with_defaults()
    pub(crate) max_binding_requests: u16,
    pub(crate) host_acceptance_min_wait: Duration,
    pub(crate) srflx_acceptance_min_wait: Duration,
    pub(crate) prflx_acceptance_min_wait: Duration,
    pub(crate) relay_acceptance_min_wait: Duration,
    // How long the selected pair may stay silent before the agent goes disconnected
    pub(crate) connection_timeout: Duration,
    // How often should we send keepalive packets?
    // 0 means never
    pub(crate) keepalive_interval: Duration,
    // How often should we run our internal taskLoop to check for state changes when connecting
    pub(crate) check_interval: Duration,
    pub(crate) candidate_selection_timeout: Duration,
}

impl AgentInternal {
    pub(crate) fn new(config: &AgentConfig, agent_conn: Arc<AgentConn>) -> (Self, ChanReceivers) {
        let (chan_state_tx, chan_state_rx) = mpsc::unbounded_channel();
        let (chan_candidate_tx, chan_candidate_rx) = mpsc::unbounded_channel();
        let (chan_candidate_pair_tx, chan_candidate_pair_rx) = mpsc::unbounded_channel();
        let (force_candidate_contact_tx, force_candidate_contact_rx) = mpsc::channel(1);
        let (on_connected_tx, on_connected_rx) = mpsc::channel(1);

        let ai = AgentInternal {
            tie_breaker: generate_tie_breaker(),
            is_controlling: false,
            lite: config.lite,
            started: false,

            start_time: Instant::now(),

            connection_state: ConnectionState::New,
            gathering_state: GatheringState::New,

            ufrag_pwd: UfragPwd::default(),

            local_candidates: HashMap::new(),
            remote_candidates: HashMap::new(),
            checklist: vec![],
            nominated_pair: None,

            pending_binding_requests: vec![],

            agent_conn,
            mdns_conn: None,

            chan_state_tx: Some(chan_state_tx),
            chan_candidate_tx: Some(chan_candidate_tx),
            chan_candidate_pair_tx: Some(chan_candidate_pair_tx),
            force_candidate_contact_tx,
            on_connected_tx: Some(on_connected_tx),

            max_binding_requests: DEFAULT_MAX_BINDING_REQUESTS,
            host_acceptance_min_wait: DEFAULT_HOST_ACCEPTANCE_MIN_WAIT,
            srflx_acceptance_min_wait: DEFAULT_SRFLX_ACCEPTANCE_MIN_WAIT,
            prflx_acceptance_min_wait: DEFAULT_PRFLX_ACCEPTANCE_MIN_WAIT,
            relay_acceptance_min_wait: DEFAULT_RELAY_ACCEPTANCE_MIN_WAIT,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            check_interval: DEFAULT_CHECK_INTERVAL,
            candidate_selection_timeout: DEFAULT_CANDIDATE_SELECTION_TIMEOUT,
        };

        let chan_receivers = ChanReceivers {
            chan_state_rx,
            chan_candidate_rx,
            chan_candidate_pair_rx,
            force_candidate_contact_rx,
            on_connected_rx,
        };

        (ai, chan_receivers)
    }

    pub(crate) fn start_connectivity_checks(
        &mut self,
        is_controlling: bool,
        remote_ufrag: String,
        remote_pwd: String,
    ) -> Result<()> {
        if self.started {
            return Err(Error::ErrMultipleStart);
        }

        log::debug!(
            "Started agent: isControlling? {}, remoteUfrag: {}, remotePwd: {}",
            is_controlling,
            remote_ufrag,
            remote_pwd
        );
        self.set_remote_credentials(remote_ufrag, remote_pwd)?;
        self.started = true;

        self.is_controlling = is_controlling;
        for p in &self.checklist {
            p.set_ice_role_controlling(is_controlling);
        }
        self.start();

        self.update_connection_state(ConnectionState::Checking);
        self.request_connectivity_check();

        Ok(())
    }

    /// Sets the credentials of the remote agent.
    pub(crate) fn set_remote_credentials(
        &mut self,
        remote_ufrag: String,
        remote_pwd: String,
    ) -> Result<()> {
        if remote_ufrag.is_empty() {
            return Err(Error::ErrRemoteUfragEmpty);
        } else if remote_pwd.is_empty() {
            return Err(Error::ErrRemotePwdEmpty);
        }

        self.ufrag_pwd.remote_ufrag = remote_ufrag;
        self.ufrag_pwd.remote_pwd = remote_pwd;
        Ok(())
    }

    /// Installs fresh local credentials and drops every piece of session state. The released
    /// local candidates are handed back so the caller can close them.
    pub(crate) fn restart(&mut self, mut ufrag: String, mut pwd: String) -> Result<Vec<Arc<Candidate>>> {
        if ufrag.is_empty() {
            ufrag = generate_ufrag();
        }
        if pwd.is_empty() {
            pwd = generate_pwd();
        }

        if ufrag.len() * 8 < 24 {
            return Err(Error::ErrLocalUfragInsufficientBits);
        }
        if pwd.len() * 8 < 128 {
            return Err(Error::ErrLocalPwdInsufficientBits);
        }

        if self.gathering_state == GatheringState::Gathering {
            return Err(Error::ErrRestartWhenGathering);
        }
        self.gathering_state = GatheringState::New;

        // Clear all agent needed to take back to fresh state
        self.ufrag_pwd.local_ufrag = ufrag;
        self.ufrag_pwd.local_pwd = pwd;
        self.ufrag_pwd.remote_ufrag = String::new();
        self.ufrag_pwd.remote_pwd = String::new();

        self.pending_binding_requests = vec![];

        self.checklist = vec![];

        self.set_selected_pair(None);
        let released = self.delete_all_candidates();
        self.start();

        // Restart is used by Agent::new. Accept/Connect should be used to move to checking
        // for new Agents
        if self.connection_state != ConnectionState::New {
            self.update_connection_state(ConnectionState::Checking);
        }

        Ok(released)
    }

    pub(crate) fn set_gathering_state(&mut self, new_state: GatheringState) {
        if self.gathering_state != new_state {
            log::debug!(
                "[{}]: Setting new gathering state: {}",
                self.get_name(),
                new_state
            );
            self.gathering_state = new_state;

            if new_state == GatheringState::Complete {
                if let Some(tx) = &self.chan_candidate_tx {
                    let _ = tx.send(None);
                }
            }
        }
    }

    /// Interval until the next task loop round, the smallest of the configured ones that apply
    /// to the current state.
    pub(crate) fn task_loop_interval(&self) -> Duration {
        const ZERO_DURATION: Duration = Duration::from_secs(0);

        let mut interval = ZERO_DURATION;
        let mut update_interval = |x: Duration| {
            if x != ZERO_DURATION && (interval == ZERO_DURATION || interval > x) {
                interval = x;
            }
        };

        match self.connection_state {
            ConnectionState::New | ConnectionState::Checking => {
                // While connecting, check candidates more frequently
                update_interval(self.check_interval);
            }
            ConnectionState::Connected | ConnectionState::Disconnected => {
                update_interval(self.keepalive_interval);
            }
            _ => {}
        };
        // Ensure we run our task loop as quickly as the minimum of our various configured timeouts
        update_interval(self.connection_timeout);

        if interval == ZERO_DURATION {
            DEFAULT_CHECK_INTERVAL
        } else {
            interval
        }
    }

    /// One round of the task loop.
    pub(crate) fn contact(&mut self) {
        if self.connection_state == ConnectionState::Closed {
            return;
        }

        self.contact_candidates();

        if self.get_selected_pair().is_none()
            && !self.checklist.is_empty()
            && self
                .checklist
                .iter()
                .all(|p| p.state() == CandidatePairState::Failed)
        {
            // pairs built later from trickled candidates keep being checked
            self.update_connection_state(ConnectionState::Failed);
        }
    }

    pub(crate) fn update_connection_state(&mut self, new_state: ConnectionState) {
        if self.connection_state != new_state {
            log::info!(
                "[{}]: Setting new connection state: {}",
                self.get_name(),
                new_state
            );
            self.connection_state = new_state;

            // Call handler after finishing current task since we may be holding the agent lock
            // and the handler may also require it
            if let Some(tx) = &self.chan_state_tx {
                let _ = tx.send(new_state);
            }
        }
    }

    pub(crate) fn set_selected_pair(&mut self, p: Option<Arc<CandidatePair>>) {
        if let Some(p) = p {
            log::trace!(
                "[{}]: Set selected candidate pair: {:?}",
                self.get_name(),
                p
            );

            p.set_nominated(true);
            self.agent_conn.selected_pair.store(Some(Arc::clone(&p)));

            self.update_connection_state(ConnectionState::Connected);

            // Notify when the selected pair changes
            if let Some(tx) = &self.chan_candidate_pair_tx {
                let _ = tx.send(p);
            }

            // Signal connected
            self.on_connected_tx.take();

            // Querying is over and we no longer answer for our own name
            if let Some(mdns_conn) = self.mdns_conn.take() {
                tokio::spawn(async move {
                    if let Err(err) = mdns_conn.close().await {
                        log::warn!("failed to close mDNS Conn: {}", err);
                    }
                });
            }
        } else {
            self.agent_conn.selected_pair.store(None);
        }
    }

    pub(crate) fn get_selected_pair(&self) -> Option<Arc<CandidatePair>> {
        self.agent_conn.selected_pair.load_full()
    }

    pub(crate) fn ping_all_candidates(&mut self) {
        log::trace!("[{}]: pinging all candidates", self.get_name(),);

        if self.checklist.is_empty() {
            log::warn!(
                "[{}]: pingAllCandidates called with no candidate pairs. Connection is not possible yet.",
                self.get_name(),
            );
        }

        let mut pairs: Vec<(Arc<Candidate>, Arc<Candidate>)> = vec![];
        for p in &self.checklist {
            let state = p.state();
            if state == CandidatePairState::Waiting {
                p.set_state(CandidatePairState::InProgress);
            } else if state != CandidatePairState::InProgress {
                continue;
            }

            if p.binding_request_count() > self.max_binding_requests {
                log::trace!(
                    "[{}]: max requests reached for pair {}, marking it as failed",
                    self.get_name(),
                    p
                );
                p.set_state(CandidatePairState::Failed);
            } else {
                pairs.push((Arc::clone(&p.local), Arc::clone(&p.remote)));
            }
        }

        for (local, remote) in pairs {
            self.ping_candidate(&local, &remote);
        }
    }

    pub(crate) fn add_pair(&mut self, local: Arc<Candidate>, remote: Arc<Candidate>) {
        let p = Arc::new(CandidatePair::new(local, remote, self.is_controlling));
        self.checklist.push(p);
    }

    pub(crate) fn find_pair(
        &self,
        local: &Arc<Candidate>,
        remote: &Arc<Candidate>,
    ) -> Option<Arc<CandidatePair>> {
        self.checklist
            .iter()
            .find(|p| p.local.equal(local) && p.remote.equal(remote))
            .cloned()
    }

    /// Checks if the selected pair is (still) valid. A pair that stayed silent past the
    /// connection timeout is dropped and put back to Waiting.
    pub(crate) fn validate_selected_pair(&mut self) -> bool {
        let selected_pair = match self.get_selected_pair() {
            Some(p) => p,
            None => return false,
        };

        let disconnected_time =
            Instant::now().saturating_duration_since(selected_pair.remote.last_received());

        if self.connection_timeout != Duration::from_secs(0)
            && disconnected_time > self.connection_timeout
        {
            log::debug!(
                "[{}]: no traffic on the selected pair for {:?}: {}",
                self.get_name(),
                disconnected_time,
                selected_pair
            );
            self.set_selected_pair(None);
            selected_pair.reset();
            self.nominated_pair = None;
            self.update_connection_state(ConnectionState::Disconnected);
            false
        } else {
            self.update_connection_state(ConnectionState::Connected);
            true
        }
    }

    /// Sends STUN Binding Requests to the selected pair
    /// if no packet has been sent on that pair in the last keepaliveInterval.
    pub(crate) fn check_keepalive(&mut self) {
        let selected_pair = match self.get_selected_pair() {
            Some(p) => p,
            None => return,
        };

        let now = Instant::now();
        let last_sent = now.saturating_duration_since(selected_pair.local.last_sent());
        let last_received = now.saturating_duration_since(selected_pair.remote.last_received());

        if (self.keepalive_interval != Duration::from_secs(0))
            && ((last_sent > self.keepalive_interval) || (last_received > self.keepalive_interval))
        {
            // we use binding request instead of indication to support refresh consent schemas
            // see https://tools.ietf.org/html/rfc7675
            self.ping_candidate(&selected_pair.local, &selected_pair.remote);
        }
    }

    pub(crate) fn request_connectivity_check(&self) {
        let _ = self.force_candidate_contact_tx.try_send(());
    }

    /// Registers a gathered local candidate and pairs it with the known remotes.
    /// Returns false if a structurally equal candidate is already known.
    pub(crate) fn add_candidate(&mut self, c: &Arc<Candidate>) -> bool {
        let network_type = c.network_type();

        if let Some(cands) = self.local_candidates.get(&network_type) {
            if cands.iter().any(|cand| cand.equal(c)) {
                return false;
            }
        }

        self.local_candidates
            .entry(network_type)
            .or_default()
            .push(Arc::clone(c));

        let remotes = self
            .remote_candidates
            .get(&network_type)
            .cloned()
            .unwrap_or_default();
        for remote in remotes {
            self.add_pair(Arc::clone(c), remote);
        }

        self.request_connectivity_check();

        if let Some(tx) = &self.chan_candidate_tx {
            let _ = tx.send(Some(Arc::clone(c)));
        }

        true
    }

    /// Adds a remote candidate and pairs it with the local candidates of its network type.
    pub(crate) fn add_remote_candidate(&mut self, c: &Arc<Candidate>) {
        let network_type = c.network_type();

        if let Some(cands) = self.remote_candidates.get(&network_type) {
            if cands.iter().any(|cand| cand.equal(c)) {
                return;
            }
        }

        self.remote_candidates
            .entry(network_type)
            .or_default()
            .push(Arc::clone(c));

        let locals = self
            .local_candidates
            .get(&network_type)
            .cloned()
            .unwrap_or_default();
        for local in locals {
            self.add_pair(local, Arc::clone(c));
        }

        self.request_connectivity_check();
    }

    /// Remove all candidates.
    /// This removes both the local and remote candidate lists and hands the local ones back,
    /// their sockets still have to be closed.
    ///
    /// This is used for restarts and on close.
    pub(crate) fn delete_all_candidates(&mut self) -> Vec<Arc<Candidate>> {
        let mut released = vec![];
        for (_, cands) in self.local_candidates.drain() {
            released.extend(cands);
        }
        for (_, cands) in self.remote_candidates.drain() {
            released.extend(cands);
        }
        released
    }

    pub(crate) fn get_local_candidates(&self) -> Vec<Arc<Candidate>> {
        self.local_candidates
            .values()
            .flat_map(|cands| cands.iter().cloned())
            .collect()
    }

    /// Finds the remote candidate with transport address `addr`. A signalled candidate wins over
    /// a peer reflexive one learned for the same address.
    pub(crate) fn find_remote_candidate(
        &self,
        network_type: NetworkType,
        addr: SocketAddr,
    ) -> Option<Arc<Candidate>> {
        let cands = self.remote_candidates.get(&network_type)?;

        let mut prflx = None;
        for c in cands {
            if c.addr() == addr {
                if c.candidate_type() != CandidateType::PeerReflexive {
                    return Some(Arc::clone(c));
                }
                prflx.get_or_insert_with(|| Arc::clone(c));
            }
        }
        prflx
    }

    pub(crate) fn send_binding_request(
        &mut self,
        m: &Message,
        local: &Arc<Candidate>,
        remote: &Arc<Candidate>,
    ) {
        log::trace!(
            "[{}]: ping STUN from {} to {}",
            self.get_name(),
            local,
            remote
        );

        self.invalidate_pending_binding_requests(Instant::now());
        self.pending_binding_requests.push(BindingRequest {
            timestamp: Instant::now(),
            transaction_id: m.transaction_id,
            destination: remote.addr(),
            is_use_candidate: m.contains(ATTR_USE_CANDIDATE),
        });

        if let Some(p) = self.find_pair(local, remote) {
            p.on_request_sent();
        }

        self.send_stun(m, local, remote);
    }

    pub(crate) fn send_binding_success(
        &self,
        m: &Message,
        local: &Arc<Candidate>,
        remote: &Arc<Candidate>,
    ) {
        let addr = remote.addr();
        let (ip, port) = (addr.ip(), addr.port());
        let local_pwd = self.ufrag_pwd.local_pwd.clone();

        let (out, result) = {
            let mut out = Message::new();
            let result = out.build(&[
                Box::new(m.clone()),
                Box::new(BINDING_SUCCESS),
                Box::new(XorMappedAddress { ip, port }),
                Box::new(MessageIntegrity::new_short_term_integrity(local_pwd)),
                Box::new(FINGERPRINT),
            ]);
            (out, result)
        };

        if let Err(err) = result {
            log::warn!(
                "[{}]: Failed to handle inbound ICE from: {} to: {} error: {}",
                self.get_name(),
                local,
                remote,
                err
            );
        } else {
            self.send_stun(&out, local, remote);
        }
    }

    /// Removes pending binding requests that are over `MAX_BINDING_REQUEST_TIMEOUT` old. Let HTO
    /// be the transaction timeout, which SHOULD be 2*RTT if RTT is known or 500 ms otherwise.
    ///
    /// reference: (IETF ref-8445)[https://tools.ietf.org/html/rfc8445#appendix-B.1].
    pub(crate) fn invalidate_pending_binding_requests(&mut self, filter_time: Instant) {
        let initial_size = self.pending_binding_requests.len();

        self.pending_binding_requests.retain(|binding_request| {
            filter_time
                .checked_duration_since(binding_request.timestamp)
                .map(|duration| duration < MAX_BINDING_REQUEST_TIMEOUT)
                .unwrap_or(true)
        });

        let bind_requests_removed = initial_size - self.pending_binding_requests.len();
        if bind_requests_removed > 0 {
            log::trace!(
                "[{}]: Discarded {} binding requests because they expired",
                self.get_name(),
                bind_requests_removed
            );
        }
    }

    /// Assert that the passed `TransactionID` is in our `pendingBindingRequests` and returns the
    /// destination, If the bindingRequest was valid remove it from our pending cache.
    pub(crate) fn handle_inbound_binding_success(
        &mut self,
        id: TransactionId,
    ) -> Option<BindingRequest> {
        self.invalidate_pending_binding_requests(Instant::now());

        let index = self
            .pending_binding_requests
            .iter()
            .position(|binding_request| binding_request.transaction_id == id)?;
        Some(self.pending_binding_requests.remove(index))
    }

    /// Settles a role conflict announced by an inbound request, the larger tie-breaker is
    /// controlling. Returns false when the request must be dropped.
    fn resolve_role_conflict(&mut self, m: &Message, remote_addr: SocketAddr) -> bool {
        if self.is_controlling {
            let mut remote = AttrControlling::default();
            if remote.get_from(m).is_err() {
                return true;
            }

            if self.tie_breaker >= remote.0 {
                log::debug!(
                    "[{}]: role conflict with {}, keeping the controlling role",
                    self.get_name(),
                    remote_addr
                );
                return false;
            }

            log::debug!(
                "[{}]: role conflict with {}, switching to controlled",
                self.get_name(),
                remote_addr
            );
            self.switch_role(false);
        } else {
            let mut remote = AttrControlled::default();
            if remote.get_from(m).is_err() {
                return true;
            }

            if self.tie_breaker < remote.0 {
                log::debug!(
                    "[{}]: role conflict with {}, keeping the controlled role",
                    self.get_name(),
                    remote_addr
                );
                return false;
            }

            log::debug!(
                "[{}]: role conflict with {}, switching to controlling",
                self.get_name(),
                remote_addr
            );
            self.switch_role(true);
        }

        true
    }

    fn switch_role(&mut self, is_controlling: bool) {
        self.is_controlling = is_controlling;
        for p in &self.checklist {
            p.set_ice_role_controlling(is_controlling);
        }
        self.start();
    }

    /// Processes STUN traffic from a remote candidate.
    pub(crate) fn handle_inbound(
        &mut self,
        m: &mut Message,
        local: &Arc<Candidate>,
        remote_addr: SocketAddr,
    ) {
        if m.typ.method != METHOD_BINDING
            || !(m.typ.class == CLASS_SUCCESS_RESPONSE
                || m.typ.class == CLASS_REQUEST
                || m.typ.class == CLASS_INDICATION)
        {
            log::trace!(
                "[{}]: unhandled STUN from {} to {} class({}) method({})",
                self.get_name(),
                remote_addr,
                local,
                m.typ.class,
                m.typ.method
            );
            return;
        }

        if m.typ.class == CLASS_REQUEST && !self.resolve_role_conflict(m, remote_addr) {
            return;
        }

        if self.is_controlling && m.contains(ATTR_USE_CANDIDATE) {
            log::debug!(
                "[{}]: useCandidate && a.isControlling == true",
                self.get_name(),
            );
            return;
        }

        let mut remote_candidate = self.find_remote_candidate(local.network_type(), remote_addr);
        if m.typ.class == CLASS_SUCCESS_RESPONSE {
            if let Err(err) =
                assert_inbound_message_integrity(m, self.ufrag_pwd.remote_pwd.as_bytes())
            {
                log::warn!(
                    "[{}]: discard message from ({}), {}",
                    self.get_name(),
                    remote_addr,
                    err
                );
                return;
            }

            if let Some(remote) = &remote_candidate {
                self.handle_success_response(m, local, remote, remote_addr);
            } else {
                log::warn!(
                    "[{}]: discard success message from ({}), no such remote",
                    self.get_name(),
                    remote_addr
                );
                return;
            }
        } else if m.typ.class == CLASS_REQUEST {
            let username =
                self.ufrag_pwd.local_ufrag.clone() + ":" + self.ufrag_pwd.remote_ufrag.as_str();
            if let Err(err) = assert_inbound_username(m, &username) {
                log::warn!(
                    "[{}]: discard message from ({}), {}",
                    self.get_name(),
                    remote_addr,
                    err
                );
                return;
            } else if let Err(err) =
                assert_inbound_message_integrity(m, self.ufrag_pwd.local_pwd.as_bytes())
            {
                log::warn!(
                    "[{}]: discard message from ({}), {}",
                    self.get_name(),
                    remote_addr,
                    err
                );
                return;
            }

            if remote_candidate.is_none() {
                let mut priority = PriorityAttr::default();
                if let Err(err) = priority.get_from(m) {
                    log::debug!(
                        "[{}]: request from ({}) without priority: {}",
                        self.get_name(),
                        remote_addr,
                        err
                    );
                }

                let prflx_candidate_config = CandidatePeerReflexiveConfig {
                    base_config: CandidateConfig {
                        network: local.network_type().network_short(),
                        address: remote_addr.ip().to_string(),
                        port: remote_addr.port(),
                        component: local.component(),
                        priority: priority.0,
                        ..CandidateConfig::default()
                    },
                    rel_addr: String::new(),
                    rel_port: 0,
                };

                match prflx_candidate_config.new_candidate_peer_reflexive() {
                    Ok(prflx_candidate) => {
                        let prflx_candidate = Arc::new(prflx_candidate);
                        log::debug!(
                            "[{}]: adding a new peer-reflexive candidate: {} ",
                            self.get_name(),
                            remote_addr
                        );
                        self.add_remote_candidate(&prflx_candidate);
                        remote_candidate = Some(prflx_candidate);
                    }
                    Err(err) => {
                        log::error!(
                            "[{}]: Failed to create new remote prflx candidate ({})",
                            self.get_name(),
                            err
                        );
                        return;
                    }
                };
            }

            log::trace!(
                "[{}]: inbound STUN (Request) from {} to {}",
                self.get_name(),
                remote_addr,
                local
            );

            if let Some(remote) = &remote_candidate {
                self.handle_binding_request(m, local, remote);
            }
        }

        if let Some(remote) = remote_candidate {
            remote.seen(false);
        }
    }

    /// Processes non STUN traffic from a remote candidate, and returns true if it is an actual
    /// remote candidate.
    pub(crate) fn validate_non_stun_traffic(
        &self,
        local: &Arc<Candidate>,
        remote_addr: SocketAddr,
    ) -> bool {
        self.find_remote_candidate(local.network_type(), remote_addr)
            .map_or(false, |remote| {
                remote.seen(false);
                true
            })
    }

    /// Hands a STUN message to the local candidate's socket without waiting for it.
    pub(crate) fn send_stun(&self, msg: &Message, local: &Arc<Candidate>, remote: &Arc<Candidate>) {
        let raw = msg.raw.clone();
        let (local, remote) = (Arc::clone(local), Arc::clone(remote));
        let name = self.get_name().to_owned();
        tokio::spawn(async move {
            if let Err(err) = local.write_to(&raw, &remote).await {
                log::trace!(
                    "[{}]: failed to send STUN message from {} to {}: {}",
                    name,
                    local,
                    remote,
                    err
                );
            }
        });
    }

    /// Dispatches a datagram read by a local candidate. Returns true when it carries application
    /// data from a known remote and belongs in the read buffer.
    pub(crate) fn handle_inbound_candidate_msg(
        &mut self,
        local: &Arc<Candidate>,
        buf: &[u8],
        src_addr: SocketAddr,
    ) -> bool {
        if stun::message::is_message(buf) {
            let mut m = Message {
                raw: vec![],
                ..Message::default()
            };
            // Explicitly copy raw buffer so Message can own the memory.
            m.raw.extend_from_slice(buf);

            if let Err(err) = m.decode() {
                log::warn!(
                    "[{}]: Failed to handle decode ICE from {} to {}: {}",
                    self.get_name(),
                    src_addr,
                    local.addr(),
                    err
                );
            } else {
                self.handle_inbound(&mut m, local, src_addr);
            }
            false
        } else if !self.validate_non_stun_traffic(local, src_addr) {
            log::warn!(
                "[{}]: Discarded message from {}, not a valid remote candidate",
                self.get_name(),
                src_addr
            );
            false
        } else {
            true
        }
    }

    pub(crate) fn get_name(&self) -> &str {
        if self.is_controlling {
            "controlling"
        } else {
            "controlled"
        }
    }

    pub(crate) fn get_best_available_candidate_pair(&self) -> Option<Arc<CandidatePair>> {
        let mut best: Option<&Arc<CandidatePair>> = None;

        for p in &self.checklist {
            if p.state() == CandidatePairState::Failed {
                continue;
            }

            if let Some(b) = &mut best {
                if b.priority() < p.priority() {
                    *b = p;
                }
            } else {
                best = Some(p);
            }
        }

        best.cloned()
    }

    pub(crate) fn get_best_valid_candidate_pair(&self) -> Option<Arc<CandidatePair>> {
        let mut best: Option<&Arc<CandidatePair>> = None;

        for p in &self.checklist {
            if p.state() != CandidatePairState::Succeeded {
                continue;
            }

            if let Some(b) = &mut best {
                if b.priority() < p.priority() {
                    *b = p;
                }
            } else {
                best = Some(p);
            }
        }

        best.cloned()
    }
}
