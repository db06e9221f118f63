use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use stun::agent::TransactionId;
use stun::attributes::*;
use stun::fingerprint::*;
use stun::integrity::*;
use stun::message::*;
use stun::textattrs::*;

use crate::agent::agent_internal::*;
use crate::attributes::{control::*, priority::*, use_candidate::*};
use crate::candidate::{candidate_pair::*, *};

trait ControllingSelector {
    fn start(&mut self);
    fn contact_candidates(&mut self);
    fn ping_candidate(&mut self, local: &Arc<Candidate>, remote: &Arc<Candidate>);
    fn handle_success_response(
        &mut self,
        m: &Message,
        local: &Arc<Candidate>,
        remote: &Arc<Candidate>,
        remote_addr: SocketAddr,
    );
    fn handle_binding_request(&mut self, m: &Message, local: &Arc<Candidate>, remote: &Arc<Candidate>);
}

trait ControlledSelector {
    fn start(&mut self);
    fn contact_candidates(&mut self);
    fn ping_candidate(&mut self, local: &Arc<Candidate>, remote: &Arc<Candidate>);
    fn handle_success_response(
        &mut self,
        m: &Message,
        local: &Arc<Candidate>,
        remote: &Arc<Candidate>,
        remote_addr: SocketAddr,
    );
    fn handle_binding_request(&mut self, m: &Message, local: &Arc<Candidate>, remote: &Arc<Candidate>);
}

/// A lite agent never originates checks, it answers them and accepts the nomination.
trait LiteSelector {
    fn start(&mut self);
    fn contact_candidates(&mut self);
    fn ping_candidate(&mut self, local: &Arc<Candidate>, remote: &Arc<Candidate>);
    fn handle_success_response(
        &mut self,
        m: &Message,
        local: &Arc<Candidate>,
        remote: &Arc<Candidate>,
        remote_addr: SocketAddr,
    );
    fn handle_binding_request(&mut self, m: &Message, local: &Arc<Candidate>, remote: &Arc<Candidate>);
}

impl AgentInternal {
    // A lite agent that ended up controlling falls back to full checks, RFC 8445 S6.1.1
    fn is_lite_selector(&self) -> bool {
        self.lite && !self.is_controlling
    }

    fn is_nominatable(&self, c: &Candidate) -> bool {
        let elapsed = Instant::now()
            .checked_duration_since(self.start_time)
            .unwrap_or_else(|| Duration::from_secs(0));

        if self.candidate_selection_timeout != Duration::from_secs(0)
            && elapsed > self.candidate_selection_timeout
        {
            return true;
        }

        match c.candidate_type() {
            CandidateType::Host => elapsed.as_nanos() > self.host_acceptance_min_wait.as_nanos(),
            CandidateType::ServerReflexive => {
                elapsed.as_nanos() > self.srflx_acceptance_min_wait.as_nanos()
            }
            CandidateType::PeerReflexive => {
                elapsed.as_nanos() > self.prflx_acceptance_min_wait.as_nanos()
            }
            CandidateType::Relay => elapsed.as_nanos() > self.relay_acceptance_min_wait.as_nanos(),
            CandidateType::Unspecified => {
                log::error!(
                    "is_nominatable invalid candidate type {}",
                    c.candidate_type()
                );
                false
            }
        }
    }

    fn nominate_pair(&mut self) {
        let pair = match &self.nominated_pair {
            Some(pair) => Arc::clone(pair),
            None => return,
        };

        if pair.binding_request_count() > self.max_binding_requests {
            log::trace!(
                "[{}]: nomination of {} unanswered, marking it as failed",
                self.get_name(),
                pair
            );
            pair.set_state(CandidatePairState::Failed);
            pair.set_nominated(false);
            self.nominated_pair = None;
            return;
        }

        // The controlling agent MUST include the USE-CANDIDATE attribute in
        // order to nominate a candidate pair (Section 8.1.1).  The controlled
        // agent MUST NOT include the USE-CANDIDATE attribute in a Binding
        // request.
        let (msg, result) = {
            let ufrag_pwd = &self.ufrag_pwd;
            let username = ufrag_pwd.remote_ufrag.clone() + ":" + ufrag_pwd.local_ufrag.as_str();
            let mut msg = Message::new();
            let result = msg.build(&[
                Box::new(BINDING_REQUEST),
                Box::new(TransactionId::new()),
                Box::new(Username::new(ATTR_USERNAME, username)),
                Box::<UseCandidateAttr>::default(),
                Box::new(AttrControlling(self.tie_breaker)),
                Box::new(PriorityAttr(pair.local.priority())),
                Box::new(MessageIntegrity::new_short_term_integrity(
                    ufrag_pwd.remote_pwd.clone(),
                )),
                Box::new(FINGERPRINT),
            ]);
            (msg, result)
        };

        if let Err(err) = result {
            log::error!("{}", err);
        } else {
            log::trace!(
                "ping STUN (nominate candidate pair from {} to {}",
                pair.local,
                pair.remote,
            );
            self.send_binding_request(&msg, &pair.local, &pair.remote);
        }
    }

    fn build_ping(&self, local: &Candidate, controlling: bool) -> Option<Message> {
        let ufrag_pwd = &self.ufrag_pwd;
        let username = ufrag_pwd.remote_ufrag.clone() + ":" + ufrag_pwd.local_ufrag.as_str();
        let role: Box<dyn Setter> = if controlling {
            Box::new(AttrControlling(self.tie_breaker))
        } else {
            Box::new(AttrControlled(self.tie_breaker))
        };

        let mut msg = Message::new();
        let result = msg.build(&[
            Box::new(BINDING_REQUEST),
            Box::new(TransactionId::new()),
            Box::new(Username::new(ATTR_USERNAME, username)),
            role,
            Box::new(PriorityAttr(local.priority())),
            Box::new(MessageIntegrity::new_short_term_integrity(
                ufrag_pwd.remote_pwd.clone(),
            )),
            Box::new(FINGERPRINT),
        ]);

        match result {
            Ok(()) => Some(msg),
            Err(err) => {
                log::error!("{}", err);
                None
            }
        }
    }

    /// Matches a success response to its pending request. Returns the request when the response
    /// came back from the address the request went to.
    fn take_pending_request(
        &mut self,
        m: &Message,
        remote: &Arc<Candidate>,
        remote_addr: SocketAddr,
    ) -> Option<super::BindingRequest> {
        let pending_request = match self.handle_inbound_binding_success(m.transaction_id) {
            Some(pending_request) => pending_request,
            None => {
                log::warn!(
                    "discard message from ({}), unknown TransactionID 0x{:?}",
                    remote,
                    m.transaction_id
                );
                return None;
            }
        };

        // Assert that NAT is not symmetric
        // https://tools.ietf.org/html/rfc8445#section-7.2.5.2.1
        if pending_request.destination != remote_addr {
            log::debug!(
                "discard message: transaction source and destination does not match expected({}), actual({})",
                pending_request.destination,
                remote
            );
            return None;
        }

        Some(pending_request)
    }

    pub(crate) fn start(&mut self) {
        if self.is_lite_selector() {
            LiteSelector::start(self);
        } else if self.is_controlling {
            ControllingSelector::start(self);
        } else {
            ControlledSelector::start(self);
        }
    }

    pub(crate) fn contact_candidates(&mut self) {
        if self.is_lite_selector() {
            LiteSelector::contact_candidates(self);
        } else if self.is_controlling {
            ControllingSelector::contact_candidates(self);
        } else {
            ControlledSelector::contact_candidates(self);
        }
    }

    pub(crate) fn ping_candidate(&mut self, local: &Arc<Candidate>, remote: &Arc<Candidate>) {
        if self.is_lite_selector() {
            LiteSelector::ping_candidate(self, local, remote);
        } else if self.is_controlling {
            ControllingSelector::ping_candidate(self, local, remote);
        } else {
            ControlledSelector::ping_candidate(self, local, remote);
        }
    }

    pub(crate) fn handle_success_response(
        &mut self,
        m: &Message,
        local: &Arc<Candidate>,
        remote: &Arc<Candidate>,
        remote_addr: SocketAddr,
    ) {
        if self.is_lite_selector() {
            LiteSelector::handle_success_response(self, m, local, remote, remote_addr);
        } else if self.is_controlling {
            ControllingSelector::handle_success_response(self, m, local, remote, remote_addr);
        } else {
            ControlledSelector::handle_success_response(self, m, local, remote, remote_addr);
        }
    }

    pub(crate) fn handle_binding_request(
        &mut self,
        m: &Message,
        local: &Arc<Candidate>,
        remote: &Arc<Candidate>,
    ) {
        if self.is_lite_selector() {
            LiteSelector::handle_binding_request(self, m, local, remote);
        } else if self.is_controlling {
            ControllingSelector::handle_binding_request(self, m, local, remote);
        } else {
            ControlledSelector::handle_binding_request(self, m, local, remote);
        }
    }
}

impl ControllingSelector for AgentInternal {
    fn start(&mut self) {
        self.nominated_pair = None;
        self.start_time = Instant::now();
    }

    fn contact_candidates(&mut self) {
        if self.lite {
            // This only happens if both peers are lite. See RFC 8445 S6.1.1 and S6.2
            log::trace!("now falling back to full agent");
        }

        if self.get_selected_pair().is_some() {
            if self.validate_selected_pair() {
                log::trace!("[{}]: checking keepalive", self.get_name());
                self.check_keepalive();
            }
        } else if self.nominated_pair.is_some() {
            self.nominate_pair();
        } else {
            let best = self
                .get_best_valid_candidate_pair()
                .filter(|p| self.is_nominatable(&p.local) && self.is_nominatable(&p.remote));

            if let Some(p) = best {
                log::trace!(
                    "Nominatable pair found, nominating ({}, {})",
                    p.local,
                    p.remote,
                );
                self.nominated_pair = Some(p);
                self.nominate_pair();
            } else {
                self.ping_all_candidates();
            }
        }
    }

    fn ping_candidate(&mut self, local: &Arc<Candidate>, remote: &Arc<Candidate>) {
        if let Some(msg) = self.build_ping(local, true) {
            self.send_binding_request(&msg, local, remote);
        }
    }

    fn handle_success_response(
        &mut self,
        m: &Message,
        local: &Arc<Candidate>,
        remote: &Arc<Candidate>,
        remote_addr: SocketAddr,
    ) {
        let pending_request = match self.take_pending_request(m, remote, remote_addr) {
            Some(pending_request) => pending_request,
            None => return,
        };

        log::trace!(
            "inbound STUN (SuccessResponse) from {} to {}",
            remote,
            local
        );
        let selected_pair_is_none = self.get_selected_pair().is_none();

        if let Some(p) = self.find_pair(local, remote) {
            p.on_response_received();
            p.set_state(CandidatePairState::Succeeded);
            log::trace!(
                "Found valid candidate pair: {}, p.state: {}, isUseCandidate: {}, {}",
                p,
                p.state(),
                pending_request.is_use_candidate,
                selected_pair_is_none
            );
            if pending_request.is_use_candidate && selected_pair_is_none {
                self.set_selected_pair(Some(p));
            }
        } else {
            // This shouldn't happen
            log::error!("Success response from invalid candidate pair");
        }
    }

    fn handle_binding_request(&mut self, m: &Message, local: &Arc<Candidate>, remote: &Arc<Candidate>) {
        self.send_binding_success(m, local, remote);
        log::trace!("controllingSelector: sendBindingSuccess");

        if let Some(p) = self.find_pair(local, remote) {
            let nominated_pair_is_none = self.nominated_pair.is_none();

            log::trace!(
                "controllingSelector: after findPair {}, p.state: {}, {}",
                p,
                p.state(),
                nominated_pair_is_none,
            );
            if p.state() == CandidatePairState::Succeeded
                && nominated_pair_is_none
                && self.get_selected_pair().is_none()
            {
                if let Some(best_pair) = self.get_best_available_candidate_pair() {
                    log::trace!(
                        "controllingSelector: getBestAvailableCandidatePair {}",
                        best_pair
                    );
                    if Arc::ptr_eq(&best_pair, &p)
                        && self.is_nominatable(&p.local)
                        && self.is_nominatable(&p.remote)
                    {
                        log::trace!(
                            "The candidate ({}, {}) is the best candidate available, marking it as nominated",
                            p.local,
                            p.remote
                        );
                        self.nominated_pair = Some(p);
                        self.nominate_pair();
                    }
                } else {
                    log::trace!("No best pair available");
                }
            }
        } else {
            log::trace!("controllingSelector: addPair");
            self.add_pair(Arc::clone(local), Arc::clone(remote));
        }
    }
}

impl ControlledSelector for AgentInternal {
    fn start(&mut self) {}

    fn contact_candidates(&mut self) {
        if self.get_selected_pair().is_some() {
            if self.validate_selected_pair() {
                log::trace!("[{}]: checking keepalive", self.get_name());
                self.check_keepalive();
            }
        } else {
            self.ping_all_candidates();
        }
    }

    fn ping_candidate(&mut self, local: &Arc<Candidate>, remote: &Arc<Candidate>) {
        if let Some(msg) = self.build_ping(local, false) {
            self.send_binding_request(&msg, local, remote);
        }
    }

    fn handle_success_response(
        &mut self,
        m: &Message,
        local: &Arc<Candidate>,
        remote: &Arc<Candidate>,
        remote_addr: SocketAddr,
    ) {
        // https://tools.ietf.org/html/rfc8445#section-7.3.1.5
        // If the controlled agent does not accept the request from the
        // controlling agent, the controlled agent MUST reject the nomination
        // request with an appropriate error code response (e.g., 400)
        // [RFC5389].
        if self.take_pending_request(m, remote, remote_addr).is_none() {
            return;
        }

        log::trace!(
            "inbound STUN (SuccessResponse) from {} to {}",
            remote,
            local
        );

        if let Some(p) = self.find_pair(local, remote) {
            p.on_response_received();
            p.set_state(CandidatePairState::Succeeded);
            log::trace!("Found valid candidate pair: {}", p);

            // a nomination that arrived before the pair was valid takes effect now
            if p.nominated() && self.get_selected_pair().is_none() {
                self.set_selected_pair(Some(p));
            }
        } else {
            // This shouldn't happen
            log::error!("Success response from invalid candidate pair");
        }
    }

    fn handle_binding_request(&mut self, m: &Message, local: &Arc<Candidate>, remote: &Arc<Candidate>) {
        if self.find_pair(local, remote).is_none() {
            self.add_pair(Arc::clone(local), Arc::clone(remote));
        }

        if let Some(p) = self.find_pair(local, remote) {
            let use_candidate = m.contains(ATTR_USE_CANDIDATE);
            if use_candidate {
                // https://tools.ietf.org/html/rfc8445#section-7.3.1.5

                if p.state() == CandidatePairState::Succeeded {
                    // If the state of this pair is Succeeded, it means that the check
                    // previously sent by this pair produced a successful response and
                    // generated a valid pair (Section 7.2.5.3.2).  The agent sets the
                    // nominated flag value of the valid pair to true.
                    if self.get_selected_pair().is_none() {
                        self.set_selected_pair(Some(p));
                    }
                    self.send_binding_success(m, local, remote);
                } else {
                    // If the received Binding request triggered a new check to be
                    // enqueued in the triggered-check queue (Section 7.3.1.4), once the
                    // check is sent and if it generates a successful response, and
                    // generates a valid pair, the agent sets the nominated flag of the
                    // pair to true.  If the request fails (Section 7.2.5.2), the agent
                    // MUST remove the candidate pair from the valid list, set the
                    // candidate pair state to Failed, and set the checklist state to
                    // Failed.
                    p.set_nominated(true);
                    self.ping_candidate(local, remote);
                }
            } else {
                self.send_binding_success(m, local, remote);
                self.ping_candidate(local, remote);
            }
        }
    }
}

impl LiteSelector for AgentInternal {
    fn start(&mut self) {}

    fn contact_candidates(&mut self) {
        if self.get_selected_pair().is_some() {
            self.validate_selected_pair();
        }
    }

    fn ping_candidate(&mut self, _local: &Arc<Candidate>, _remote: &Arc<Candidate>) {}

    fn handle_success_response(
        &mut self,
        m: &Message,
        _local: &Arc<Candidate>,
        remote: &Arc<Candidate>,
        _remote_addr: SocketAddr,
    ) {
        log::trace!(
            "[{}]: lite agent discards success response 0x{:?} from {}",
            self.get_name(),
            m.transaction_id,
            remote
        );
    }

    fn handle_binding_request(&mut self, m: &Message, local: &Arc<Candidate>, remote: &Arc<Candidate>) {
        if self.find_pair(local, remote).is_none() {
            self.add_pair(Arc::clone(local), Arc::clone(remote));
        }

        self.send_binding_success(m, local, remote);

        if m.contains(ATTR_USE_CANDIDATE) {
            if let Some(p) = self.find_pair(local, remote) {
                p.set_state(CandidatePairState::Succeeded);
                if self.get_selected_pair().is_none() {
                    self.set_selected_pair(Some(p));
                }
            }
        }
    }
}
