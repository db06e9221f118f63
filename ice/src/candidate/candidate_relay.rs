use super::*;
use crate::error::*;
use crate::rand::generate_cand_id;

/// The config required to create a new relay `Candidate`.
#[derive(Default)]
pub struct CandidateRelayConfig {
    pub base_config: CandidateConfig,

    pub rel_addr: String,
    pub rel_port: u16,

    /// Transport used towards the TURN server: "udp", "tcp" or "tls".
    pub relay_protocol: String,
    /// Client owning the allocation; closed together with the candidate.
    pub relay_client: Option<Arc<turn::client::Client>>,
    /// Connection to the TURN server the client runs over; closed after the client.
    pub relay_control_conn: Option<Arc<dyn Conn + Send + Sync>>,
}

impl CandidateRelayConfig {
    /// Creates a new relay candidate.
    pub fn new_candidate_relay(self) -> Result<Candidate> {
        let mut candidate_id = self.base_config.candidate_id;
        if candidate_id.is_empty() {
            candidate_id = generate_cand_id();
        }

        let ip: IpAddr = match self.base_config.address.parse() {
            Ok(ip) => ip,
            Err(_) => return Err(Error::ErrAddressParseFailed),
        };
        let network_type = determine_network_type(&self.base_config.network, &ip)?;

        Ok(Candidate {
            id: candidate_id,
            network_type,
            candidate_type: CandidateType::Relay,
            address: self.base_config.address,
            port: self.base_config.port,
            resolved_addr: SocketAddr::new(ip, self.base_config.port),
            component: self.base_config.component,
            foundation_override: self.base_config.foundation,
            priority_override: self.base_config.priority,
            related_address: Some(CandidateRelatedAddress {
                address: self.rel_addr,
                port: self.rel_port,
            }),
            conn: self.base_config.conn,
            relay_client: self.relay_client,
            relay_control_conn: self.relay_control_conn,
            relay_protocol: self.relay_protocol,
            ..Candidate::default()
        })
    }
}
