use super::*;
use crate::error::*;
use crate::mdns::is_multicast_dns_address;
use crate::rand::generate_cand_id;

/// The config required to create a new host `Candidate`.
#[derive(Default)]
pub struct CandidateHostConfig {
    pub base_config: CandidateConfig,

    /// Position-derived preference among the host candidates of one agent; `None` is the maximum.
    pub local_preference: Option<u16>,
}

impl CandidateHostConfig {
    /// Creates a new host candidate.
    pub fn new_candidate_host(self) -> Result<Candidate> {
        let mut candidate_id = self.base_config.candidate_id;
        if candidate_id.is_empty() {
            candidate_id = generate_cand_id();
        }

        let mut c = Candidate {
            id: candidate_id,
            address: self.base_config.address.clone(),
            candidate_type: CandidateType::Host,
            component: self.base_config.component,
            port: self.base_config.port,
            local_preference: self
                .local_preference
                .unwrap_or(DEFAULT_LOCAL_PREFERENCE),
            foundation_override: self.base_config.foundation,
            priority_override: self.base_config.priority,
            network: self.base_config.network,
            network_type: NetworkType::Udp4,
            conn: self.base_config.conn,
            ..Candidate::default()
        };

        if !is_multicast_dns_address(&self.base_config.address) {
            let ip = self
                .base_config
                .address
                .parse()
                .map_err(|_| Error::ErrAddressParseFailed)?;
            c.set_ip(&ip)?;
        };

        Ok(c)
    }
}
