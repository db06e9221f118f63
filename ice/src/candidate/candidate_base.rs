use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crc::{Crc, CRC_32_ISCSI};
use tokio::sync::watch;

use super::candidate_host::CandidateHostConfig;
use super::candidate_peer_reflexive::CandidatePeerReflexiveConfig;
use super::candidate_relay::CandidateRelayConfig;
use super::candidate_server_reflexive::CandidateServerReflexiveConfig;
use super::*;
use crate::error::*;

/// A transport address of one side of the session, together with the socket that
/// owns it when the candidate is local.
pub struct Candidate {
    pub(crate) id: String,
    pub(crate) network_type: NetworkType,
    pub(crate) candidate_type: CandidateType,

    pub(crate) component: u16,
    pub(crate) address: String,
    pub(crate) port: u16,
    pub(crate) related_address: Option<CandidateRelatedAddress>,
    pub(crate) local_preference: u16,

    pub(crate) resolved_addr: SocketAddr,

    pub(crate) baseline_time: Instant,
    pub(crate) last_sent: AtomicU64,
    pub(crate) last_received: AtomicU64,

    pub(crate) conn: Option<Arc<dyn Conn + Send + Sync>>,
    pub(crate) closed_tx: watch::Sender<bool>,

    pub(crate) foundation_override: String,
    pub(crate) priority_override: u32,

    //CandidateHost
    pub(crate) network: String,
    //CandidateRelay
    pub(crate) relay_client: Option<Arc<turn::client::Client>>,
    pub(crate) relay_control_conn: Option<Arc<dyn Conn + Send + Sync>>,
    pub(crate) relay_protocol: String,
}

impl Default for Candidate {
    fn default() -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            id: String::new(),
            network_type: NetworkType::Unspecified,
            candidate_type: CandidateType::default(),

            component: 0,
            address: String::new(),
            port: 0,
            related_address: None,
            local_preference: DEFAULT_LOCAL_PREFERENCE,

            resolved_addr: SocketAddr::new(IpAddr::from([0, 0, 0, 0]), 0),

            baseline_time: Instant::now(),
            last_sent: AtomicU64::new(0),
            last_received: AtomicU64::new(0),

            conn: None,
            closed_tx,

            foundation_override: String::new(),
            priority_override: 0,
            network: String::new(),
            relay_client: None,
            relay_control_conn: None,
            relay_protocol: String::new(),
        }
    }
}

// String makes the candidate printable
impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(related_address) = self.related_address() {
            write!(
                f,
                "{} {} {}:{}{}",
                self.network_type(),
                self.candidate_type(),
                self.address(),
                self.port(),
                related_address,
            )
        } else {
            write!(
                f,
                "{} {} {}:{}",
                self.network_type(),
                self.candidate_type(),
                self.address(),
                self.port(),
            )
        }
    }
}

impl fmt::Debug for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Candidate {
    pub fn foundation(&self) -> String {
        if !self.foundation_override.is_empty() {
            return self.foundation_override.clone();
        }

        let mut buf = vec![];
        buf.extend_from_slice(self.candidate_type().to_string().as_bytes());
        buf.extend_from_slice(self.address.as_bytes());
        buf.extend_from_slice(self.network_type().to_string().as_bytes());

        let checksum = Crc::<u32>::new(&CRC_32_ISCSI).checksum(&buf);

        format!("{checksum}")
    }

    /// Returns Candidate ID.
    pub fn id(&self) -> String {
        self.id.clone()
    }

    /// Returns candidate component.
    pub fn component(&self) -> u16 {
        self.component
    }

    /// Returns a time indicating the last time this candidate was received.
    pub fn last_received(&self) -> Instant {
        self.baseline_time + Duration::from_nanos(self.last_received.load(Ordering::SeqCst))
    }

    /// Returns a time indicating the last time this candidate was sent.
    pub fn last_sent(&self) -> Instant {
        self.baseline_time + Duration::from_nanos(self.last_sent.load(Ordering::SeqCst))
    }

    /// Returns candidate NetworkType.
    pub fn network_type(&self) -> NetworkType {
        self.network_type
    }

    /// Returns Candidate Address.
    pub fn address(&self) -> &str {
        self.address.as_str()
    }

    /// Returns Candidate Port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Computes the priority for this ICE Candidate.
    pub fn priority(&self) -> u32 {
        if self.priority_override != 0 {
            return self.priority_override;
        }

        // The local preference MUST be an integer from 0 (lowest preference) to
        // 65535 (highest preference) inclusive. If there are multiple
        // candidates for a particular component for a particular data stream
        // that have the same type, the local preference MUST be unique for each
        // one.
        (1 << 24) * u32::from(self.candidate_type().preference())
            + (1 << 8) * u32::from(self.local_preference)
            + (256 - u32::from(self.component()))
    }

    /// Returns `Option<CandidateRelatedAddress>`.
    pub fn related_address(&self) -> Option<CandidateRelatedAddress> {
        self.related_address.as_ref().cloned()
    }

    /// Returns candidate type.
    pub fn candidate_type(&self) -> CandidateType {
        self.candidate_type
    }

    /// Returns the transport a relay candidate uses to reach its TURN server.
    pub fn relay_protocol(&self) -> &str {
        self.relay_protocol.as_str()
    }

    /// Returns the string representation of the ICECandidate.
    pub fn marshal(&self) -> String {
        let mut val = format!(
            "{} {} {} {} {} {} typ {}",
            self.foundation(),
            self.component(),
            self.network_type().network_short(),
            self.priority(),
            self.address(),
            self.port(),
            self.candidate_type()
        );

        if let Some(related_address) = self.related_address() {
            val += format!(
                " raddr {} rport {}",
                related_address.address, related_address.port,
            )
            .as_str();
        }

        val
    }

    pub fn addr(&self) -> SocketAddr {
        self.resolved_addr
    }

    /// Subscribes to the closed signal of this candidate.
    pub(crate) fn closed_rx(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Stops the receive loop, closes the socket and, for relay candidates, releases the TURN
    /// allocation and its control connection.
    pub async fn close(&self) -> Result<()> {
        if self.closed_tx.send_replace(true) {
            return Err(Error::ErrClosed);
        }

        let mut errs = vec![];
        if let Some(conn) = &self.conn {
            if let Err(err) = conn.close().await {
                errs.push(Error::from(err));
            }
        }

        if let Some(relay_client) = &self.relay_client {
            if let Err(err) = relay_client.close().await {
                errs.push(Error::from(err));
            }
        }

        // the TURN client leaves its connection open, its read loop only ends here
        if let Some(control_conn) = &self.relay_control_conn {
            if let Err(err) = control_conn.close().await {
                errs.push(Error::from(err));
            }
        }

        flatten_errs(errs)
    }

    pub fn seen(&self, outbound: bool) {
        let d = Instant::now().duration_since(self.baseline_time);

        if outbound {
            self.set_last_sent(d);
        } else {
            self.set_last_received(d);
        }
    }

    /// Sends `raw` to the transport address of `dst` over this candidate's socket.
    pub async fn write_to(&self, raw: &[u8], dst: &Candidate) -> Result<usize> {
        let n = if let Some(conn) = &self.conn {
            let addr = dst.addr();
            conn.send_to(raw, addr).await?
        } else {
            0
        };
        self.seen(true);
        Ok(n)
    }

    /// Used to compare two candidates.
    pub fn equal(&self, other: &Candidate) -> bool {
        self.network_type() == other.network_type()
            && self.candidate_type() == other.candidate_type()
            && self.address() == other.address()
            && self.port() == other.port()
            && self.related_address() == other.related_address()
    }

    /// Rebinds the candidate to `ip`, used once a mDNS name has been resolved.
    pub(crate) fn set_ip(&mut self, ip: &IpAddr) -> Result<()> {
        let network_type = determine_network_type(&self.network, ip)?;
        self.network_type = network_type;
        self.resolved_addr = SocketAddr::new(*ip, self.port);

        Ok(())
    }

    fn set_last_received(&self, d: Duration) {
        #[allow(clippy::cast_possible_truncation)]
        self.last_received
            .store(d.as_nanos() as u64, Ordering::SeqCst);
    }

    fn set_last_sent(&self, d: Duration) {
        #[allow(clippy::cast_possible_truncation)]
        self.last_sent.store(d.as_nanos() as u64, Ordering::SeqCst);
    }
}

/// Creates a Candidate from its string representation.
pub fn unmarshal_candidate(raw: &str) -> Result<Candidate> {
    let split: Vec<&str> = raw.split_whitespace().collect();
    if split.len() < 8 {
        return Err(Error::ErrAttributeTooShortIceCandidate);
    }

    // Foundation
    let foundation = split[0].to_owned();

    // Component
    let component: u16 = split[1].parse()?;

    // Network
    let network = split[2].to_owned();

    // Priority
    let priority: u32 = split[3].parse()?;

    // Address
    let address = split[4].to_owned();

    // Port
    let port: u16 = split[5].parse()?;

    let typ = split[7];

    let mut rel_addr = String::new();
    let mut rel_port = 0;

    if split.len() > 8 {
        let split2 = &split[8..];

        if split2[0] == "raddr" {
            if split2.len() < 4 {
                return Err(Error::ErrParseRelatedAddr);
            }

            // RelatedAddress
            rel_addr = split2[1].to_owned();

            // RelatedPort
            rel_port = split2[3]
                .parse()
                .map_err(|_| Error::ErrParseRelatedAddr)?;
        }
    }

    let base_config = CandidateConfig {
        network,
        address,
        port,
        component,
        priority,
        foundation,
        ..CandidateConfig::default()
    };

    match typ {
        "host" => {
            let config = CandidateHostConfig {
                base_config,
                ..CandidateHostConfig::default()
            };
            config.new_candidate_host()
        }
        "srflx" => {
            let config = CandidateServerReflexiveConfig {
                base_config,
                rel_addr,
                rel_port,
            };
            config.new_candidate_server_reflexive()
        }
        "prflx" => {
            let config = CandidatePeerReflexiveConfig {
                base_config,
                rel_addr,
                rel_port,
            };

            config.new_candidate_peer_reflexive()
        }
        "relay" => {
            let config = CandidateRelayConfig {
                base_config,
                rel_addr,
                rel_port,
                ..CandidateRelayConfig::default()
            };
            config.new_candidate_relay()
        }
        _ => Err(Error::ErrUnknownCandidateType),
    }
}
