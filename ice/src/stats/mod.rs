use std::time::SystemTime;

use serde::Serialize;

use crate::candidate::candidate_pair::CandidatePairState;
use crate::candidate::CandidateType;
use crate::network_type::NetworkType;

/// Contains ICE candidate pair statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CandidatePairStats {
    /// The timestamp associated with this struct.
    pub timestamp: SystemTime,

    /// The id of the local candidate.
    pub local_candidate_id: String,

    /// The id of the remote candidate.
    pub remote_candidate_id: String,

    /// The state of the checklist for the local and remote candidates in a pair.
    pub state: CandidatePairState,

    /// Related to updating the nominated flag described in
    /// Section 7.1.3.2.4 of [RFC5245].
    pub nominated: bool,

    /// The pair priority as used for ordering the checklist.
    pub priority: u64,

    /// The total number of connectivity check requests sent.
    pub requests_sent: u32,

    /// The total number of connectivity check responses received.
    pub responses_received: u32,

    /// The binding requests sent since the pair last succeeded or was reset.
    pub binding_request_count: u16,

    /// The timestamp at which the last connectivity check request was sent.
    pub last_request_timestamp: Option<SystemTime>,

    /// The timestamp at which the last connectivity check response was received.
    pub last_response_timestamp: Option<SystemTime>,
}

/// Contains ICE candidate statistics related to the `ICETransport` objects.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateStats {
    // The timestamp associated with this struct.
    pub timestamp: SystemTime,

    /// The candidate id.
    pub id: String,

    /// The type of network interface used by the base of a
    /// local candidate (the address the ICE agent sends from).
    pub network_type: NetworkType,

    /// The IP address of the candidate, allowing for IPv4 addresses and
    /// IPv6 addresses, but fully qualified domain names (FQDNs) are not allowed.
    pub ip: String,

    /// The port number of the candidate.
    pub port: u16,

    /// The "Type" field of the ICECandidate.
    pub candidate_type: CandidateType,

    /// The "priority" field of the ICECandidate.
    pub priority: u32,

    /// The related address and port, for reflexive and relay candidates.
    pub related_address: Option<String>,

    /// The protocol used by the endpoint to communicate with the TURN server.
    /// This is only present for local candidates. Valid values for the TURN URL
    /// protocol is one of udp, tcp, or tls.
    pub relay_protocol: String,

    /// True if the candidate was deleted or released, false otherwise.
    pub deleted: bool,
}
