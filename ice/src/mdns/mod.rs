
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use mdns::config::*;
use mdns::conn::*;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::*;

pub(crate) const DEFAULT_MDNS_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Represents the different Multicast modes that ICE can run.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
pub enum MulticastDnsMode {
    /// Means remote mDNS candidates will be discarded, and local host candidates will use IPs.
    Disabled,

    /// Means remote mDNS candidates will be accepted, and local host candidates will use IPs.
    #[default]
    QueryOnly,

    /// Means remote mDNS candidates will be accepted, and local host candidates will use mDNS.
    QueryAndGather,
}

pub(crate) fn generate_multicast_dns_name() -> String {
    // https://tools.ietf.org/id/draft-ietf-rtcweb-mdns-ice-candidates-02.html#gathering
    // The unique name MUST consist of a version 4 UUID as defined in [RFC4122], followed by “.local”.
    let u = Uuid::new_v4();
    format!("{u}.local")
}

/// A name is usable for mDNS gathering when it has exactly one label followed by `.local`.
pub(crate) fn is_valid_multicast_dns_name(name: &str) -> bool {
    name.ends_with(".local") && name.split('.').count() == 2
}

/// A remote host address that names an mDNS host rather than an IP.
pub(crate) fn is_multicast_dns_address(address: &str) -> bool {
    address.ends_with(".local")
}

pub(crate) fn create_multicast_dns(
    mdns_mode: MulticastDnsMode,
    mdns_name: &str,
    dest_addr: &str,
) -> Result<Option<Arc<DnsConn>>> {
    let local_names = match mdns_mode {
        MulticastDnsMode::QueryOnly => vec![],
        MulticastDnsMode::QueryAndGather => vec![mdns_name.to_owned()],
        MulticastDnsMode::Disabled => return Ok(None),
    };

    let addr = if dest_addr.is_empty() {
        SocketAddr::from_str(DEFAULT_DEST_ADDR)?
    } else {
        SocketAddr::from_str(dest_addr)?
    };
    log::info!("mDNS is using {addr} as dest_addr");

    let conn = DnsConn::server(
        addr,
        Config {
            local_names,
            ..Config::default()
        },
    )?;

    Ok(Some(Arc::new(conn)))
}

/// Resolves `name` through the mDNS connection, giving up after `timeout`.
pub(crate) async fn resolve_multicast_dns(
    conn: &Arc<DnsConn>,
    name: &str,
    timeout: Duration,
) -> Result<IpAddr> {
    let (close_query_tx, close_query_rx) = mpsc::channel(1);
    tokio::select! {
        result = conn.query(name, close_query_rx) => {
            let (_, src) = result?;
            Ok(src.ip())
        }
        _ = tokio::time::sleep(timeout) => {
            let _ = close_query_tx.try_send(());
            Err(Error::Other(format!("mDNS query for {name} timed out")))
        }
    }
}
