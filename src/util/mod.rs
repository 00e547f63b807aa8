use local_ip_address::list_afinet_netifas;
use std::net::{IpAddr, Ipv4Addr};
use systemstat::{Platform, System};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber. `RUST_LOG` overrides the `info` default.
pub fn init_log() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn is_routable(v: &Ipv4Addr) -> bool {
    !v.is_loopback() && !v.is_link_local() && !v.is_broadcast() && !v.is_unspecified()
}

/// Pick an IPv4 address that other machines on the LAN can reach.
///
/// Iterates over all network interfaces provided by `systemstat`, skipping any
/// loopback, link-local or broadcast addresses.
pub fn select_host_address() -> Option<IpAddr> {
    let system = System::new();
    let networks = match system.networks() {
        Ok(networks) => networks,
        Err(e) => {
            warn!("Could not enumerate network interfaces: {}", e);
            return None;
        }
    };

    networks
        .values()
        .flat_map(|net| net.addrs.iter())
        .find_map(|n| match n.addr {
            systemstat::IpAddr::V4(v) if is_routable(&v) => Some(IpAddr::V4(v)),
            _ => None,
        })
}

/// Every routable IPv4 interface as `(name, address)`.
pub fn lan_addresses() -> Vec<(String, IpAddr)> {
    match list_afinet_netifas() {
        Ok(interfaces) => interfaces
            .into_iter()
            .filter(|(_, ip)| matches!(ip, IpAddr::V4(v) if is_routable(v)))
            .collect(),
        Err(e) => {
            warn!("Could not list network interfaces: {}", e);
            vec![]
        }
    }
}

/// Log where peers should point their clients.
pub fn announce_lan_addresses(tcp_port: u16, udp_port: u16) {
    match select_host_address() {
        Some(ip) => info!("Peers connect to {} (control {}, media {})", ip, tcp_port, udp_port),
        None => warn!("Found no routable network interface; peers on this host only"),
    }

    for (name, ip) in lan_addresses() {
        info!("iface: {} / {}", name, ip);
    }
}
