//! Host, service and socket plumbing
//!
//! The caster endpoint is given as a host name plus a port that may be
//! numeric or a service name. When a proxy is configured the dial target is
//! the proxy and the origin endpoint only appears in the request line.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::{lookup_host, TcpStream, UdpSocket};

use crate::NtripError;

/// Resolve a port string: numeric values short-circuit, anything else is
/// looked up as a service name.
pub fn service_port(port: &str) -> Result<u16, NtripError> {
    if let Ok(n) = port.parse::<u16>() {
        if n != 0 {
            return Ok(n);
        }
    }
    lookup_service(port).ok_or_else(|| NtripError::PortLookup(port.to_string()))
}

/// `/etc/services` scan, name or alias, first match wins.
fn lookup_service(name: &str) -> Option<u16> {
    let services = std::fs::read_to_string("/etc/services").ok()?;

    for line in services.lines() {
        let line = line.split('#').next().unwrap_or("");
        let mut fields = line.split_whitespace();
        let Some(service) = fields.next() else {
            continue;
        };
        let Some(port_proto) = fields.next() else {
            continue;
        };
        let Some((port, _proto)) = port_proto.split_once('/') else {
            continue;
        };
        if service == name || fields.any(|alias| alias == name) {
            return port.parse().ok();
        }
    }
    None
}

/// Resolve `(host, port-or-service)` to a socket address.
pub async fn resolve(host: &str, port: &str) -> Result<SocketAddr, NtripError> {
    let port = service_port(port)?;

    match lookup_host((host, port)).await {
        Ok(mut addrs) => addrs
            .next()
            .ok_or_else(|| NtripError::HostLookup(host.to_string())),
        Err(_) => Err(NtripError::HostLookup(host.to_string())),
    }
}

pub async fn connect_tcp(addr: SocketAddr) -> Result<TcpStream, NtripError> {
    Ok(TcpStream::connect(addr).await?)
}

fn local_any(peer: SocketAddr, port: u16) -> SocketAddr {
    match peer {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, port).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, port).into(),
    }
}

/// Bind a UDP socket on `local_port` (0 = OS chooses) in the peer's address
/// family. Binding first keeps the reply port stable for the caster.
pub async fn bind_udp(local_port: u16, peer: SocketAddr) -> Result<UdpSocket, NtripError> {
    Ok(UdpSocket::bind(local_any(peer, local_port)).await?)
}

/// Bind as [`bind_udp`], then connect so plain `send`/`recv` reach the
/// caster.
pub async fn bind_connect_udp(local_port: u16, peer: SocketAddr) -> Result<UdpSocket, NtripError> {
    let sock = bind_udp(local_port, peer).await?;
    sock.connect(peer).await?;
    Ok(sock)
}
