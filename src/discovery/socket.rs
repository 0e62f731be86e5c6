//! Discovery socket setup.

use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket},
};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::config::Config;

/// Binds the shared discovery port and joins the multicast group.
///
/// The port is bound with address reuse so several processes on one host
/// can listen at once. A failed group join is logged and tolerated; the
/// socket still serves unicast peers.
///
/// Must be called from within a tokio runtime context.
pub(crate) fn bind(config: &Config) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;

    let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.discovery_port));
    socket.bind(&bind_addr.into())?;

    if config.multicast_enabled {
        match socket.join_multicast_v4(&config.multicast_group, &Ipv4Addr::UNSPECIFIED) {
            Ok(()) => {
                tracing::debug!(group = %config.multicast_group, "joined discovery multicast group");
            }
            Err(e) => {
                tracing::warn!(
                    group = %config.multicast_group,
                    error = %e,
                    "joining discovery multicast group failed (non-fatal)"
                );
            }
        }
        socket.set_multicast_loop_v4(true)?;
        socket.set_multicast_ttl_v4(1)?;
    }

    let std_socket: StdUdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

/// Addresses that identify this host: loopback plus the interface used to
/// reach the multicast group. Connecting a UDP socket sends nothing.
pub(crate) fn local_addresses(config: &Config) -> Vec<IpAddr> {
    let mut addrs = vec![IpAddr::V4(Ipv4Addr::LOCALHOST)];
    let probe = StdUdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|s| s.connect((config.multicast_group, config.discovery_port)).map(|_| s))
        .and_then(|s| s.local_addr());
    match probe {
        Ok(addr) if !addr.ip().is_unspecified() => addrs.push(addr.ip()),
        Ok(_) => {}
        Err(e) => tracing::debug!(error = %e, "could not determine primary interface address"),
    }
    addrs
}
