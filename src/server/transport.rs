//! Quorumcast server -- UDP endpoints and send helpers.
//!
//! Two datagram endpoints per server: a unicast socket bound to the
//! node's own `host:port` (all peer and client traffic) and a multicast
//! socket joined to the discovery group. Send failures are transient by
//! policy: logged here and compensated by the next periodic tick, never
//! propagated into a message loop.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::protocol::{DiscoveryFrame, WireMsg};
use crate::utils::QuorumcastError;

use super::ServerNode;

/// Derives the host address by opening a scratch datagram socket toward
/// a public address and reading the local endpoint. Falls back to
/// loopback when no route exists, so single-machine fleets still run.
pub(super) fn local_ip() -> IpAddr {
    let probe = || -> Result<IpAddr, std::io::Error> {
        let sock = std::net::UdpSocket::bind("0.0.0.0:0")?;
        sock.connect("8.8.8.8:80")?;
        Ok(sock.local_addr()?.ip())
    };
    match probe() {
        Ok(ip) => ip,
        Err(e) => {
            pf_warn!("cannot derive local ip ({}), using loopback", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

/// Binds the unicast endpoint on the server's own address. Multicast
/// TTL is pinned to the local segment since the same socket also emits
/// the discovery beacons.
pub(super) fn bind_unicast(
    addr: SocketAddr,
) -> Result<UdpSocket, QuorumcastError> {
    let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_multicast_ttl_v4(1)?;
    sock.bind(&addr.into())?;
    sock.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(sock.into())?)
}

/// Builds the multicast receive endpoint: reuse-address so multiple
/// servers can share one machine, bound to the group port, joined to
/// the group on all interfaces.
pub(super) fn bind_multicast(
    group: Ipv4Addr,
    port: u16,
) -> Result<UdpSocket, QuorumcastError> {
    let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_reuse_address(true)?;
    let bind_addr =
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    sock.bind(&bind_addr.into())?;
    sock.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    sock.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(sock.into())?)
}

// ServerNode send helpers
impl ServerNode {
    /// Unicasts one typed message; failures are logged and absorbed.
    pub(super) async fn send_msg(&self, addr: SocketAddr, msg: &WireMsg) {
        match msg.to_bytes() {
            Ok(bytes) => {
                if let Err(e) = self.unicast.send_to(&bytes, addr).await {
                    pf_warn!("send to {} failed: {}", addr, e);
                }
            }
            Err(e) => pf_error!("message encode failed: {}", e),
        }
    }

    /// Unicasts one typed message to a peer server by its id.
    pub(super) async fn send_to_server(&self, sid: &str, msg: &WireMsg) {
        match sid.parse::<SocketAddr>() {
            Ok(addr) => self.send_msg(addr, msg).await,
            Err(e) => pf_error!("bad server id '{}': {}", sid, e),
        }
    }

    /// Transmits a batch of `(server, message)` pairs, e.g. the output
    /// of an election step.
    pub(super) async fn dispatch(
        &self,
        sends: Vec<(crate::protocol::ServerId, WireMsg)>,
    ) {
        for (sid, msg) in sends {
            self.send_to_server(&sid, &msg).await;
        }
    }

    /// Emits a discovery frame onto the multicast channel.
    pub(super) async fn mcast_send(&self, frame: &DiscoveryFrame) {
        let text = frame.to_string();
        if let Err(e) = self
            .unicast
            .send_to(text.as_bytes(), self.mcast_dest)
            .await
        {
            pf_warn!("multicast send failed: {}", e);
        }
    }

    /// Unicasts a bare discovery frame back to a requester (the
    /// `LEADER:` reply path).
    pub(super) async fn send_frame(
        &self,
        addr: SocketAddr,
        frame: &DiscoveryFrame,
    ) {
        if let Err(e) = self
            .unicast
            .send_to(frame.to_string().as_bytes(), addr)
            .await
        {
            pf_warn!("send to {} failed: {}", addr, e);
        }
    }
}
