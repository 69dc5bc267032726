//! Multicast UDP transport shared by every discovery engine.
//!
//! Builds a `socket2` socket with `SO_REUSEADDR` and the right multicast
//! join/TTL options, then hands it off as a `tokio::net::UdpSocket` for a
//! send-then-collect-until-deadline loop.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, trace, warn};

use crate::safety::is_loopback_interface;

/// A bound UDP socket ready to send to (and receive from) a multicast group.
pub struct MulticastSocket {
    socket: tokio::net::UdpSocket,
}

/// Per-receive timeout used while draining a collection window. Bounds how
/// long a single `recv_from` can block past the overall deadline.
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(250);

impl MulticastSocket {
    /// Opens a UDP socket for `group`'s address family, enables address
    /// reuse, sets the multicast TTL (v4) / hop limit (v6), and optionally
    /// binds to `bind_interface` (also setting it as the outgoing multicast
    /// interface). Refuses to bind to a loopback interface.
    pub async fn open(
        group: SocketAddr,
        ttl: u32,
        bind_interface: Option<IpAddr>,
    ) -> Result<Self> {
        if let Some(ip) = bind_interface {
            if is_loopback_interface(ip) {
                anyhow::bail!("refusing to bind multicast socket to loopback interface {ip}");
            }
        }

        let domain = if group.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };
        let sock = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))
            .context("error creating socket")?;
        sock.set_reuse_address(true).context("SO_REUSEADDR")?;
        #[cfg(not(target_os = "windows"))]
        {
            let _ = sock.set_reuse_port(true);
        }

        let bind_addr: SocketAddr = match (bind_interface, group) {
            (Some(IpAddr::V4(ip)), SocketAddr::V4(_)) => SocketAddr::new(IpAddr::V4(ip), 0),
            (Some(IpAddr::V6(ip)), SocketAddr::V6(_)) => SocketAddr::new(IpAddr::V6(ip), 0),
            (_, SocketAddr::V4(_)) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            (_, SocketAddr::V6(_)) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        sock.bind(&bind_addr.into()).context("error binding")?;

        match group {
            SocketAddr::V4(_) => {
                sock.set_multicast_ttl_v4(ttl).context("IP_MULTICAST_TTL")?;
                if let Some(IpAddr::V4(ip)) = bind_interface {
                    if let Err(e) = sock.set_multicast_if_v4(&ip) {
                        debug!(%ip, "failed to set outgoing multicast interface: {e:#}");
                    }
                }
            }
            SocketAddr::V6(_) => {
                sock.set_multicast_hops_v6(ttl).context("IPV6_MULTICAST_HOPS")?;
            }
        }

        sock.set_nonblocking(true).context("set_nonblocking")?;
        let socket = tokio::net::UdpSocket::from_std(sock.into())
            .context("converting socket2 socket to tokio")?;

        Ok(Self { socket })
    }

    /// Sends `payload` to `group` once.
    pub async fn send(&self, payload: &[u8], group: SocketAddr) -> Result<()> {
        self.socket
            .send_to(payload, group)
            .await
            .with_context(|| format!("failed to send to {group}"))?;
        Ok(())
    }

    /// Collects `(source, payload)` datagrams until `deadline` elapses,
    /// invoking `on_datagram` for each. Socket timeouts / deadline expiry end
    /// the loop gracefully (never an error).
    pub async fn collect_until<F>(&self, deadline: Duration, mut on_datagram: F)
    where
        F: FnMut(SocketAddr, &[u8]),
    {
        let mut buf = vec![0u8; 65535];
        let sleep = tokio::time::sleep(deadline);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => break,
                recv = tokio::time::timeout(RECV_POLL_INTERVAL, self.socket.recv_from(&mut buf)) => {
                    match recv {
                        Ok(Ok((len, addr))) => {
                            trace!(?addr, len, "received multicast datagram");
                            on_datagram(addr, &buf[..len]);
                        }
                        Ok(Err(e)) => {
                            warn!("error receiving on multicast socket: {e:#}");
                            break;
                        }
                        Err(_) => continue, // poll interval elapsed, recheck deadline
                    }
                }
            }
        }
    }
}

/// Opens a socket, refusing to fail the whole call if IPv6 fails: errors
/// opening IPv6 multicast are logged and skipped rather than propagated.
pub async fn open_best_effort(
    group: SocketAddr,
    ttl: u32,
    bind_interface: Option<IpAddr>,
) -> Option<MulticastSocket> {
    match MulticastSocket::open(group, ttl, bind_interface).await {
        Ok(sock) => Some(sock),
        Err(e) => {
            if group.is_ipv6() {
                debug!("IPv6 multicast socket unavailable: {e:#}");
            } else {
                warn!("multicast socket setup failed for {group}: {e:#}");
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refuses_loopback_bind() {
        let group: SocketAddr = "239.255.255.250:1900".parse().unwrap();
        let err = MulticastSocket::open(group, 2, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("loopback"));
    }

    #[tokio::test]
    async fn opens_and_sends() {
        let group: SocketAddr = "239.255.255.250:1900".parse().unwrap();
        let sock = MulticastSocket::open(group, 2, None).await.unwrap();
        sock.send(b"ping", group).await.unwrap();
    }
}
