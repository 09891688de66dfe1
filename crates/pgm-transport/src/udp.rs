/// UDP-encapsulated sink and source over `socket2`-configured sockets.
///
/// Socket creation, option plumbing, and errno mapping live here and
/// nowhere else. Two send sockets are kept: ordinary data, and a second
/// one for router-alert traffic so the IP option never contaminates the
/// data path.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{info, warn};

use crate::config::{GroupMembership, TransportConfig};
use crate::error::NetError;
use crate::net::{Datagram, DatagramSink, DatagramSource};

/// DSCP Expedited Forwarding (codepoint 46), shifted into the TOS byte.
const DSCP_EF: u32 = 0x2E << 2;

/// How long a blocking send waits for the socket to clear before its
/// single retry.
const SEND_RETRY_WAIT: Duration = Duration::from_millis(500);

fn is_transient(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(105) // ENOBUFS
}

fn map_send_error(e: &io::Error) -> NetError {
    match e.raw_os_error() {
        Some(101) => NetError::NetDown, // ENETUNREACH
        Some(113) => NetError::NoRoute, // EHOSTUNREACH
        _ if e.kind() == io::ErrorKind::WouldBlock => NetError::WouldBlock,
        _ => NetError::NetDown,
    }
}

fn new_socket(cfg: &TransportConfig, bind: SocketAddr) -> io::Result<Socket> {
    let domain = if bind.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    if let Some(sndbuf) = cfg.sndbuf {
        socket.set_send_buffer_size(sndbuf)?;
    }
    if let Some(rcvbuf) = cfg.rcvbuf {
        socket.set_recv_buffer_size(rcvbuf)?;
    }
    socket.bind(&bind.into())?;
    Ok(socket)
}

fn configure_multicast(cfg: &TransportConfig, socket: &Socket) -> io::Result<()> {
    if cfg.group_addr.is_ipv4() {
        socket.set_multicast_ttl_v4(u32::from(cfg.hops))?;
        socket.set_multicast_loop_v4(cfg.multicast_loop)?;
        // Expedited forwarding; refusal needs CAP_NET_ADMIN and is not
        // fatal.
        if let Err(e) = socket.set_tos(DSCP_EF) {
            warn!(error = %e, "cannot mark expedited forwarding");
        }
    } else {
        socket.set_multicast_hops_v6(u32::from(cfg.hops))?;
        socket.set_multicast_loop_v6(cfg.multicast_loop)?;
    }
    Ok(())
}

/// Sending half: one socket for data, one for router-alert traffic.
pub struct UdpSink {
    send_sock: UdpSocket,
    alert_sock: UdpSocket,
    nonblocking: bool,
}

impl UdpSink {
    pub fn new(cfg: &TransportConfig, bind: SocketAddr) -> io::Result<Self> {
        let send_sock = {
            let s = new_socket(cfg, bind)?;
            configure_multicast(cfg, &s)?;
            UdpSocket::from(s)
        };
        let alert_sock = {
            let s = new_socket(cfg, bind)?;
            configure_multicast(cfg, &s)?;
            UdpSocket::from(s)
        };
        info!(local = %send_sock.local_addr()?, "send sockets bound");
        Ok(UdpSink {
            send_sock,
            alert_sock,
            nonblocking: cfg.nonblocking,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.send_sock.local_addr()
    }
}

impl DatagramSink for UdpSink {
    fn send(
        &self,
        buf: &[u8],
        dst: SocketAddr,
        router_alert: bool,
    ) -> Result<usize, NetError> {
        let socket = if router_alert {
            &self.alert_sock
        } else {
            &self.send_sock
        };
        match socket.send_to(buf, dst) {
            Ok(n) => Ok(n),
            Err(ref e) if is_transient(e) => {
                if self.nonblocking {
                    return Err(NetError::WouldBlock);
                }
                // One bounded wait for the socket to clear, then a single
                // retry.
                std::thread::sleep(SEND_RETRY_WAIT);
                match socket.send_to(buf, dst) {
                    Ok(n) => Ok(n),
                    Err(ref e) if is_transient(e) => {
                        warn!(%dst, "send socket never cleared");
                        Err(NetError::NetDown)
                    }
                    Err(e) => Err(map_send_error(&e)),
                }
            }
            Err(e) => Err(map_send_error(&e)),
        }
    }
}

/// Receiving half.
pub struct UdpSource {
    socket: UdpSocket,
    buf: Vec<u8>,
}

impl UdpSource {
    pub fn new(cfg: &TransportConfig, bind: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::from(new_socket(cfg, bind)?);
        info!(local = %socket.local_addr()?, "receive socket bound");
        Ok(UdpSource {
            socket,
            // Generous margin over the TPDU for encapsulation slop.
            buf: vec![0u8; cfg.tpdu_max as usize + 64],
        })
    }

    /// Join or leave a multicast group on the receive socket.
    pub fn apply_membership(
        &self,
        membership: &GroupMembership,
        join: bool,
    ) -> io::Result<()> {
        match membership.group {
            IpAddr::V4(group) => {
                let iface = Ipv4Addr::UNSPECIFIED;
                if join {
                    self.socket.join_multicast_v4(&group, &iface)
                } else {
                    self.socket.leave_multicast_v4(&group, &iface)
                }
            }
            IpAddr::V6(group) => {
                if join {
                    self.socket.join_multicast_v6(&group, membership.interface)
                } else {
                    self.socket.leave_multicast_v6(&group, membership.interface)
                }
            }
        }
    }
}

impl DatagramSource for UdpSource {
    fn recv(&mut self) -> Result<Option<Datagram>, NetError> {
        match self.socket.recv_from(&mut self.buf) {
            Ok((len, source)) => {
                // Runts are passed through; the parser's counters see
                // them.
                Ok(Some(Datagram {
                    bytes: self.buf[..len].to_vec(),
                    source,
                    destination: None,
                    interface_index: 0,
                }))
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(_) => Err(NetError::NetDown),
        }
    }
}
