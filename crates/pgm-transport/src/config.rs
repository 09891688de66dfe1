/// Transport configuration. All options are fixed at create/bind time;
/// validation happens before anything takes effect.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::error::ConfigError;
use crate::tsi::Gsi;

/// Host-side cap on multicast memberships, mirroring IP_MAX_MEMBERSHIPS.
pub const MAX_MEMBERSHIPS: usize = 20;

/// Largest fragment train one APDU may span.
pub const MAX_FRAGMENTS: u32 = 16;

/// Minimum TPDU for IPv4 (RFC 2765) and IPv6 (RFC 2460).
pub const MIN_TPDU_IPV4: u16 = 68;
pub const MIN_TPDU_IPV6: u16 = 1280;

/// IP header size assumed by the rate regulator.
pub const IPV4_HEADER_LEN: usize = 20;
pub const IPV6_HEADER_LEN: usize = 40;
pub const UDP_HEADER_LEN: usize = 8;

/// Window sizing: a fixed sequence count, or a time bound translated
/// through the peak rate and TPDU size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowSize {
    Sqns(u32),
    Time { secs: u32, max_rte: u64 },
}

impl WindowSize {
    /// Resolve to a sequence count, bounded to half the sequence space.
    pub fn resolve(&self, tpdu: u16) -> u32 {
        match *self {
            WindowSize::Sqns(n) => n,
            WindowSize::Time { secs, max_rte } => ((secs as u64 * max_rte)
                / tpdu as u64)
                .clamp(1, (1 << 31) - 1) as u32,
        }
    }

    fn is_valid(&self) -> bool {
        match *self {
            WindowSize::Sqns(n) => n > 0 && n < (1 << 31),
            WindowSize::Time { secs, max_rte } => secs > 0 && max_rte > 0,
        }
    }

    /// Peak rate, when sized by time.
    pub fn max_rte(&self) -> Option<u64> {
        match *self {
            WindowSize::Time { max_rte, .. } => Some(max_rte),
            WindowSize::Sqns(_) => None,
        }
    }
}

/// Reed–Solomon parameters for a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FecConfig {
    pub n: u8,
    pub k: u8,
    /// Parity packets transmitted unconditionally at group close.
    pub proactive_h: u8,
    /// Serve repair requests with parity instead of selective RDATA.
    pub ondemand: bool,
    /// Allow unequal TSDU lengths within a group.
    pub varpkt_len: bool,
}

impl FecConfig {
    pub fn h(&self) -> u8 {
        self.n - self.k
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Send and receive.
    #[default]
    Duplex,
    SendOnly,
    RecvOnly,
    /// Receive without ever soliciting repair.
    Passive,
}

impl Mode {
    pub fn can_send(&self) -> bool {
        matches!(self, Mode::Duplex | Mode::SendOnly)
    }

    pub fn can_recv(&self) -> bool {
        matches!(self, Mode::Duplex | Mode::RecvOnly | Mode::Passive)
    }

    pub fn sends_naks(&self) -> bool {
        matches!(self, Mode::Duplex | Mode::RecvOnly)
    }
}

/// UDP encapsulation ports; both must be configured or neither.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpEncapsulation {
    pub ucast_port: u16,
    pub mcast_port: u16,
}

/// One receive-group membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupMembership {
    pub group: IpAddr,
    /// Source-specific join, when set.
    pub source: Option<IpAddr>,
    pub interface: u32,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub gsi: Gsi,
    /// Source port; drawn at random when absent.
    pub sport: Option<u16>,
    /// Data-destination port.
    pub dport: u16,
    /// Multicast destination for everything sent downstream.
    pub group_addr: SocketAddr,
    pub recv_groups: Vec<GroupMembership>,
    pub udp_encapsulation: Option<UdpEncapsulation>,
    pub tpdu_max: u16,
    pub txw: WindowSize,
    pub rxw: WindowSize,
    pub spm_ambient: Duration,
    /// Heartbeat SPM schedule after each data burst.
    pub spm_heartbeat: Vec<Duration>,
    pub peer_expiry: Duration,
    pub nak_bo_ivl: Duration,
    pub nak_rpt_ivl: Duration,
    pub nak_rdata_ivl: Duration,
    pub nak_data_retries: u32,
    pub nak_ncf_retries: u32,
    pub hops: u8,
    pub multicast_loop: bool,
    pub sndbuf: Option<usize>,
    pub rcvbuf: Option<usize>,
    pub mode: Mode,
    pub fec: Option<FecConfig>,
    pub nonblocking: bool,
    pub abort_on_reset: bool,
}

pub const DEFAULT_SPM_AMBIENT: Duration = Duration::from_secs(30);

/// Geometric heartbeat schedule: 100 ms doubling up to the ambient
/// interval.
fn default_heartbeat() -> Vec<Duration> {
    let mut schedule = Vec::new();
    let mut ivl = Duration::from_millis(100);
    while ivl < DEFAULT_SPM_AMBIENT {
        schedule.push(ivl);
        ivl *= 2;
    }
    schedule
}

impl TransportConfig {
    /// Defaults for a duplex transport on the given group; the caller
    /// still picks windows and rate.
    pub fn new(gsi: Gsi, group_addr: SocketAddr) -> Self {
        TransportConfig {
            gsi,
            sport: None,
            dport: group_addr.port(),
            group_addr,
            recv_groups: Vec::new(),
            udp_encapsulation: None,
            tpdu_max: 1500,
            txw: WindowSize::Time {
                secs: 30,
                max_rte: 400_000,
            },
            rxw: WindowSize::Time {
                secs: 30,
                max_rte: 400_000,
            },
            spm_ambient: DEFAULT_SPM_AMBIENT,
            spm_heartbeat: default_heartbeat(),
            peer_expiry: DEFAULT_SPM_AMBIENT.saturating_mul(5),
            nak_bo_ivl: Duration::from_millis(50),
            nak_rpt_ivl: Duration::from_secs(2),
            nak_rdata_ivl: Duration::from_secs(2),
            nak_data_retries: 50,
            nak_ncf_retries: 50,
            hops: 16,
            multicast_loop: false,
            sndbuf: None,
            rcvbuf: None,
            mode: Mode::Duplex,
            fec: None,
            nonblocking: false,
            abort_on_reset: false,
        }
    }

    pub fn is_ipv6(&self) -> bool {
        self.group_addr.is_ipv6()
    }

    /// IP (plus UDP when encapsulated) overhead per packet.
    pub fn iphdr_len(&self) -> usize {
        let ip = if self.is_ipv6() {
            IPV6_HEADER_LEN
        } else {
            IPV4_HEADER_LEN
        };
        if self.udp_encapsulation.is_some() {
            ip + UDP_HEADER_LEN
        } else {
            ip
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let min_tpdu = if self.is_ipv6() {
            MIN_TPDU_IPV6
        } else {
            MIN_TPDU_IPV4
        };
        if self.tpdu_max < min_tpdu {
            return Err(ConfigError::TpduTooSmall(self.tpdu_max, min_tpdu));
        }
        if self.mode.can_send() && !self.txw.is_valid() {
            return Err(ConfigError::NoTxwSize);
        }
        if self.mode.can_recv() && !self.rxw.is_valid() {
            return Err(ConfigError::NoRxwSize);
        }
        if self.sport == Some(self.dport) {
            return Err(ConfigError::PortClash);
        }
        if let Some(encap) = &self.udp_encapsulation {
            if encap.ucast_port == 0 || encap.mcast_port == 0 {
                return Err(ConfigError::HalfUdpEncapsulation);
            }
        }
        if self.hops == 0 {
            return Err(ConfigError::BadHops);
        }
        if self.spm_heartbeat.is_empty() {
            return Err(ConfigError::EmptyHeartbeat);
        }
        if let Some(fec) = &self.fec {
            let k_ok = (2..=128).contains(&fec.k) && fec.k.is_power_of_two();
            let n_ok = fec.n > fec.k;
            if !k_ok || !n_ok {
                return Err(ConfigError::BadFec { n: fec.n, k: fec.k });
            }
            if fec.proactive_h > fec.h() {
                return Err(ConfigError::BadProactive(fec.proactive_h, fec.h()));
            }
        }
        if self.recv_groups.len() > MAX_MEMBERSHIPS {
            return Err(ConfigError::TooManyGroups);
        }
        Ok(())
    }
}
