/// The transport engine: packet dispatch, timers, and the send path.
///
/// One `Transport` owns a transmit window, a peer table of receive
/// windows, the SPM/heartbeat timers and the rate-regulated sender. The
/// host drives it from two lanes: application `send` calls, and an I/O
/// lane that feeds `handle_packet` with received datagrams and calls
/// `drive` whenever `next_deadline` elapses. All entry points take an
/// explicit monotonic `now`.
///
/// Received APDUs and loss indications flow to the application through a
/// channel; nothing in the engine blocks on delivery.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, trace, warn};

use crate::config::{GroupMembership, TransportConfig, MAX_FRAGMENTS, MAX_MEMBERSHIPS};
use crate::error::{ConfigError, NetError, ParseError, PgmError};
use crate::net::{DatagramSink, RegulatedSender, SendOptions};
use crate::packet::{
    self, DataOptions, PacketBody, PacketKind, ParsedPacket, FLAG_PARITY, FLAG_VAR_PKTLEN,
    PGM_HEADER_LEN,
};
use crate::peer::{Peer, PeerTable};
use crate::rate::RateRegulator;
use crate::rxw::{ReceiveWindow, RxwConfig, RxwEvent};
use crate::skb::{FragmentInfo, SockBuf};
use crate::sn::Sqn;
use crate::stats::TransportStats;
use crate::timer::{TimerQueue, Timestamp};
use crate::tsi::Tsi;
use crate::txw::{Retransmit, TransmitWindow};

/// Events surfaced to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One TSDU or reassembled APDU from a peer, in order.
    Data { tsi: Tsi, data: Vec<u8> },
    /// Unrecoverable loss in a peer's stream, reported once per gap.
    Reset { tsi: Tsi, lost: u32 },
    PeerNew { tsi: Tsi },
    PeerExpired { tsi: Tsi },
}

#[derive(Debug, Clone, Copy)]
enum TimerAction {
    AmbientSpm,
    /// Heartbeat position within the schedule; stale generations are
    /// ignored.
    Heartbeat { generation: u64, position: usize },
}

/// Bytes of PGM framing ahead of the payload.
fn pkt_offset(can_fragment: bool) -> usize {
    // Header, data header, and optionally OPT_LENGTH + OPT_FRAGMENT.
    let base = PGM_HEADER_LEN + 8;
    if can_fragment {
        base + 4 + 16
    } else {
        base
    }
}

pub struct Transport {
    config: TransportConfig,
    tsi: Tsi,
    source_nla: IpAddr,
    max_tsdu: usize,
    max_tsdu_fragment: usize,
    max_apdu: usize,
    txw: Option<RwLock<TransmitWindow>>,
    peers: PeerTable,
    timers: TimerQueue<TimerAction>,
    sender: RegulatedSender,
    stats: Arc<TransportStats>,
    events_tx: Sender<TransportEvent>,
    events_rx: Receiver<TransportEvent>,
    spm_sqn: Sqn,
    heartbeat_generation: u64,
    recv_groups: Vec<GroupMembership>,
    blocked_sources: Vec<(IpAddr, IpAddr)>,
    rng: StdRng,
    is_bound: bool,
    is_closed: AtomicBool,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

impl Transport {
    /// Create a transport over the given sink with a caller-provided
    /// random seed, for reproducible runs.
    pub fn with_seed(
        config: TransportConfig,
        sink: Arc<dyn DatagramSink>,
        seed: u64,
    ) -> Result<Self, PgmError> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let sport = match config.sport {
            Some(p) => p,
            None => loop {
                let p: u16 = rng.gen();
                if p != config.dport {
                    break p;
                }
            },
        };
        let tsi = Tsi::new(config.gsi, sport);

        let rate = if config.mode.can_send() {
            config
                .txw
                .max_rte()
                .map(|rte| Arc::new(RateRegulator::new(rte, config.iphdr_len())))
        } else {
            None
        };
        let (events_tx, events_rx) = unbounded();

        info!(%tsi, "transport created");
        Ok(Transport {
            tsi,
            source_nla: if config.is_ipv6() {
                IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
            } else {
                IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)
            },
            max_tsdu: 0,
            max_tsdu_fragment: 0,
            max_apdu: 0,
            txw: None,
            peers: PeerTable::new(),
            timers: TimerQueue::new(),
            sender: RegulatedSender::new(sink, rate),
            stats: Arc::new(TransportStats::new()),
            events_tx,
            events_rx,
            spm_sqn: Sqn(0),
            heartbeat_generation: 0,
            recv_groups: config.recv_groups.clone(),
            blocked_sources: Vec::new(),
            rng,
            is_bound: false,
            is_closed: AtomicBool::new(false),
            config,
        })
    }

    pub fn new(config: TransportConfig, sink: Arc<dyn DatagramSink>) -> Result<Self, PgmError> {
        let seed = rand::random();
        Self::with_seed(config, sink, seed)
    }

    pub fn tsi(&self) -> Tsi {
        self.tsi
    }

    pub fn stats(&self) -> Arc<TransportStats> {
        self.stats.clone()
    }

    /// Receiving side of the event stream; clone freely.
    pub fn events(&self) -> Receiver<TransportEvent> {
        self.events_rx.clone()
    }

    pub fn max_apdu(&self) -> usize {
        self.max_apdu
    }

    fn ensure_open(&self) -> Result<(), PgmError> {
        if self.is_closed.load(Ordering::Acquire) {
            return Err(PgmError::Closed);
        }
        Ok(())
    }

    /// Bind: derive payload maxima, build windows, announce the session.
    pub fn bind(&mut self, source_nla: IpAddr, now: Timestamp) -> Result<(), PgmError> {
        self.ensure_open()?;
        if self.is_bound {
            return Err(PgmError::AlreadyBound);
        }

        let iphdr = self.config.iphdr_len();
        let tpdu = self.config.tpdu_max as usize;
        self.max_tsdu = tpdu - iphdr - pkt_offset(false);
        self.max_tsdu_fragment = tpdu - iphdr - pkt_offset(true);
        let txw_sqns = self.config.txw.resolve(self.config.tpdu_max);
        self.max_apdu = MAX_FRAGMENTS.min(txw_sqns) as usize * self.max_tsdu_fragment;
        self.source_nla = source_nla;

        if self.config.mode.can_send() {
            let initial = Sqn(self.rng.gen());
            self.txw = Some(RwLock::new(TransmitWindow::new(
                txw_sqns,
                initial,
                self.config.fec.as_ref(),
            )));

            // Announce the session before any data can flow.
            for _ in 0..3 {
                self.send_spm(now)?;
            }
            self.timers
                .schedule(now + self.config.spm_ambient, TimerAction::AmbientSpm);
        }

        self.is_bound = true;
        info!(%self.tsi, "transport bound");
        Ok(())
    }

    // ─── membership (validated here, applied by the host's sockets) ────

    pub fn join_group(&mut self, membership: GroupMembership) -> Result<(), PgmError> {
        self.ensure_open()?;
        if self.recv_groups.len() >= MAX_MEMBERSHIPS {
            return Err(ConfigError::TooManyGroups.into());
        }
        self.recv_groups.push(membership);
        Ok(())
    }

    /// Leave succeeds whenever a matching group is present.
    pub fn leave_group(&mut self, group: IpAddr) -> Result<GroupMembership, PgmError> {
        self.ensure_open()?;
        let pos = self
            .recv_groups
            .iter()
            .position(|m| m.group == group && m.source.is_none())
            .ok_or(ConfigError::NoSuchGroup)?;
        Ok(self.recv_groups.remove(pos))
    }

    pub fn join_source_group(
        &mut self,
        membership: GroupMembership,
    ) -> Result<(), PgmError> {
        self.ensure_open()?;
        if membership.source.is_none() {
            return Err(ConfigError::NoSuchGroup.into());
        }
        if self.recv_groups.len() >= MAX_MEMBERSHIPS {
            return Err(ConfigError::TooManyGroups.into());
        }
        self.recv_groups.push(membership);
        Ok(())
    }

    pub fn leave_source_group(
        &mut self,
        group: IpAddr,
        source: IpAddr,
    ) -> Result<GroupMembership, PgmError> {
        self.ensure_open()?;
        let pos = self
            .recv_groups
            .iter()
            .position(|m| m.group == group && m.source == Some(source))
            .ok_or(ConfigError::NoSuchGroup)?;
        Ok(self.recv_groups.remove(pos))
    }

    pub fn block_source(&mut self, group: IpAddr, source: IpAddr) -> Result<(), PgmError> {
        self.ensure_open()?;
        if !self.blocked_sources.contains(&(group, source)) {
            self.blocked_sources.push((group, source));
        }
        Ok(())
    }

    pub fn unblock_source(&mut self, group: IpAddr, source: IpAddr) -> Result<(), PgmError> {
        self.ensure_open()?;
        self.blocked_sources.retain(|&b| b != (group, source));
        Ok(())
    }

    pub fn memberships(&self) -> &[GroupMembership] {
        &self.recv_groups
    }

    // ─── send path ─────────────────────────────────────────────────────

    fn send_options(&self, router_alert: bool) -> SendOptions {
        SendOptions {
            use_rate_limit: true,
            router_alert,
            nonblocking: self.config.nonblocking,
        }
    }

    /// Destination for repair requests to a peer.
    fn upstream_addr(&self, peer_nla: IpAddr) -> SocketAddr {
        let port = self
            .config
            .udp_encapsulation
            .map(|e| e.ucast_port)
            .unwrap_or(self.config.dport);
        SocketAddr::new(peer_nla, port)
    }

    fn record_sent(&self, bytes: usize) {
        TransportStats::bump(&self.stats.packets_sent);
        TransportStats::add(&self.stats.bytes_sent, bytes as u64);
    }

    /// Emit one SPM advertising the transmit window edges.
    fn send_spm(&mut self, now: Timestamp) -> Result<(), PgmError> {
        let Some(txw) = &self.txw else {
            return Err(PgmError::NotBound);
        };
        let (trail, lead) = txw.read().on_spm_request();
        let spm_sqn = self.spm_sqn;
        self.spm_sqn = self.spm_sqn.next();

        let skb = packet::encode_spm(
            self.tsi,
            self.config.dport,
            spm_sqn,
            trail,
            lead,
            self.source_nla,
        )?;
        let wire = skb.as_slice();
        self.sender
            .send(wire, self.config.group_addr, self.send_options(true), now)?;
        self.record_sent(wire.len());
        TransportStats::bump(&self.stats.spms_sent);
        trace!(%spm_sqn, %trail, %lead, "SPM sent");
        Ok(())
    }

    /// Send one APDU. Fragments over multiple TSDUs as needed; FEC groups
    /// that close get their proactive parity on the wire right after.
    pub fn send(&mut self, apdu: &[u8], now: Timestamp) -> Result<(), PgmError> {
        self.ensure_open()?;
        if !self.is_bound {
            return Err(PgmError::NotBound);
        }
        let Some(txw_lock) = &self.txw else {
            return Err(PgmError::NotBound);
        };
        if apdu.len() > self.max_apdu {
            return Err(ConfigError::ApduTooLarge(apdu.len(), self.max_apdu).into());
        }

        let fragments: Vec<&[u8]> = if apdu.len() <= self.max_tsdu {
            vec![apdu]
        } else {
            apdu.chunks(self.max_tsdu_fragment).collect()
        };
        let fragmented = fragments.len() > 1;

        let mut txw = txw_lock.write();
        let first_sqn = txw.lead().next();
        let rollback_lead = txw.lead();
        let mut offset = 0u32;
        let mut closed_groups = Vec::new();

        for chunk in &fragments {
            let mut skb = SockBuf::from_slice(chunk)?;
            skb.tsi = Some(self.tsi);
            if fragmented {
                skb.fragment = Some(FragmentInfo {
                    first_sqn,
                    offset,
                    apdu_len: apdu.len() as u32,
                });
            }
            let fragment = skb.fragment;
            let outcome = txw.add(skb);
            if let Some(group) = outcome.completed_group {
                closed_groups.push(group);
            }

            let wire = packet::encode_data(
                PacketKind::Odata,
                self.tsi,
                self.config.dport,
                outcome.sqn,
                txw.trail(),
                DataOptions {
                    fragment,
                    ..Default::default()
                },
                0,
                chunk,
            )?;

            match self.sender.send(
                wire.as_slice(),
                self.config.group_addr,
                self.send_options(false),
                now,
            ) {
                Ok(n) => {
                    self.record_sent(n);
                    offset += chunk.len() as u32;
                }
                Err(NetError::WouldBlock) => {
                    // Abandon the whole APDU so a retry starts clean.
                    txw.rollback(rollback_lead);
                    TransportStats::bump(&self.stats.rate_deferrals);
                    return Err(PgmError::WouldBlock);
                }
                Err(e) => {
                    txw.rollback(rollback_lead);
                    return Err(e.into());
                }
            }
        }

        for group in closed_groups {
            self.send_proactive_parity(&mut txw, group, now);
        }
        drop(txw);

        // Data went out: restart the heartbeat schedule.
        self.heartbeat_generation += 1;
        let first = self.config.spm_heartbeat[0];
        self.timers.schedule(
            now + first,
            TimerAction::Heartbeat {
                generation: self.heartbeat_generation,
                position: 0,
            },
        );
        Ok(())
    }

    fn send_proactive_parity(
        &self,
        txw: &mut TransmitWindow,
        group: Sqn,
        now: Timestamp,
    ) {
        let parities = match txw.proactive_parity(group) {
            Ok(p) => p,
            Err(e) => {
                warn!(%group, error = %e, "proactive parity unavailable");
                return;
            }
        };
        for parity in parities {
            if let Err(e) = self.send_repair(&parity, PacketKind::Odata, txw.trail(), now) {
                debug!(%group, error = %e, "proactive parity dropped");
            }
        }
    }

    /// Put one repair packet (RDATA, or parity as ODATA/RDATA) on the
    /// wire.
    fn send_repair(
        &self,
        repair: &Retransmit,
        kind: PacketKind,
        trail: Sqn,
        now: Timestamp,
    ) -> Result<(), PgmError> {
        let mut flags = 0u8;
        let mut options = DataOptions {
            fragment: repair.fragment,
            ..Default::default()
        };
        if repair.is_parity {
            flags |= FLAG_PARITY;
            if repair.var_pktlen {
                flags |= FLAG_VAR_PKTLEN;
            }
            options.parity_group = repair.parity_group;
            options.tg_size = self
                .config
                .fec
                .as_ref()
                .map(|f| u32::from(f.k));
        }
        let wire = packet::encode_data(
            kind,
            self.tsi,
            self.config.dport,
            repair.sqn,
            trail,
            options,
            flags,
            &repair.payload,
        )?;
        self.sender.send(
            wire.as_slice(),
            self.config.group_addr,
            self.send_options(false),
            now,
        )?;
        self.record_sent(wire.len());
        if repair.is_parity {
            TransportStats::bump(&self.stats.parity_sent);
        }
        Ok(())
    }

    // ─── receive path ──────────────────────────────────────────────────

    /// Feed one received datagram through parse and dispatch. Per-packet
    /// failures are absorbed into counters.
    pub fn handle_packet(
        &mut self,
        bytes: &[u8],
        source: SocketAddr,
        now: Timestamp,
    ) -> Result<(), PgmError> {
        self.ensure_open()?;
        TransportStats::bump(&self.stats.packets_received);
        TransportStats::add(&self.stats.bytes_received, bytes.len() as u64);

        let parsed = match packet::parse(bytes) {
            Ok(p) => p,
            Err(ParseError::BadChecksum) => {
                TransportStats::bump(&self.stats.checksum_failures);
                trace!(%source, "dropped packet: bad checksum");
                return Ok(());
            }
            Err(e) => {
                TransportStats::bump(&self.stats.malformed_packets);
                trace!(%source, error = %e, "dropped packet");
                return Ok(());
            }
        };

        if self
            .blocked_sources
            .iter()
            .any(|&(_, src)| src == source.ip())
        {
            return Ok(());
        }

        match parsed.header.kind {
            PacketKind::Spm => self.on_spm(&parsed, source, now),
            PacketKind::Odata | PacketKind::Rdata => {
                self.on_data(&parsed, bytes, source, now)
            }
            PacketKind::Nak => self.on_nak(&parsed, now),
            PacketKind::Ncf => self.on_ncf(&parsed, now),
            PacketKind::Nnak | PacketKind::Poll | PacketKind::Polr => {
                trace!(kind = ?parsed.header.kind, "ignoring unhandled packet type");
                Ok(())
            }
        }
    }

    fn rxw_config(&self) -> RxwConfig {
        RxwConfig {
            capacity: self.config.rxw.resolve(self.config.tpdu_max),
            nak_bo_ivl: self.config.nak_bo_ivl,
            nak_rpt_ivl: self.config.nak_rpt_ivl,
            nak_rdata_ivl: self.config.nak_rdata_ivl,
            nak_data_retries: self.config.nak_data_retries,
            nak_ncf_retries: self.config.nak_ncf_retries,
            send_naks: self.config.mode.sends_naks(),
            fec: self.config.fec,
        }
    }

    /// Look up or create the peer for a downstream packet.
    fn peer_for(&mut self, tsi: Tsi, source: SocketAddr, now: Timestamp) -> &mut Peer {
        if !self.peers.contains(&tsi) {
            info!(%tsi, %source, "new peer");
            let peer = Peer {
                tsi,
                rxw: ReceiveWindow::new(self.rxw_config(), self.rng.gen()),
                source_nla: source.ip(),
                group_nla: self.config.group_addr.ip(),
                spm_sqn: None,
                last_packet: now,
                expiry: now + self.config.peer_expiry,
            };
            self.peers.insert(peer);
            TransportStats::bump(&self.stats.peers_created);
            let _ = self.events_tx.send(TransportEvent::PeerNew { tsi });
        }
        self.peers.get_mut(&tsi).expect("inserted above")
    }

    /// Forward window events to the application; tear the peer down on
    /// reset when so configured.
    fn pump_events(&mut self, tsi: Tsi, events: Vec<RxwEvent>) {
        let mut teardown = false;
        for event in events {
            match event {
                RxwEvent::Data(data) => {
                    let _ = self.events_tx.send(TransportEvent::Data { tsi, data });
                }
                RxwEvent::Reset { lost } => {
                    warn!(%tsi, lost, "unrecoverable loss");
                    TransportStats::bump(&self.stats.resets);
                    let _ = self.events_tx.send(TransportEvent::Reset { tsi, lost });
                    teardown |= self.config.abort_on_reset;
                }
            }
        }
        if teardown {
            debug!(%tsi, "peer torn down after reset");
            self.peers.remove(&tsi);
            let _ = self.events_tx.send(TransportEvent::PeerExpired { tsi });
        }
    }

    fn on_spm(
        &mut self,
        parsed: &ParsedPacket,
        source: SocketAddr,
        now: Timestamp,
    ) -> Result<(), PgmError> {
        if !self.config.mode.can_recv() || parsed.tsi() == self.tsi {
            return Ok(());
        }
        let PacketBody::Spm(spm) = parsed.body else {
            return Ok(());
        };
        let tsi = parsed.tsi();
        let expiry = self.config.peer_expiry;
        let peer = self.peer_for(tsi, source, now);
        peer.touch(now, expiry);
        if !peer.accept_spm(spm.spm_sqn) {
            trace!(%tsi, "stale SPM");
            return Ok(());
        }
        peer.source_nla = spm.nla;
        let events = peer.rxw.on_spm(spm.trail, now);
        self.pump_events(tsi, events);
        Ok(())
    }

    fn on_data(
        &mut self,
        parsed: &ParsedPacket,
        bytes: &[u8],
        source: SocketAddr,
        now: Timestamp,
    ) -> Result<(), PgmError> {
        if !self.config.mode.can_recv() || parsed.tsi() == self.tsi {
            return Ok(());
        }
        let PacketBody::Data(data) = parsed.body else {
            return Ok(());
        };
        let tsi = parsed.tsi();
        let payload = &bytes[data.payload_offset..];
        let expiry = self.config.peer_expiry;

        let events = if parsed.is_parity() {
            let Some(fec) = self.config.fec else {
                TransportStats::bump(&self.stats.malformed_packets);
                return Ok(());
            };
            let Some(group) = data.parity_group else {
                TransportStats::bump(&self.stats.malformed_packets);
                return Ok(());
            };
            if let Some(tg) = data.tg_size {
                if tg != u32::from(fec.k) {
                    TransportStats::bump(&self.stats.malformed_packets);
                    return Ok(());
                }
            }
            // Parity index from the sequence: group + k + index.
            let index = group.add(u32::from(fec.k)).distance(data.sqn);
            if index < 0 || index >= i32::from(fec.h()) {
                TransportStats::bump(&self.stats.malformed_packets);
                return Ok(());
            }
            let peer = self.peer_for(tsi, source, now);
            peer.touch(now, expiry);
            peer.rxw
                .push_parity(group, index as u8, payload.to_vec(), data.trail, now)
        } else {
            let mut skb = match SockBuf::from_slice(payload) {
                Ok(skb) => skb,
                Err(_) => return Ok(()),
            };
            skb.tsi = Some(tsi);
            skb.sqn = Some(data.sqn);
            skb.fragment = data.fragment;
            let peer = self.peer_for(tsi, source, now);
            peer.touch(now, expiry);
            peer.rxw.push_data(skb, data.trail, now)
        };
        self.pump_events(tsi, events);
        Ok(())
    }

    /// A receiver asked for repair: confirm with an NCF, then serve
    /// RDATA: parity when the session runs on-demand FEC, selective
    /// otherwise.
    fn on_nak(&mut self, parsed: &ParsedPacket, now: Timestamp) -> Result<(), PgmError> {
        let Some(txw_lock) = &self.txw else {
            return Ok(());
        };
        // NAKs name our session: our GSI, our sport in the destination
        // port field.
        if parsed.header.gsi != self.tsi.gsi || parsed.header.dport != self.tsi.sport {
            trace!("NAK for a different session");
            return Ok(());
        }
        let PacketBody::Nak(nak) = parsed.body else {
            return Ok(());
        };
        TransportStats::bump(&self.stats.naks_received);
        debug!(sqn = %nak.sqn, "NAK received");

        // Confirm receipt to the whole group.
        let ncf = packet::encode_nak_like(
            PacketKind::Ncf,
            self.tsi,
            self.config.dport,
            nak.sqn,
            nak.src_nla,
            nak.grp_nla,
        )?;
        match self.sender.send(
            ncf.as_slice(),
            self.config.group_addr,
            self.send_options(true),
            now,
        ) {
            Ok(n) => {
                self.record_sent(n);
                TransportStats::bump(&self.stats.ncfs_sent);
            }
            Err(e) => debug!(error = %e, "NCF dropped"),
        }

        let ondemand_parity = self.config.fec.map_or(false, |f| f.ondemand);
        let (repair, trail) = if ondemand_parity {
            let mut txw = txw_lock.write();
            let r = txw.retransmit_parity(nak.sqn);
            (r, txw.trail())
        } else {
            let txw = txw_lock.read();
            (txw.retransmit(nak.sqn), txw.trail())
        };

        match repair {
            Ok(repair) => {
                self.send_repair(&repair, PacketKind::Rdata, trail, now)?;
                TransportStats::bump(&self.stats.rdata_sent);
            }
            Err(crate::error::WindowError::Gone) => {
                TransportStats::bump(&self.stats.naks_gone);
                debug!(sqn = %nak.sqn, "NAK for evicted data");
            }
            Err(e) => {
                debug!(sqn = %nak.sqn, error = %e, "NAK not serviceable");
            }
        }
        Ok(())
    }

    fn on_ncf(&mut self, parsed: &ParsedPacket, now: Timestamp) -> Result<(), PgmError> {
        if !self.config.mode.can_recv() {
            return Ok(());
        }
        let PacketBody::Nak(ncf) = parsed.body else {
            return Ok(());
        };
        let tsi = parsed.tsi();
        if tsi == self.tsi {
            return Ok(());
        }
        let Some(peer) = self.peers.get_mut(&tsi) else {
            return Ok(());
        };
        peer.touch(now, self.config.peer_expiry);
        let events = peer.rxw.on_ncf(ncf.sqn, now);
        self.pump_events(tsi, events);
        Ok(())
    }

    // ─── timers ────────────────────────────────────────────────────────

    /// Earliest pending deadline across SPM timers and all peers. A
    /// destroyed transport has nothing left to wake for.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        if self.is_closed.load(Ordering::Acquire) {
            return None;
        }
        [self.timers.next_deadline(), self.peers.next_deadline()]
            .into_iter()
            .flatten()
            .min()
    }

    /// Run everything that has come due: SPM heartbeats, NAK back-off and
    /// repair timeouts, peer expiry.
    pub fn drive(&mut self, now: Timestamp) -> Result<(), PgmError> {
        self.ensure_open()?;

        while let Some(action) = self.timers.pop_due(now) {
            match action {
                TimerAction::AmbientSpm => {
                    if let Err(e) = self.send_spm(now) {
                        debug!(error = %e, "ambient SPM deferred");
                    }
                    self.timers
                        .schedule(now + self.config.spm_ambient, TimerAction::AmbientSpm);
                }
                TimerAction::Heartbeat {
                    generation,
                    position,
                } => {
                    if generation != self.heartbeat_generation {
                        continue; // superseded by newer data
                    }
                    if let Err(e) = self.send_spm(now) {
                        debug!(error = %e, "heartbeat SPM deferred");
                    }
                    if let Some(next) = self.config.spm_heartbeat.get(position + 1) {
                        self.timers.schedule(
                            now + *next,
                            TimerAction::Heartbeat {
                                generation,
                                position: position + 1,
                            },
                        );
                    }
                }
            }
        }

        // Per-peer repair state machines.
        for tsi in self.peers.tsis() {
            let Some(peer) = self.peers.get_mut(&tsi) else {
                continue;
            };
            let outcome = peer.rxw.drive(now);
            let source_nla = peer.source_nla;
            let group_nla = peer.group_nla;
            for sqn in &outcome.naks {
                let nak = packet::encode_nak_like(
                    PacketKind::Nak,
                    tsi,
                    self.config.dport,
                    *sqn,
                    source_nla,
                    group_nla,
                )?;
                match self.sender.send(
                    nak.as_slice(),
                    self.upstream_addr(source_nla),
                    self.send_options(true),
                    now,
                ) {
                    Ok(n) => {
                        self.record_sent(n);
                        TransportStats::bump(&self.stats.naks_sent);
                        debug!(%tsi, %sqn, "NAK sent");
                    }
                    Err(e) => debug!(%tsi, %sqn, error = %e, "NAK dropped"),
                }
            }
            self.pump_events(tsi, outcome.events);
        }

        // Quiet peers age out.
        for tsi in self.peers.expire(now) {
            info!(%tsi, "peer expired");
            TransportStats::bump(&self.stats.peers_expired);
            let _ = self.events_tx.send(TransportEvent::PeerExpired { tsi });
        }
        Ok(())
    }

    /// Mark the transport closed and release windows, peers, and the
    /// rate regulator. Both lanes observe the flag on entry; every later
    /// operation returns `Closed`.
    pub fn destroy(&mut self) {
        if self.is_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(%self.tsi, "transport destroyed");
        self.timers.clear();
        self.peers = PeerTable::new();
        self.txw = None;
        self.sender.release_rate();
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.destroy();
    }
}
