/// Receive window: per-peer sequencing, gap repair, and in-order release.
///
/// Slots live in a ring between `trail` (low edge) and `lead` (highest
/// sequence observed); `commit_lead` is the next sequence to release to
/// the application, so `trail <= commit_lead <= lead + 1` and slots below
/// `commit_lead` are released-and-retained until the trail advances over
/// them. Release is strictly in order: a slot leaves through `commit_lead`
/// only with data present and, for fragmented traffic, a complete APDU.
///
/// Repair per slot follows the NAK state machine:
///
/// ```text
/// LOST --back-off--> WAIT_NCF --NCF--> WAIT_DATA --RDATA--> HAVE_DATA
///   ^                    |                  |
///   +----timeout---------+------timeout-----+   (until retries exhaust)
/// ```
///
/// Exhaustion, or the sender advertising its trailing edge past a hole,
/// makes the loss definitive: the window skips the gap and surfaces one
/// reset indication for the run.
///
/// Parity packets are kept in a per-group set rather than at slots; once
/// a group holds at least `k` of data-plus-parity, the missing data is
/// reconstructed in place and rejoins the normal release path.

use std::collections::HashMap;
use std::time::Duration;

use pgm_fec::RsCodec;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace, warn};

use crate::config::FecConfig;
use crate::parity::{build_symbol, parse_symbol, SYMBOL_TAIL};
use crate::skb::SockBuf;
use crate::sn::Sqn;
use crate::timer::{TimerQueue, Timestamp};

#[derive(Debug, Clone)]
pub struct RxwConfig {
    pub capacity: u32,
    pub nak_bo_ivl: Duration,
    pub nak_rpt_ivl: Duration,
    pub nak_rdata_ivl: Duration,
    pub nak_data_retries: u32,
    pub nak_ncf_retries: u32,
    /// False for passive receivers: no repair solicitation at all.
    pub send_naks: bool,
    pub fec: Option<FecConfig>,
}

/// What the window hands up to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RxwEvent {
    /// One TSDU or fully reassembled APDU, in sender order.
    Data(Vec<u8>),
    /// The window skipped an unrecoverable gap of `lost` sequences.
    Reset { lost: u32 },
}

/// NAKs the engine must transmit after a drive pass.
#[derive(Debug, Default)]
pub struct DriveOutcome {
    pub naks: Vec<Sqn>,
    pub events: Vec<RxwEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    HaveData,
    Lost,
    WaitNcf,
    WaitData,
    /// Loss is definitive; the release pass will skip it.
    Unrecoverable,
    /// Released; retained below commit_lead until the trail moves.
    Committed,
}

#[derive(Debug)]
struct Slot {
    state: SlotState,
    skb: Option<SockBuf>,
    /// Current state-machine deadline; timer entries not matching this
    /// are stale and ignored.
    deadline: Timestamp,
    /// NAKs transmitted for this slot.
    nak_transmits: u32,
    /// NCF-confirmed waits that timed out without repair data.
    data_waits: u32,
}

impl Slot {
    fn repairing(&self) -> bool {
        matches!(
            self.state,
            SlotState::Lost | SlotState::WaitNcf | SlotState::WaitData
        )
    }
}

enum ApduStatus {
    Complete { data: Vec<u8>, count: u32 },
    Incomplete,
    Broken,
}

pub struct ReceiveWindow {
    cfg: RxwConfig,
    ring: Vec<Option<Slot>>,
    trail: Sqn,
    commit_lead: Sqn,
    lead: Sqn,
    /// Sender-advertised trailing edge.
    rxw_trail: Sqn,
    defined: bool,
    timers: TimerQueue<(Sqn, Timestamp)>,
    rng: StdRng,
    codec: Option<RsCodec>,
    /// Transmission group -> received parity symbols (index, symbol).
    parity_groups: HashMap<u32, Vec<(u8, Vec<u8>)>>,

    pub cumulative_losses: u64,
    pub duplicates: u64,
    pub stale_packets: u64,
    pub fec_recoveries: u64,
}

impl ReceiveWindow {
    pub fn new(cfg: RxwConfig, seed: u64) -> Self {
        let codec = cfg
            .fec
            .as_ref()
            .map(|f| RsCodec::new(f.n, f.k).expect("validated FEC parameters"));
        let mut ring = Vec::with_capacity(cfg.capacity as usize);
        ring.resize_with(cfg.capacity as usize, || None);
        ReceiveWindow {
            ring,
            trail: Sqn(0),
            commit_lead: Sqn(0),
            lead: Sqn(0),
            rxw_trail: Sqn(0),
            defined: false,
            timers: TimerQueue::new(),
            rng: StdRng::seed_from_u64(seed),
            codec,
            parity_groups: HashMap::new(),
            cumulative_losses: 0,
            duplicates: 0,
            stale_packets: 0,
            fec_recoveries: 0,
            cfg,
        }
    }

    pub fn trail(&self) -> Sqn {
        self.trail
    }

    pub fn lead(&self) -> Sqn {
        self.lead
    }

    pub fn commit_lead(&self) -> Sqn {
        self.commit_lead
    }

    pub fn len(&self) -> u32 {
        if !self.defined {
            return 0;
        }
        let d = self.trail.distance(self.lead);
        if d < 0 {
            0
        } else {
            d as u32 + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when repair or release work is pending.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.timers.next_deadline()
    }

    fn index(&self, sqn: Sqn) -> usize {
        (sqn.get() % self.cfg.capacity) as usize
    }

    fn in_window(&self, sqn: Sqn) -> bool {
        self.defined && self.trail.serial_lte(sqn) && sqn.serial_lte(self.lead)
    }

    fn slot(&self, sqn: Sqn) -> Option<&Slot> {
        if !self.in_window(sqn) {
            return None;
        }
        self.ring[self.index(sqn)].as_ref()
    }

    fn slot_mut(&mut self, sqn: Sqn) -> Option<&mut Slot> {
        if !self.in_window(sqn) {
            return None;
        }
        let idx = self.index(sqn);
        self.ring[idx].as_mut()
    }

    fn backoff_deadline(&mut self, now: Timestamp) -> Timestamp {
        let bo = self.cfg.nak_bo_ivl.as_micros() as u64;
        now + Duration::from_micros(self.rng.gen_range(0..=bo))
    }

    fn define(&mut self, sqn: Sqn) {
        self.trail = sqn;
        self.commit_lead = sqn;
        self.lead = sqn.prev();
        self.rxw_trail = sqn;
        self.defined = true;
    }

    /// Open one freshly observed gap slot.
    fn open_lost(&mut self, sqn: Sqn, now: Timestamp) {
        let deadline = if self.cfg.send_naks {
            self.backoff_deadline(now)
        } else {
            Timestamp::ZERO
        };
        let idx = self.index(sqn);
        self.ring[idx] = Some(Slot {
            state: SlotState::Lost,
            skb: None,
            deadline,
            nak_transmits: 0,
            data_waits: 0,
        });
        self.cumulative_losses += 1;
        if self.cfg.send_naks {
            self.timers.schedule(deadline, (sqn, deadline));
        }
    }

    /// Drop the trail slot to make room, surfacing a reset if it takes
    /// un-released data with it.
    fn evict_trail(&mut self, events: &mut Vec<RxwEvent>) {
        let idx = self.index(self.trail);
        let dropped = self.ring[idx].take();
        if self.trail == self.commit_lead {
            // The window overran un-released state; the gap is gone for
            // good.
            if let Some(slot) = dropped {
                if slot.state != SlotState::Committed {
                    events.push(RxwEvent::Reset { lost: 1 });
                }
            }
            self.commit_lead = self.commit_lead.next();
        }
        let k_group = self.codec.as_ref().map(|c| {
            let k = c.k() as u32;
            self.trail.tg_start(k)
        });
        if let Some(group) = k_group {
            self.parity_groups.remove(&group.get());
        }
        self.trail = self.trail.next();
    }

    /// Extend the lead to `sqn`, opening intermediate slots as LOST.
    /// With `open_final` the slot at `sqn` itself is opened too;
    /// otherwise the caller fills it immediately after.
    fn extend_lead(
        &mut self,
        sqn: Sqn,
        open_final: bool,
        now: Timestamp,
        events: &mut Vec<RxwEvent>,
    ) {
        let jump = self.lead.distance(sqn);
        debug_assert!(jump > 0);
        if jump as u32 > self.cfg.capacity {
            // The gap is wider than the window can represent: everything
            // pending is lost. Restart at the new position.
            let pending = self.commit_lead.serial_lte(self.lead);
            warn!(jump, "sequence jump beyond window, restarting");
            if pending {
                let lost = self.commit_lead.distance(self.lead) as u32 + 1;
                events.push(RxwEvent::Reset { lost });
                self.cumulative_losses += u64::from(lost);
            }
            for entry in self.ring.iter_mut() {
                *entry = None;
            }
            self.parity_groups.clear();
            self.define(sqn);
            self.lead = sqn;
            if open_final {
                self.open_lost(sqn, now);
            }
            return;
        }
        while self.lead.serial_lt(sqn) {
            let s = self.lead.next();
            self.lead = s;
            while self.len() > self.cfg.capacity {
                self.evict_trail(events);
            }
            if s != sqn || open_final {
                self.open_lost(s, now);
            }
        }
    }

    /// Apply a sender-advertised trailing edge (from SPM or data).
    fn update_trailing_edge(
        &mut self,
        new_trail: Sqn,
        events: &mut Vec<RxwEvent>,
    ) {
        if !self.defined || !self.rxw_trail.serial_lt(new_trail) {
            return;
        }
        self.rxw_trail = new_trail;

        // Anything still under repair below the sender's trail can never
        // be served.
        let mut s = self.commit_lead;
        while s.serial_lt(new_trail) && s.serial_lte(self.lead) {
            if let Some(slot) = self.slot_mut(s) {
                if slot.repairing() {
                    slot.state = SlotState::Unrecoverable;
                    slot.deadline = Timestamp::ZERO;
                }
            }
            s = s.next();
        }

        // Retained committed slots below the new trail are dead weight.
        while self.trail.serial_lt(self.commit_lead) && self.trail.serial_lt(new_trail) {
            let idx = self.index(self.trail);
            self.ring[idx] = None;
            self.trail = self.trail.next();
        }
        let _ = events;
    }

    /// Ingest an ODATA or RDATA packet. `skb.sqn` names the sequence and
    /// `pkt_trail` is the trailing edge the packet advertised.
    pub fn push_data(
        &mut self,
        skb: SockBuf,
        pkt_trail: Sqn,
        now: Timestamp,
    ) -> Vec<RxwEvent> {
        let mut events = Vec::new();
        let sqn = skb.sqn.expect("data packet carries a sequence");

        if !self.defined {
            self.define(sqn);
        }
        self.update_trailing_edge(pkt_trail, &mut events);

        if sqn.serial_lt(self.trail) {
            trace!(%sqn, "stale packet below trail");
            self.stale_packets += 1;
            return events;
        }

        if self.defined && sqn.serial_lte(self.lead) {
            let slot = self
                .slot_mut(sqn)
                .expect("every slot inside the window is occupied");
            match slot.state {
                SlotState::HaveData | SlotState::Committed => {
                    self.duplicates += 1;
                    return events;
                }
                SlotState::Lost
                | SlotState::WaitNcf
                | SlotState::WaitData
                | SlotState::Unrecoverable => {
                    debug!(%sqn, "repair filled slot");
                    slot.state = SlotState::HaveData;
                    slot.skb = Some(skb);
                    slot.deadline = Timestamp::ZERO;
                }
            }
        } else {
            self.extend_lead(sqn, false, now, &mut events);
            let idx = self.index(sqn);
            self.ring[idx] = Some(Slot {
                state: SlotState::HaveData,
                skb: Some(skb),
                deadline: Timestamp::ZERO,
                nak_transmits: 0,
                data_waits: 0,
            });
        }

        if self.codec.is_some() {
            self.try_fec_decode(sqn, &mut events);
        }
        self.release(&mut events);
        events
    }

    /// Ingest a parity packet for `group` with the given parity index.
    pub fn push_parity(
        &mut self,
        group: Sqn,
        parity_index: u8,
        symbol: Vec<u8>,
        pkt_trail: Sqn,
        now: Timestamp,
    ) -> Vec<RxwEvent> {
        let mut events = Vec::new();
        let Some(k) = self.codec.as_ref().map(|c| c.k() as u32) else {
            self.stale_packets += 1;
            return events;
        };
        if symbol.len() < SYMBOL_TAIL {
            self.stale_packets += 1;
            return events;
        }

        if !self.defined {
            self.define(group);
        }
        self.update_trailing_edge(pkt_trail, &mut events);

        if group.serial_lt(self.trail.tg_start(k)) {
            self.stale_packets += 1;
            return events;
        }

        // A parity packet proves the group was fully transmitted.
        let group_end = group.add(k - 1);
        if group_end.serial_gt(self.lead) {
            self.extend_lead(group_end, true, now, &mut events);
        }

        let entry = self.parity_groups.entry(group.get()).or_default();
        if !entry.iter().any(|(idx, _)| *idx == parity_index) {
            entry.push((parity_index, symbol));
        } else {
            self.duplicates += 1;
        }

        self.try_fec_decode(group, &mut events);
        self.release(&mut events);
        events
    }

    /// Attempt erasure decoding for the group containing `sqn`.
    fn try_fec_decode(&mut self, sqn: Sqn, events: &mut Vec<RxwEvent>) {
        let Some(codec) = &self.codec else { return };
        let k = codec.k() as u32;
        let group = sqn.tg_start(k);
        let Some(parities) = self.parity_groups.get(&group.get()) else {
            return;
        };
        if parities.is_empty() {
            return;
        }
        let symbol_len = parities[0].1.len();

        let mut missing: Vec<u32> = Vec::new();
        let mut present = 0u32;
        for off in 0..k {
            match self.slot(group.add(off)) {
                Some(slot)
                    if matches!(
                        slot.state,
                        SlotState::HaveData | SlotState::Committed
                    ) =>
                {
                    present += 1
                }
                _ => missing.push(off),
            }
        }
        if missing.is_empty() {
            self.parity_groups.remove(&group.get());
            return;
        }
        if present + (parities.len() as u32) < k {
            return; // not enough blocks yet
        }

        // Build the k participating symbols: data where present, parity
        // standing in for erasures.
        let mut blocks: Vec<Vec<u8>> = Vec::with_capacity(k as usize);
        let mut rows: Vec<u8> = Vec::with_capacity(k as usize);
        let mut parity_iter = parities.iter();
        let mut usable = true;
        for off in 0..k {
            if missing.contains(&off) {
                match parity_iter.next() {
                    Some((idx, sym)) if sym.len() == symbol_len => {
                        blocks.push(sym.clone());
                        rows.push(codec.k() + idx);
                    }
                    _ => {
                        usable = false;
                        break;
                    }
                }
            } else {
                let slot = self.slot(group.add(off)).expect("present above");
                let skb = slot.skb.as_ref().expect("data slots hold a buffer");
                if skb.len() + SYMBOL_TAIL > symbol_len {
                    usable = false;
                    break;
                }
                blocks.push(build_symbol(skb.as_slice(), skb.fragment, symbol_len));
                rows.push(off as u8);
            }
        }
        if !usable {
            return;
        }

        let mut refs: Vec<&mut [u8]> = blocks.iter_mut().map(|v| v.as_mut_slice()).collect();
        if let Err(e) = codec.decode_parity_inline(&mut refs, &rows) {
            warn!(%group, error = %e, "parity decode failed");
            return;
        }

        for &off in &missing {
            let sym = &blocks[off as usize];
            let Some((payload, fragment)) = parse_symbol(sym) else {
                warn!(%group, off, "reconstructed symbol is inconsistent");
                continue;
            };
            let s = group.add(off);
            let mut skb = match SockBuf::from_slice(&payload) {
                Ok(skb) => skb,
                Err(_) => continue,
            };
            skb.sqn = Some(s);
            skb.fragment = fragment;
            if let Some(slot) = self.slot_mut(s) {
                if slot.state != SlotState::HaveData && slot.state != SlotState::Committed {
                    slot.state = SlotState::HaveData;
                    slot.skb = Some(skb);
                    slot.deadline = Timestamp::ZERO;
                    self.fec_recoveries += 1;
                }
            }
        }
        self.parity_groups.remove(&group.get());
        let _ = events;
    }

    /// Sender heartbeat: newer SPM advances the trailing edge.
    pub fn on_spm(&mut self, spm_trail: Sqn, _now: Timestamp) -> Vec<RxwEvent> {
        let mut events = Vec::new();
        if !self.defined {
            // Nothing received yet; adopt the advertised edge so the
            // first data packet can't pre-date it.
            self.rxw_trail = spm_trail;
            return events;
        }
        self.update_trailing_edge(spm_trail, &mut events);
        self.release(&mut events);
        events
    }

    /// NCF observed for `sqn`: the source has promised repair.
    pub fn on_ncf(&mut self, sqn: Sqn, now: Timestamp) -> Vec<RxwEvent> {
        let mut events = Vec::new();
        if !self.defined {
            return events;
        }
        if sqn.serial_lt(self.trail) {
            self.stale_packets += 1;
            return events;
        }
        if sqn.serial_gt(self.lead) {
            // Repair promised for data we never saw: open the gap.
            self.extend_lead(sqn, true, now, &mut events);
        }
        let rdata_ivl = self.cfg.nak_rpt_ivl.min(self.cfg.nak_rdata_ivl);
        let deadline = now + rdata_ivl;
        if let Some(slot) = self.slot_mut(sqn) {
            match slot.state {
                SlotState::Lost | SlotState::WaitNcf => {
                    slot.state = SlotState::WaitData;
                    slot.data_waits += 1;
                    slot.deadline = deadline;
                    self.timers.schedule(deadline, (sqn, deadline));
                }
                SlotState::WaitData
                | SlotState::HaveData
                | SlotState::Committed
                | SlotState::Unrecoverable => {}
            }
        }
        events
    }

    /// Fire due repair timers. Returns NAKs to transmit and any release
    /// or reset events caused by retry exhaustion.
    pub fn drive(&mut self, now: Timestamp) -> DriveOutcome {
        let mut out = DriveOutcome::default();
        while let Some((sqn, fired)) = self.timers.pop_due(now) {
            let cfg_ncf_retries = self.cfg.nak_ncf_retries;
            let cfg_data_retries = self.cfg.nak_data_retries;
            let rpt = self.cfg.nak_rpt_ivl;
            let bo = self.backoff_deadline(now);
            let Some(slot) = self.slot_mut(sqn) else {
                continue; // slot left the window
            };
            if slot.deadline != fired {
                continue; // superseded
            }
            match slot.state {
                SlotState::Lost => {
                    if slot.nak_transmits >= cfg_ncf_retries {
                        debug!(%sqn, "NAK retries exhausted");
                        slot.state = SlotState::Unrecoverable;
                        slot.deadline = Timestamp::ZERO;
                    } else {
                        slot.state = SlotState::WaitNcf;
                        slot.nak_transmits += 1;
                        let deadline = now + rpt;
                        slot.deadline = deadline;
                        self.timers.schedule(deadline, (sqn, deadline));
                        out.naks.push(sqn);
                    }
                }
                SlotState::WaitNcf => {
                    // No confirmation arrived.
                    if slot.nak_transmits >= cfg_ncf_retries {
                        debug!(%sqn, "no NCF after final NAK");
                        slot.state = SlotState::Unrecoverable;
                        slot.deadline = Timestamp::ZERO;
                    } else {
                        slot.state = SlotState::Lost;
                        slot.deadline = bo;
                        self.timers.schedule(bo, (sqn, bo));
                    }
                }
                SlotState::WaitData => {
                    // Confirmed but the repair never came.
                    if slot.data_waits >= cfg_data_retries {
                        debug!(%sqn, "repair data never arrived");
                        slot.state = SlotState::Unrecoverable;
                        slot.deadline = Timestamp::ZERO;
                    } else {
                        slot.state = SlotState::Lost;
                        slot.deadline = bo;
                        self.timers.schedule(bo, (sqn, bo));
                    }
                }
                _ => {}
            }
        }
        self.release(&mut out.events);
        out
    }

    // ─── in-order release ──────────────────────────────────────────────

    fn release(&mut self, events: &mut Vec<RxwEvent>) {
        loop {
            if !self.defined || self.lead.serial_lt(self.commit_lead) {
                return;
            }
            let Some(slot) = self.slot(self.commit_lead) else {
                return;
            };
            match slot.state {
                SlotState::HaveData => {
                    let skb = slot.skb.as_ref().expect("data slot holds a buffer");
                    match skb.fragment {
                        None => {
                            let data = skb.as_slice().to_vec();
                            self.mark_committed(self.commit_lead);
                            self.commit_lead = self.commit_lead.next();
                            events.push(RxwEvent::Data(data));
                        }
                        Some(frag) => match self.try_assemble_apdu(self.commit_lead, frag) {
                            ApduStatus::Complete { data, count } => {
                                for i in 0..count {
                                    self.mark_committed(self.commit_lead.add(i));
                                }
                                self.commit_lead = self.commit_lead.add(count);
                                events.push(RxwEvent::Data(data));
                            }
                            ApduStatus::Incomplete => return,
                            ApduStatus::Broken => {
                                self.condemn_apdu(self.commit_lead, frag);
                                continue;
                            }
                        },
                    }
                }
                SlotState::Unrecoverable => {
                    let mut lost = 0u32;
                    while let Some(slot) = self.slot(self.commit_lead) {
                        if slot.state != SlotState::Unrecoverable {
                            break;
                        }
                        self.mark_committed(self.commit_lead);
                        self.commit_lead = self.commit_lead.next();
                        lost += 1;
                    }
                    events.push(RxwEvent::Reset { lost });
                }
                SlotState::Lost | SlotState::WaitNcf | SlotState::WaitData => return,
                SlotState::Committed => {
                    // Should not sit at commit_lead; step over.
                    debug_assert!(false, "committed slot at commit_lead");
                    self.commit_lead = self.commit_lead.next();
                }
            }
        }
    }

    fn mark_committed(&mut self, sqn: Sqn) {
        if let Some(slot) = self.slot_mut(sqn) {
            slot.state = SlotState::Committed;
            slot.deadline = Timestamp::ZERO;
        }
    }

    /// Walk an APDU starting at `start`, whose slot carries `frag`.
    fn try_assemble_apdu(&self, start: Sqn, frag: crate::skb::FragmentInfo) -> ApduStatus {
        if frag.first_sqn != start {
            // Head fragments are gone; the APDU can never complete.
            return ApduStatus::Broken;
        }
        let mut data: Vec<u8> = Vec::with_capacity(frag.apdu_len as usize);
        let mut count = 0u32;
        loop {
            let s = start.add(count);
            if s.serial_gt(self.lead) {
                return ApduStatus::Incomplete;
            }
            let Some(slot) = self.slot(s) else {
                return ApduStatus::Incomplete;
            };
            match slot.state {
                SlotState::HaveData => {
                    let skb = slot.skb.as_ref().expect("data slot holds a buffer");
                    match skb.fragment {
                        Some(f)
                            if f.first_sqn == frag.first_sqn
                                && f.apdu_len == frag.apdu_len
                                && f.offset as usize == data.len() =>
                        {
                            data.extend_from_slice(skb.as_slice());
                            count += 1;
                            if data.len() as u32 == frag.apdu_len {
                                return ApduStatus::Complete { data, count };
                            }
                            if data.len() as u32 > frag.apdu_len {
                                return ApduStatus::Broken;
                            }
                        }
                        // A different APDU (or none) where a fragment was
                        // expected: the stream is inconsistent.
                        _ => return ApduStatus::Broken,
                    }
                }
                SlotState::Lost | SlotState::WaitNcf | SlotState::WaitData => {
                    return ApduStatus::Incomplete
                }
                SlotState::Unrecoverable | SlotState::Committed => return ApduStatus::Broken,
            }
        }
    }

    /// Mark every visible fragment of a broken APDU unrecoverable so the
    /// release pass skips them as one gap.
    fn condemn_apdu(&mut self, start: Sqn, frag: crate::skb::FragmentInfo) {
        let mut s = start;
        while s.serial_lte(self.lead) {
            let Some(slot) = self.slot_mut(s) else { break };
            let same_apdu = match (&slot.state, &slot.skb) {
                (SlotState::HaveData, Some(skb)) => {
                    skb.fragment.map_or(false, |f| f.first_sqn == frag.first_sqn)
                }
                _ => false,
            };
            if s == start || same_apdu {
                slot.state = SlotState::Unrecoverable;
                slot.deadline = Timestamp::ZERO;
                slot.skb = None;
            } else {
                break;
            }
            s = s.next();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skb::FragmentInfo;

    fn config(capacity: u32) -> RxwConfig {
        RxwConfig {
            capacity,
            nak_bo_ivl: Duration::from_millis(50),
            nak_rpt_ivl: Duration::from_millis(200),
            nak_rdata_ivl: Duration::from_millis(200),
            nak_data_retries: 3,
            nak_ncf_retries: 3,
            send_naks: true,
            fec: None,
        }
    }

    fn rxw(capacity: u32) -> ReceiveWindow {
        ReceiveWindow::new(config(capacity), 1)
    }

    fn data_skb(sqn: u32, payload: &[u8]) -> SockBuf {
        let mut skb = SockBuf::from_slice(payload).unwrap();
        skb.sqn = Some(Sqn(sqn));
        skb
    }

    fn frag_skb(sqn: u32, payload: &[u8], first: u32, offset: u32, total: u32) -> SockBuf {
        let mut skb = data_skb(sqn, payload);
        skb.fragment = Some(FragmentInfo {
            first_sqn: Sqn(first),
            offset,
            apdu_len: total,
        });
        skb
    }

    fn released(events: &[RxwEvent]) -> Vec<Vec<u8>> {
        events
            .iter()
            .filter_map(|e| match e {
                RxwEvent::Data(d) => Some(d.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn in_order_stream_releases_immediately() {
        let mut w = rxw(64);
        let t = Timestamp::from_secs(1);
        let mut all = Vec::new();
        for i in 0..10u32 {
            let events = w.push_data(data_skb(i, &[i as u8]), Sqn(0), t);
            all.extend(released(&events));
        }
        assert_eq!(all, (0..10u8).map(|i| vec![i]).collect::<Vec<_>>());
        let out = w.drive(t + Duration::from_secs(10));
        assert!(out.naks.is_empty(), "no NAKs for a clean stream");
    }

    #[test]
    fn gap_opens_lost_slots_and_schedules_naks() {
        let mut w = rxw(64);
        let t = Timestamp::from_secs(1);
        w.push_data(data_skb(0, b"a"), Sqn(0), t);
        // 1 and 2 missing.
        let events = w.push_data(data_skb(3, b"d"), Sqn(0), t);
        assert!(released(&events).is_empty());
        assert_eq!(w.cumulative_losses, 2);

        // Back-off fires within nak_bo_ivl.
        let out = w.drive(t + Duration::from_millis(51));
        let mut naks = out.naks.clone();
        naks.sort_by_key(|s| s.get());
        assert_eq!(naks, vec![Sqn(1), Sqn(2)]);
    }

    #[test]
    fn repair_completes_the_stream_in_order() {
        let mut w = rxw(64);
        let t = Timestamp::from_secs(1);
        for i in [0u32, 1, 2, 5, 6] {
            w.push_data(data_skb(i, &[i as u8]), Sqn(0), t);
        }
        // NAK, NCF, then repair data.
        let out = w.drive(t + Duration::from_millis(60));
        assert_eq!(out.naks.len(), 2);
        w.on_ncf(Sqn(3), t + Duration::from_millis(70));
        w.on_ncf(Sqn(4), t + Duration::from_millis(70));
        let e1 = w.push_data(data_skb(3, &[3]), Sqn(0), t + Duration::from_millis(90));
        assert_eq!(released(&e1), vec![vec![3u8]]);
        let e2 = w.push_data(data_skb(4, &[4]), Sqn(0), t + Duration::from_millis(95));
        // 4 releases and unblocks 5 and 6.
        assert_eq!(released(&e2), vec![vec![4u8], vec![5u8], vec![6u8]]);
    }

    #[test]
    fn duplicates_are_counted_not_released() {
        let mut w = rxw(64);
        let t = Timestamp::from_secs(1);
        w.push_data(data_skb(0, b"x"), Sqn(0), t);
        let events = w.push_data(data_skb(0, b"x"), Sqn(0), t);
        assert!(released(&events).is_empty());
        assert_eq!(w.duplicates, 1);
    }

    #[test]
    fn apdu_reassembles_across_fragments() {
        let mut w = rxw(64);
        let t = Timestamp::from_secs(1);
        let e0 = w.push_data(frag_skb(0, b"aaaa", 0, 0, 10), Sqn(0), t);
        assert!(released(&e0).is_empty());
        let e1 = w.push_data(frag_skb(1, b"bbbb", 0, 4, 10), Sqn(0), t);
        assert!(released(&e1).is_empty());
        let e2 = w.push_data(frag_skb(2, b"cc", 0, 8, 10), Sqn(0), t);
        assert_eq!(released(&e2), vec![b"aaaabbbbcc".to_vec()]);
    }

    #[test]
    fn apdu_waits_for_missing_middle_fragment() {
        let mut w = rxw(64);
        let t = Timestamp::from_secs(1);
        w.push_data(frag_skb(0, b"aaaa", 0, 0, 8), Sqn(0), t);
        // Fragment 1 lost; fragment at sqn 2 ends the APDU.
        let events = w.push_data(frag_skb(2, b"cc", 0, 6, 8), Sqn(0), t);
        assert!(released(&events).is_empty());
        // Repair arrives.
        let events = w.push_data(frag_skb(1, b"bb", 0, 4, 8), Sqn(0), t);
        assert_eq!(released(&events), vec![b"aaaabbcc".to_vec()]);
    }

    #[test]
    fn retry_exhaustion_skips_the_gap_with_reset() {
        let mut w = rxw(64);
        let mut t = Timestamp::from_secs(1);
        w.push_data(data_skb(0, b"a"), Sqn(0), t);
        w.push_data(data_skb(2, b"c"), Sqn(0), t);

        // Let every retry cycle elapse: NAK -> no NCF -> back-off, three
        // times, then exhaustion.
        let mut resets = 0;
        for _ in 0..32 {
            t = t + Duration::from_millis(260);
            let out = w.drive(t);
            for e in &out.events {
                if let RxwEvent::Reset { lost } = e {
                    resets += 1;
                    assert_eq!(*lost, 1);
                }
            }
        }
        assert_eq!(resets, 1, "one reset for the abandoned gap");
        // Sequence 2 must have been released after the skip.
        assert_eq!(w.commit_lead(), Sqn(3));
    }

    #[test]
    fn spm_trail_past_hole_is_definitive_loss() {
        let mut w = rxw(64);
        let t = Timestamp::from_secs(1);
        w.push_data(data_skb(0, b"a"), Sqn(0), t);
        w.push_data(data_skb(3, b"d"), Sqn(0), t);

        // Sender advertises trail beyond the hole: 1 and 2 are gone.
        let events = w.on_spm(Sqn(3), t + Duration::from_millis(10));
        assert!(events.contains(&RxwEvent::Reset { lost: 2 }));
        assert_eq!(w.commit_lead(), Sqn(4));
    }

    #[test]
    fn ncf_moves_backoff_to_wait_data() {
        let mut w = rxw(64);
        let t = Timestamp::from_secs(1);
        w.push_data(data_skb(0, b"a"), Sqn(0), t);
        w.push_data(data_skb(2, b"c"), Sqn(0), t);

        // NCF arrives before our own back-off fires: NAK suppressed.
        w.on_ncf(Sqn(1), t + Duration::from_millis(1));
        let out = w.drive(t + Duration::from_millis(60));
        assert!(out.naks.is_empty(), "NCF suppresses the pending NAK");
    }

    #[test]
    fn window_overrun_surfaces_reset() {
        let mut w = rxw(8);
        let t = Timestamp::from_secs(1);
        w.push_data(data_skb(0, b"a"), Sqn(0), t);
        w.push_data(data_skb(2, b"c"), Sqn(0), t);
        // Push the lead far enough that the un-repaired hole at 1 is
        // forced out of the window.
        let mut saw_reset = false;
        for i in 3..20u32 {
            let events = w.push_data(data_skb(i, &[i as u8]), Sqn(0), t);
            saw_reset |= events
                .iter()
                .any(|e| matches!(e, RxwEvent::Reset { .. }));
        }
        assert!(saw_reset);
    }

    #[test]
    fn passive_window_never_naks() {
        let mut cfg = config(64);
        cfg.send_naks = false;
        let mut w = ReceiveWindow::new(cfg, 7);
        let t = Timestamp::from_secs(1);
        w.push_data(data_skb(0, b"a"), Sqn(0), t);
        w.push_data(data_skb(5, b"f"), Sqn(0), t);
        let out = w.drive(t + Duration::from_secs(60));
        assert!(out.naks.is_empty());
    }

    mod fec {
        use super::*;
        use crate::parity::build_symbol;
        use pgm_fec::RsCodec;

        fn fec_config() -> RxwConfig {
            let mut cfg = config(64);
            cfg.fec = Some(FecConfig {
                n: 6,
                k: 4,
                proactive_h: 0,
                ondemand: true,
                varpkt_len: true,
            });
            cfg
        }

        /// Sender-side parity for a group of payloads.
        fn make_parity(payloads: &[Vec<u8>], j: u8) -> Vec<u8> {
            let codec = RsCodec::new(6, 4).unwrap();
            let max = payloads.iter().map(|p| p.len()).max().unwrap();
            let symbol_len = max + SYMBOL_TAIL;
            let symbols: Vec<Vec<u8>> = payloads
                .iter()
                .map(|p| build_symbol(p, None, symbol_len))
                .collect();
            let refs: Vec<&[u8]> = symbols.iter().map(|v| v.as_slice()).collect();
            let mut parity = vec![0u8; symbol_len];
            codec.encode(&refs, &mut parity, j).unwrap();
            parity
        }

        #[test]
        fn parity_reconstructs_missing_data() {
            let mut w = ReceiveWindow::new(fec_config(), 3);
            let t = Timestamp::from_secs(1);
            let payloads: Vec<Vec<u8>> =
                (0..4u8).map(|i| vec![i.wrapping_mul(31); 40]).collect();

            // Data 0, 1, 3 arrive; 2 is lost.
            for &i in &[0u32, 1, 3] {
                w.push_data(data_skb(i, &payloads[i as usize]), Sqn(0), t);
            }
            // One parity block closes the erasure.
            let events =
                w.push_parity(Sqn(0), 0, make_parity(&payloads, 0), Sqn(0), t);
            let out = released(&events);
            assert_eq!(out, vec![payloads[2].clone(), payloads[3].clone()]);
            assert_eq!(w.fec_recoveries, 1);
        }

        #[test]
        fn parity_alone_is_not_enough_below_k() {
            let mut w = ReceiveWindow::new(fec_config(), 3);
            let t = Timestamp::from_secs(1);
            let payloads: Vec<Vec<u8>> = (0..4u8).map(|i| vec![i; 32]).collect();

            // Two data and one parity: 3 of 4, still short.
            w.push_data(data_skb(0, &payloads[0]), Sqn(0), t);
            w.push_data(data_skb(1, &payloads[1]), Sqn(0), t);
            let events =
                w.push_parity(Sqn(0), 0, make_parity(&payloads, 0), Sqn(0), t);
            assert!(released(&events).is_empty());
            assert_eq!(w.fec_recoveries, 0);

            // The second parity block tips it over.
            let events =
                w.push_parity(Sqn(0), 1, make_parity(&payloads, 1), Sqn(0), t);
            assert_eq!(
                released(&events),
                vec![payloads[2].clone(), payloads[3].clone()]
            );
            assert_eq!(w.fec_recoveries, 2);
        }

        #[test]
        fn parity_receipt_opens_the_group_tail() {
            let mut w = ReceiveWindow::new(fec_config(), 3);
            let t = Timestamp::from_secs(1);
            let payloads: Vec<Vec<u8>> = (0..4u8).map(|i| vec![i; 16]).collect();

            w.push_data(data_skb(0, &payloads[0]), Sqn(0), t);
            // Parity arrives before data 1..3 was ever observed: the
            // whole group becomes visible as loss.
            w.push_parity(Sqn(0), 0, make_parity(&payloads, 0), Sqn(0), t);
            assert_eq!(w.lead(), Sqn(3));
            assert!(w.cumulative_losses >= 3);
        }
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property 2: the released stream is a prefix-preserving,
            /// strictly in-order subsequence of the sent stream, resets
            /// aside.
            #[test]
            fn release_order_is_strict(
                seed in any::<u64>(),
                drops in proptest::collection::vec(any::<bool>(), 1..60),
            ) {
                let mut w = ReceiveWindow::new(config(128), seed);
                let t = Timestamp::from_secs(1);
                let mut delivered = Vec::new();
                for (i, dropped) in drops.iter().enumerate() {
                    let sqn = i as u32;
                    if *dropped {
                        continue;
                    }
                    let events = w.push_data(
                        data_skb(sqn, &sqn.to_be_bytes()),
                        Sqn(0),
                        t,
                    );
                    for e in events {
                        if let RxwEvent::Data(d) = e {
                            delivered.push(u32::from_be_bytes(d.try_into().unwrap()));
                        }
                    }
                }
                // The window defines itself at the first packet that
                // actually arrived; what came out is the contiguous run
                // from there up to the first gap.
                match drops.iter().position(|&d| !d) {
                    None => prop_assert!(delivered.is_empty()),
                    Some(start) => {
                        let end = (start..drops.len())
                            .find(|&i| drops[i])
                            .unwrap_or(drops.len());
                        prop_assert_eq!(
                            delivered,
                            (start as u32..end as u32).collect::<Vec<_>>()
                        );
                    }
                }
            }
        }
    }
}
