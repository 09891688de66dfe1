/// Per-source receiver state and the table that owns it.
///
/// A peer is created on the first packet from an unknown TSI and destroyed
/// when its expiry elapses with no traffic. The table is the sole owner of
/// peer state; everything else addresses peers by TSI. Iteration follows
/// insertion order so test runs are reproducible.

use std::collections::HashMap;
use std::net::IpAddr;

use crate::rxw::ReceiveWindow;
use crate::sn::Sqn;
use crate::timer::Timestamp;
use crate::tsi::Tsi;

pub struct Peer {
    pub tsi: Tsi,
    pub rxw: ReceiveWindow,
    /// Unicast address repair requests go to.
    pub source_nla: IpAddr,
    /// Multicast group the source transmits on.
    pub group_nla: IpAddr,
    /// Highest SPM sequence seen; older SPMs are discarded.
    pub spm_sqn: Option<Sqn>,
    pub last_packet: Timestamp,
    pub expiry: Timestamp,
}

impl Peer {
    /// Note activity and push the expiry deadline out.
    pub fn touch(&mut self, now: Timestamp, expiry_ivl: std::time::Duration) {
        self.last_packet = now;
        self.expiry = now + expiry_ivl;
    }

    /// SPM sequence numbers only move forward; returns false for a replay.
    pub fn accept_spm(&mut self, spm_sqn: Sqn) -> bool {
        match self.spm_sqn {
            Some(seen) if !seen.serial_lt(spm_sqn) => false,
            _ => {
                self.spm_sqn = Some(spm_sqn);
                true
            }
        }
    }
}

#[derive(Default)]
pub struct PeerTable {
    peers: HashMap<Tsi, Peer>,
    /// Insertion order, for deterministic iteration.
    order: Vec<Tsi>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, tsi: &Tsi) -> Option<&Peer> {
        self.peers.get(tsi)
    }

    pub fn get_mut(&mut self, tsi: &Tsi) -> Option<&mut Peer> {
        self.peers.get_mut(tsi)
    }

    pub fn contains(&self, tsi: &Tsi) -> bool {
        self.peers.contains_key(tsi)
    }

    /// Insert a freshly created peer. Replaces any stale entry under the
    /// same TSI.
    pub fn insert(&mut self, peer: Peer) {
        let tsi = peer.tsi;
        if self.peers.insert(tsi, peer).is_none() {
            self.order.push(tsi);
        }
    }

    pub fn remove(&mut self, tsi: &Tsi) -> Option<Peer> {
        let removed = self.peers.remove(tsi);
        if removed.is_some() {
            self.order.retain(|t| t != tsi);
        }
        removed
    }

    /// Peers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.order.iter().filter_map(|tsi| self.peers.get(tsi))
    }

    /// TSIs in insertion order, for callers that need to mutate peers
    /// one at a time.
    pub fn tsis(&self) -> Vec<Tsi> {
        self.order.clone()
    }

    /// Remove every peer whose expiry has passed, returning their TSIs.
    pub fn expire(&mut self, now: Timestamp) -> Vec<Tsi> {
        let expired: Vec<Tsi> = self
            .iter()
            .filter(|p| p.expiry <= now)
            .map(|p| p.tsi)
            .collect();
        for tsi in &expired {
            self.peers.remove(tsi);
        }
        self.order.retain(|t| self.peers.contains_key(t));
        expired
    }

    /// Earliest deadline across all peers: expiry or pending repair.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.iter()
            .flat_map(|p| {
                std::iter::once(p.expiry).chain(p.rxw.next_deadline())
            })
            .min()
    }
}
