//! Shared harness: two transports joined by in-memory wires, driven by a
//! manual microsecond clock. No sockets, no sleeps.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use crossbeam_channel::Receiver;
use parking_lot::Mutex;

use pgm_transport::{
    DatagramSink, Gsi, NetError, Timestamp, Transport, TransportConfig, TransportEvent,
    WindowSize,
};

/// Captures everything a transport puts on the wire.
#[derive(Default)]
pub struct TestWire {
    sent: Mutex<Vec<Vec<u8>>>,
}

impl TestWire {
    pub fn drain(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.sent.lock())
    }
}

impl DatagramSink for TestWire {
    fn send(
        &self,
        buf: &[u8],
        _dst: SocketAddr,
        _router_alert: bool,
    ) -> Result<usize, NetError> {
        self.sent.lock().push(buf.to_vec());
        Ok(buf.len())
    }
}

pub fn group_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(239, 192, 0, 1)), 7500)
}

pub fn sender_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 9001)
}

pub fn receiver_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 9002)
}

pub fn base_config(gsi_byte: u8) -> TransportConfig {
    let mut cfg = TransportConfig::new(Gsi::from_bytes([gsi_byte; 6]), group_addr());
    cfg.sport = Some(9000 + u16::from(gsi_byte));
    cfg.txw = WindowSize::Sqns(512);
    cfg.rxw = WindowSize::Sqns(512);
    cfg
}

pub fn bound(cfg: TransportConfig, wire: Arc<TestWire>, seed: u64) -> Transport {
    let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, cfg.gsi.as_bytes()[0]));
    let mut t = Transport::with_seed(cfg, wire, seed).expect("valid config");
    t.bind(ip, Timestamp::from_secs(1)).expect("bind");
    t
}

/// Deliver every queued packet from `wire` into `to`, dropping those for
/// which `drop` answers true. Returns how many packets were delivered.
pub fn shuttle(
    wire: &TestWire,
    to: &mut Transport,
    from: SocketAddr,
    now: Timestamp,
    mut drop: impl FnMut(usize, &[u8]) -> bool,
) -> usize {
    let mut delivered = 0;
    for (i, bytes) in wire.drain().into_iter().enumerate() {
        if drop(i, &bytes) {
            continue;
        }
        to.handle_packet(&bytes, from, now).expect("dispatch");
        delivered += 1;
    }
    delivered
}

/// Every APDU currently pending on the event channel.
pub fn drain_data(rx: &Receiver<TransportEvent>) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let TransportEvent::Data { data, .. } = event {
            out.push(data);
        }
    }
    out
}

/// Every event currently pending on the channel.
pub fn drain_events(rx: &Receiver<TransportEvent>) -> Vec<TransportEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}
