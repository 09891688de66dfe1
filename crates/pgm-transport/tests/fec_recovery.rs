/// Proactive parity end to end: a transmission group survives heavy loss
/// without a single repair round-trip.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use pgm_transport::{FecConfig, Timestamp, WindowSize};
use rand::seq::SliceRandom;
use rand::SeedableRng;

const K: u8 = 128;
const N: u8 = 160;
const PROACTIVE_H: u8 = 32;

fn fec_config(gsi_byte: u8) -> pgm_transport::TransportConfig {
    let mut cfg = base_config(gsi_byte);
    cfg.txw = WindowSize::Sqns(1024);
    cfg.rxw = WindowSize::Sqns(1024);
    cfg.fec = Some(FecConfig {
        n: N,
        k: K,
        proactive_h: PROACTIVE_H,
        ondemand: false,
        varpkt_len: true,
    });
    cfg
}

#[test]
fn group_recovers_thirty_random_losses_from_proactive_parity() {
    let src_wire = Arc::new(TestWire::default());
    let dst_wire = Arc::new(TestWire::default());
    let mut source = bound(fec_config(1), src_wire.clone(), 9);
    let mut sink = bound(fec_config(2), dst_wire.clone(), 10);
    let events = sink.events();
    src_wire.drain();
    dst_wire.drain();

    let t0 = Timestamp::from_secs(2);
    let payloads: Vec<Vec<u8>> = (0..u32::from(K))
        .map(|i| (0..500u32).map(|j| ((i * 7 + j) % 256) as u8).collect())
        .collect();
    for p in &payloads {
        source.send(p, t0).unwrap();
    }

    // One full group on the wire: k data packets plus the proactive
    // parity burst.
    let packets = src_wire.drain();
    assert_eq!(packets.len(), usize::from(K) + usize::from(PROACTIVE_H));

    // Lose 30 random packets of the group; 130 survivors >= k. The very
    // first packet stays: it anchors the fresh receive window.
    let mut rng = rand::rngs::StdRng::seed_from_u64(0xFEC);
    let mut order: Vec<usize> = (1..packets.len()).collect();
    order.shuffle(&mut rng);
    let lost: std::collections::HashSet<usize> = order.into_iter().take(30).collect();

    for (i, bytes) in packets.iter().enumerate() {
        if lost.contains(&i) {
            continue;
        }
        sink.handle_packet(bytes, sender_addr(), t0).unwrap();
    }

    let delivered = drain_data(&events);
    assert_eq!(delivered, payloads, "released bytes equal sent bytes");

    // Erasure decoding did the repair; nothing was solicited.
    sink.drive(t0 + Duration::from_secs(1)).unwrap();
    assert_eq!(
        sink.stats().naks_sent.load(std::sync::atomic::Ordering::Relaxed),
        0,
        "parity closed every hole before a NAK was due"
    );
}

#[test]
fn losses_beyond_parity_fall_back_to_naks() {
    let src_wire = Arc::new(TestWire::default());
    let dst_wire = Arc::new(TestWire::default());
    let mut source = bound(fec_config(1), src_wire.clone(), 11);
    let mut sink = bound(fec_config(2), dst_wire.clone(), 12);
    let events = sink.events();
    src_wire.drain();
    dst_wire.drain();

    let t0 = Timestamp::from_secs(2);
    let payloads: Vec<Vec<u8>> = (0..u32::from(K))
        .map(|i| vec![(i % 256) as u8; 200])
        .collect();
    for p in &payloads {
        source.send(p, t0).unwrap();
    }

    // Lose 40 data packets and every parity packet: erasure decoding
    // cannot close the gap, NAK repair must.
    let packets = src_wire.drain();
    for (i, bytes) in packets.iter().enumerate() {
        if (10..50).contains(&i) || i >= usize::from(K) {
            continue;
        }
        sink.handle_packet(bytes, sender_addr(), t0).unwrap();
    }
    let mut delivered = drain_data(&events);
    assert_eq!(delivered.len(), 10, "only the prefix before the gap is out");

    let t1 = t0 + Duration::from_millis(60);
    sink.drive(t1).unwrap();
    let nak_count = shuttle(&dst_wire, &mut source, receiver_addr(), t1, |_, _| false);
    assert_eq!(nak_count, 40);

    // Selective RDATA closes the gap and the rest follows in order.
    shuttle(&src_wire, &mut sink, sender_addr(), t1, |_, _| false);
    delivered.extend(drain_data(&events));
    assert_eq!(delivered, payloads);
}
