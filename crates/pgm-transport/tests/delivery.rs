/// End-to-end delivery: clean streams, NAK-driven repair, and APDU
/// fragmentation over an in-memory wire.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use pgm_transport::{Timestamp, Transport};

fn pair(seed: u64) -> (Transport, Arc<TestWire>, Transport, Arc<TestWire>) {
    let src_wire = Arc::new(TestWire::default());
    let dst_wire = Arc::new(TestWire::default());
    let source = bound(base_config(1), src_wire.clone(), seed);
    let sink = bound(base_config(2), dst_wire.clone(), seed + 1);
    // Discard both sides' bind-time announcements.
    src_wire.drain();
    dst_wire.drain();
    (source, src_wire, sink, dst_wire)
}

#[test]
fn clean_stream_releases_in_order_without_naks() {
    let (mut source, src_wire, mut sink, dst_wire) = pair(100);
    let events = sink.events();
    let mut now = Timestamp::from_secs(2);

    for i in 0..10u8 {
        source.send(&[i; 3], now).unwrap();
        shuttle(&src_wire, &mut sink, sender_addr(), now, |_, _| false);
        now = now + Duration::from_millis(1);
    }

    let delivered = drain_data(&events);
    assert_eq!(delivered, (0..10u8).map(|i| vec![i; 3]).collect::<Vec<_>>());

    // A clean stream never solicits repair.
    sink.drive(now + Duration::from_secs(5)).unwrap();
    assert!(dst_wire.drain().is_empty());
    assert_eq!(
        sink.stats().naks_sent.load(std::sync::atomic::Ordering::Relaxed),
        0
    );
}

#[test]
fn dropped_packets_are_repaired_through_nak_ncf_rdata() {
    let (mut source, src_wire, mut sink, dst_wire) = pair(200);
    let events = sink.events();
    let t0 = Timestamp::from_secs(2);

    // Ten packets; the wire loses numbers 3 and 4.
    for i in 0..10u8 {
        source.send(&[i], t0).unwrap();
    }
    shuttle(&src_wire, &mut sink, sender_addr(), t0, |i, _| i == 3 || i == 4);

    // Only the prefix before the gap is out.
    assert_eq!(drain_data(&events), (0..3u8).map(|i| vec![i]).collect::<Vec<_>>());

    // Back-off elapses: the receiver NAKs both holes.
    let t1 = t0 + Duration::from_millis(60);
    sink.drive(t1).unwrap();
    let naks = shuttle(&dst_wire, &mut source, receiver_addr(), t1, |_, _| false);
    assert_eq!(naks, 2);
    assert_eq!(
        source.stats().naks_received.load(std::sync::atomic::Ordering::Relaxed),
        2
    );

    // The source answers each NAK with NCF then RDATA; feeding them back
    // completes the stream in order.
    let t2 = t1 + Duration::from_millis(5);
    shuttle(&src_wire, &mut sink, sender_addr(), t2, |_, _| false);
    assert_eq!(
        drain_data(&events),
        (3..10u8).map(|i| vec![i]).collect::<Vec<_>>()
    );
    assert_eq!(
        source.stats().rdata_sent.load(std::sync::atomic::Ordering::Relaxed),
        2
    );
}

#[test]
fn ncf_suppresses_duplicate_naks_until_repair_interval() {
    let (mut source, src_wire, mut sink, dst_wire) = pair(300);
    let t0 = Timestamp::from_secs(2);

    for i in 0..4u8 {
        source.send(&[i], t0).unwrap();
    }
    shuttle(&src_wire, &mut sink, sender_addr(), t0, |i, _| i == 1);

    // First NAK goes out.
    let t1 = t0 + Duration::from_millis(60);
    sink.drive(t1).unwrap();
    assert_eq!(dst_wire.drain().len(), 1);

    // While the confirm is outstanding, further drives stay quiet; the
    // repeat interval has not elapsed.
    sink.drive(t1 + Duration::from_millis(1)).unwrap();
    assert!(
        dst_wire.drain().is_empty(),
        "no duplicate NAK while waiting for the confirm"
    );
}

#[test]
fn fragmented_apdu_reassembles_across_loss() {
    let (mut source, src_wire, mut sink, dst_wire) = pair(400);
    let events = sink.events();
    let t0 = Timestamp::from_secs(2);

    // Roughly three fragments worth of payload.
    let apdu: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
    source.send(&apdu, t0).unwrap();

    // Middle fragment lost.
    shuttle(&src_wire, &mut sink, sender_addr(), t0, |i, _| i == 1);
    assert!(drain_data(&events).is_empty(), "incomplete APDU stays queued");

    // Repair round-trip.
    let t1 = t0 + Duration::from_millis(60);
    sink.drive(t1).unwrap();
    shuttle(&dst_wire, &mut source, receiver_addr(), t1, |_, _| false);
    shuttle(&src_wire, &mut sink, sender_addr(), t1, |_, _| false);

    let delivered = drain_data(&events);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0], apdu, "reassembled APDU is byte-exact");
}

#[test]
fn out_of_order_arrival_is_reordered() {
    let (mut source, src_wire, mut sink, _dst_wire) = pair(500);
    let events = sink.events();
    let t0 = Timestamp::from_secs(2);

    for i in 0..5u8 {
        source.send(&[i], t0).unwrap();
    }
    // The first packet anchors the fresh window; everything after it
    // arrives scrambled.
    let mut packets = src_wire.drain();
    packets.swap(1, 4);
    packets.swap(2, 3);
    for bytes in &packets {
        sink.handle_packet(bytes, sender_addr(), t0).unwrap();
    }

    assert_eq!(
        drain_data(&events),
        (0..5u8).map(|i| vec![i]).collect::<Vec<_>>()
    );
}
