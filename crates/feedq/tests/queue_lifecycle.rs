// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end queue lifecycle: bulk insertion, duplicate rejection,
//! ordered scans, capacity boundaries, and eviction metrics.

use feedq::product::{Product, ProductClass, ProductInfo, Signature, Timestamp};
use feedq::queue::{CreateFlags, Direction, OpenFlags, ProductQueue, QueueError};
use feedq::Feedtype;

/// A product whose signature is MD5 of its identity string (the content
/// and the identity are decoupled on purpose: the signature is the
/// duplicate key, whatever it was computed over).
fn numbered_product(i: u32, size: usize) -> Product {
    let ident = i.to_string();
    let data = vec![(i % 251) as u8; size];
    let info = ProductInfo {
        arrival: Timestamp::now(),
        signature: Signature::of(ident.as_bytes()),
        origin: "it.example.net".to_string(),
        feedtype: Feedtype::EXP,
        seqno: i,
        ident,
        size: size as u32,
    };
    Product { info, data }
}

#[test]
fn bulk_insert_scan_and_big_product_eviction() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("life.pq");
    let queue = ProductQueue::create(&path, 1_048_576, 1024, 0o600, CreateFlags::default())
        .expect("create 1MiB/1024 queue");

    // Fill: 1000 distinct 100-byte products.
    for i in 0..1000 {
        queue
            .insert_no_signal(&numbered_product(i, 100))
            .expect("insert");
    }
    let stats = queue.stats().expect("stats");
    assert_eq!(stats.products, 1000);
    assert!(stats.bytes_used >= 100_000);

    // Re-inserting product 0 is a duplicate and changes nothing.
    assert!(matches!(
        queue.insert_no_signal(&numbered_product(0, 100)),
        Err(QueueError::Dup)
    ));
    assert_eq!(queue.stats().expect("stats").products, 1000);

    // A reader scans all 1000 in non-decreasing insertion order.
    let reader = ProductQueue::open(&path, OpenFlags::READONLY).expect("open reader");
    reader.set_cursor(Timestamp::ZERO);
    let class = ProductClass::everything();
    let mut seen = 0u32;
    let mut last = Timestamp::ZERO;
    loop {
        match reader.sequence(Direction::Gt, &class, |_, _| ()) {
            Ok(Some(())) => {
                let (t, _) = reader.get_cursor();
                assert!(t >= last, "insertion-time order");
                last = t;
                seen += 1;
            }
            Ok(None) => panic!("everything-class must match every product"),
            Err(QueueError::End) => break,
            Err(e) => panic!("sequence failed: {e}"),
        }
    }
    assert_eq!(seen, 1000);

    // A 1,000,000-byte product displaces older products to fit.
    queue
        .insert_no_signal(&numbered_product(1_000_000, 1_000_000))
        .expect("big insert");
    let stats = queue.stats().expect("stats");
    assert!(stats.max_bytes_used >= 1_000_000);
    let mvrt = stats.mvrt.expect("eviction sets the MVRT block");
    assert!(mvrt.bytes > 0);
    assert!(mvrt.slots > 0);

    // The big product reads back bit-identical.
    let big_sig = Signature::of(1_000_000u32.to_string().as_bytes());
    queue
        .process_by_signature(&big_sig, |info, data| {
            assert_eq!(info.size, 1_000_000);
            assert_eq!(data.len(), 1_000_000);
            assert!(data.iter().all(|&b| b == (1_000_000 % 251) as u8));
        })
        .expect("big product readable");
}

#[test]
fn capacity_boundaries() {
    let dir = tempfile::tempdir().expect("tempdir");
    let queue = ProductQueue::create(
        dir.path().join("cap.pq"),
        65_536,
        64,
        0o600,
        CreateFlags::default(),
    )
    .expect("create");

    // Exactly data-capacity reserves on an empty queue.
    let sig = Signature::of(b"exactly-full");
    let res = queue.reserve(65_536, &sig).expect("reserve full capacity");
    queue.discard(res).expect("discard");

    // One byte more is TooBig regardless of queue state.
    assert!(matches!(
        queue.reserve(65_537, &Signature::of(b"too-big")),
        Err(QueueError::TooBig { .. })
    ));
    for i in 0..10 {
        queue
            .insert_no_signal(&numbered_product(i, 100))
            .expect("insert");
    }
    assert!(matches!(
        queue.reserve(65_537, &Signature::of(b"still-too-big")),
        Err(QueueError::TooBig { .. })
    ));
}

#[test]
fn reserve_discard_and_delete_restore_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    let queue = ProductQueue::create(
        dir.path().join("restore.pq"),
        65_536,
        64,
        0o600,
        CreateFlags::default(),
    )
    .expect("create");

    for i in 0..5 {
        queue
            .insert_no_signal(&numbered_product(i, 64))
            .expect("insert");
    }
    let baseline = queue.stats().expect("stats");

    // reserve + discard is a no-op on observable state.
    let res = queue
        .reserve(512, &Signature::of(b"ephemeral"))
        .expect("reserve");
    queue.discard(res).expect("discard");
    let after = queue.stats().expect("stats");
    assert_eq!(baseline.products, after.products);
    assert_eq!(baseline.bytes_used, after.bytes_used);
    assert_eq!(baseline.empty_slots, after.empty_slots);
    assert_eq!(baseline.free_regions, after.free_regions);

    // insert + delete-by-signature restores the pre-insert state.
    let p = numbered_product(77, 64);
    queue.insert_no_signal(&p).expect("insert");
    queue
        .delete_by_signature(&p.info.signature)
        .expect("delete");
    let after = queue.stats().expect("stats");
    assert_eq!(baseline.products, after.products);
    assert_eq!(baseline.bytes_used, after.bytes_used);
    assert_eq!(baseline.empty_slots, after.empty_slots);
}

#[test]
fn mvrt_clear_and_reset_cycle() {
    let dir = tempfile::tempdir().expect("tempdir");
    let queue = ProductQueue::create(
        dir.path().join("mvrt.pq"),
        4096,
        16,
        0o600,
        CreateFlags::default(),
    )
    .expect("create");

    // Fill until the next insertion evicts.
    for i in 0..4 {
        queue
            .insert_no_signal(&numbered_product(i, 800))
            .expect("insert");
    }
    queue
        .insert_no_signal(&numbered_product(100, 800))
        .expect("evicting insert");
    let stats = queue.stats().expect("stats");
    let mvrt = stats.mvrt.expect("set after eviction");
    assert!(mvrt.bytes > 0, "companion byte counter recorded");
    assert_eq!(mvrt.slots, 4, "slots in use at eviction time");

    queue.clear_min_vrt().expect("clear");
    assert!(queue.stats().expect("stats").mvrt.is_none(), "unset after clear");

    // The next eviction sets it again.
    queue
        .insert_no_signal(&numbered_product(101, 800))
        .expect("evicting insert");
    assert!(queue.stats().expect("stats").mvrt.is_some());
}

#[test]
fn locked_oldest_blocks_eviction_entirely() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("locked.pq");
    let queue = ProductQueue::create(&path, 4096, 16, 0o600, CreateFlags::default())
        .expect("create");

    for i in 0..4 {
        queue
            .insert_no_signal(&numbered_product(i, 800))
            .expect("insert");
    }

    // A reader holds the oldest region via sequence_lock.
    let reader = ProductQueue::open(&path, OpenFlags::READONLY).expect("open reader");
    reader.set_cursor(Timestamp::ZERO);
    let (ident, offset) = reader
        .sequence_lock(Direction::Gt, &ProductClass::everything(), |info, _| {
            info.ident.clone()
        })
        .expect("sequence_lock")
        .expect("matched");
    assert_eq!(ident, "0", "the oldest product");

    // Insertion needing eviction fails; nothing younger is sacrificed.
    assert!(matches!(
        queue.insert_no_signal(&numbered_product(50, 800)),
        Err(QueueError::NoRoom)
    ));
    assert_eq!(queue.stats().expect("stats").products, 4);

    reader.release(offset);
    queue
        .insert_no_signal(&numbered_product(50, 800))
        .expect("insert after release");
    // Now the oldest is gone and the rest survive.
    assert!(matches!(
        queue.process_by_signature(&Signature::of(b"0"), |_, _| ()),
        Err(QueueError::NotFound)
    ));
    for i in 1..4 {
        queue
            .process_by_signature(&Signature::of(i.to_string().as_bytes()), |_, _| ())
            .expect("younger products preserved");
    }
}
