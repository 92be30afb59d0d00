// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Crash recovery and writer-counter reconciliation.

use feedq::product::{Product, Signature};
use feedq::queue::{CheckVerdict, CreateFlags, OpenFlags, ProductQueue};
use feedq::Feedtype;

#[test]
fn abandoned_reservation_released_at_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("crash.pq");

    let queue = ProductQueue::create(&path, 65_536, 32, 0o600, CreateFlags::default())
        .expect("create");
    for i in 0..3 {
        let p = Product::new(Feedtype::TEXT, &format!("ok{i}"), "h", 0, vec![b'x'; 100]);
        queue.insert_no_signal(&p).expect("insert");
    }
    let committed_stats = queue.stats().expect("stats");

    // A writer reserves and then "crashes": the reservation and the
    // handle leak without commit, discard, or close.
    let res = queue
        .reserve(1024, &Signature::of(b"in-flight"))
        .expect("reserve");
    std::mem::forget(res);
    std::mem::forget(queue);

    // Reopen: recovery releases the reservation; committed products are
    // untouched; the stale writer count is visible and repairable.
    let queue = ProductQueue::open(&path, OpenFlags::default()).expect("reopen");
    let stats = queue.stats().expect("stats");
    assert_eq!(stats.products, committed_stats.products);
    assert_eq!(stats.bytes_used, committed_stats.bytes_used);

    let report = queue.verify(1).expect("verify");
    assert_eq!(
        report.verdict,
        CheckVerdict::WriterCountNonZero,
        "the crashed writer is still counted"
    );
    assert_eq!(report.reserved, 0, "no reservation survives recovery");

    let before = queue.force_reset_writers().expect("reset");
    assert_eq!(before, 2, "crashed writer plus this handle");
    let report = queue.verify(1).expect("verify");
    assert_eq!(report.verdict, CheckVerdict::Clean);

    // The in-flight signature is insertable after recovery.
    let p = Product::new(Feedtype::TEXT, "redo", "h", 0, b"second try".to_vec());
    let mut redo = p.clone();
    redo.info.signature = Signature::of(b"in-flight");
    redo.info.size = redo.data.len() as u32;
    queue.insert_no_signal(&redo).expect("insert after recovery");
}

#[test]
fn clean_close_balances_writer_count() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("clean.pq");

    ProductQueue::create(&path, 4096, 8, 0o600, CreateFlags::default())
        .expect("create")
        .close()
        .expect("close");

    {
        let a = ProductQueue::open(&path, OpenFlags::default()).expect("open a");
        let b = ProductQueue::open(&path, OpenFlags::default()).expect("open b");
        assert_eq!(a.writer_count().expect("count"), 2);
        drop(b);
        assert_eq!(a.writer_count().expect("count"), 1);
    }

    let reader = ProductQueue::open(&path, OpenFlags::READONLY).expect("reader");
    assert_eq!(reader.writer_count().expect("count"), 0);
    assert_eq!(
        reader.verify(0).expect("verify").verdict,
        CheckVerdict::Clean
    );
}

#[test]
fn products_survive_reopen_byte_identical() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("persist.pq");

    let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
    let p = Product::new(Feedtype::GRID, "PERSIST", "h", 7, payload.clone());
    {
        let queue = ProductQueue::create(&path, 65_536, 16, 0o600, CreateFlags::default())
            .expect("create");
        queue.insert_no_signal(&p).expect("insert");
        queue.close().expect("close");
    }

    let queue = ProductQueue::open(&path, OpenFlags::READONLY).expect("reopen");
    queue
        .process_by_signature(&p.info.signature, |info, data| {
            assert_eq!(info, &p.info);
            assert_eq!(data, &payload[..]);
        })
        .expect("read back");
}
