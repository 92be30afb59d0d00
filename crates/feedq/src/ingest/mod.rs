// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ingest: the named-FIFO feed of locally arriving files.

mod pipe;

pub use pipe::{ensure_fifo, read_records, IngestRecord, FILENAME_LEN, RECORD_SIZE};

use crate::product::{Feedtype, Product};
use crate::queue::{ProductQueue, QueueError};
use std::path::Path;

/// Turn one ingest record into a product and insert it.
///
/// The record's filename is resolved under `spool_dir`; the file's bytes
/// become the product data and the filename its identity. Duplicates are
/// counted, not errors.
pub fn insert_record(
    queue: &ProductQueue,
    spool_dir: &Path,
    feedtype: Feedtype,
    record: &IngestRecord,
) -> Result<bool, QueueError> {
    let path = spool_dir.join(&record.filename);
    let data = std::fs::read(&path).map_err(|e| {
        log::warn!("ingest: cannot read {}: {e}", path.display());
        QueueError::Sys(e)
    })?;
    let product = Product::new(
        feedtype,
        &record.filename,
        &hostname(),
        record.orig_seq as u32,
        data,
    );
    match queue.insert(&product) {
        Ok(info) => {
            log::debug!("ingested {} ({} bytes)", info.ident, info.size);
            Ok(true)
        }
        Err(QueueError::Dup) => {
            log::debug!("ingest: duplicate {}", record.filename);
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::CreateFlags;

    #[test]
    fn test_insert_record_reads_spool_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spool = dir.path().join("spool");
        std::fs::create_dir_all(&spool).expect("spool");
        std::fs::write(spool.join("obs.txt"), b"surface obs").expect("data file");

        let queue = ProductQueue::create(
            dir.path().join("ing.pq"),
            1 << 16,
            16,
            0o600,
            CreateFlags::default(),
        )
        .expect("create");

        let record = IngestRecord {
            pipe_insert_time: 0,
            ncf_rcv_time: 0,
            prod_type: 1,
            category: 1,
            code: 1,
            flags: 0,
            orig_seq: 5,
            orig_rcv_time: 0,
            run_id: 0,
            orig_run_id: 0,
            filename: "obs.txt".to_string(),
        };
        assert!(insert_record(&queue, &spool, Feedtype::SURFACE, &record).expect("insert"));
        // Same file again is a duplicate.
        assert!(!insert_record(&queue, &spool, Feedtype::SURFACE, &record).expect("dup"));
        assert_eq!(queue.stats().expect("stats").products, 1);
    }

    #[test]
    fn test_insert_record_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue = ProductQueue::create(
            dir.path().join("ing.pq"),
            1 << 16,
            16,
            0o600,
            CreateFlags::default(),
        )
        .expect("create");
        let record = IngestRecord {
            pipe_insert_time: 0,
            ncf_rcv_time: 0,
            prod_type: 1,
            category: 1,
            code: 1,
            flags: 0,
            orig_seq: 0,
            orig_rcv_time: 0,
            run_id: 0,
            orig_run_id: 0,
            filename: "nope.txt".to_string(),
        };
        assert!(matches!(
            insert_record(&queue, dir.path(), Feedtype::TEXT, &record),
            Err(QueueError::Sys(_))
        ));
    }
}
