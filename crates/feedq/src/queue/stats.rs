// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Queue statistics snapshot.

use super::layout::OLDEST_NONE_SEC;
use super::{ProductQueue, Result};
use crate::product::Timestamp;
use std::fmt;

/// Minimum-virtual-residence-time block: the shortest time any evicted
/// product spent in the queue, with the usage counters at that moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MvrtStats {
    /// The minimum residence time in microseconds.
    pub usecs: u64,
    /// `bytes_used` when the minimum was recorded.
    pub bytes: u64,
    /// Slots in use when the minimum was recorded.
    pub slots: u64,
}

/// Point-in-time statistics, taken under the shared header lock.
#[derive(Debug, Clone, Copy)]
pub struct QueueStats {
    /// Live products.
    pub products: u64,
    /// Entries on the free-region table.
    pub free_regions: u64,
    /// Slots not in use.
    pub empty_slots: u64,
    /// Bytes of data area in live or reserved regions.
    pub bytes_used: u64,
    /// Most products ever live at once.
    pub max_products: u64,
    /// Most free-table entries ever.
    pub max_free_regions: u64,
    /// Fewest empty slots ever.
    pub min_empty_slots: u64,
    /// Most bytes ever in use.
    pub max_bytes_used: u64,
    /// Age of the oldest live product in seconds; None when empty.
    pub age_oldest_secs: Option<u64>,
    /// Largest single allocatable extent.
    pub largest_free_extent: u64,
    /// Minimum virtual residence time; None when unset.
    pub mvrt: Option<MvrtStats>,
}

impl fmt::Display for QueueStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "products:            {}", self.products)?;
        writeln!(f, "bytes used:          {}", self.bytes_used)?;
        writeln!(f, "free regions:        {}", self.free_regions)?;
        writeln!(f, "empty slots:         {}", self.empty_slots)?;
        writeln!(f, "max products:        {}", self.max_products)?;
        writeln!(f, "max bytes used:      {}", self.max_bytes_used)?;
        writeln!(f, "max free regions:    {}", self.max_free_regions)?;
        writeln!(f, "min empty slots:     {}", self.min_empty_slots)?;
        writeln!(f, "largest free extent: {}", self.largest_free_extent)?;
        match self.age_oldest_secs {
            Some(age) => writeln!(f, "oldest product age:  {age}s")?,
            None => writeln!(f, "oldest product age:  (empty)")?,
        }
        match self.mvrt {
            Some(m) => write!(
                f,
                "min residence:       {}us at {} bytes / {} slots",
                m.usecs, m.bytes, m.slots
            ),
            None => write!(f, "min residence:       (unset)"),
        }
    }
}

impl ProductQueue {
    /// Take a consistent statistics snapshot.
    pub fn stats(&self) -> Result<QueueStats> {
        self.ensure_readable()?;
        let _guard = self.lock_header(false)?;
        let view = self.view();
        let h = view.header();

        let age_oldest_secs = if h.oldest_sec == OLDEST_NONE_SEC {
            None
        } else {
            let oldest = Timestamp {
                sec: h.oldest_sec,
                usec: h.oldest_usec,
            };
            Some(oldest.age_secs(Timestamp::now()))
        };

        Ok(QueueStats {
            products: h.products,
            free_regions: h.free_count,
            empty_slots: h.slot_capacity - h.slots_used,
            bytes_used: h.bytes_used,
            max_products: h.max_products,
            max_free_regions: h.max_free_regions,
            min_empty_slots: h.min_empty_slots,
            max_bytes_used: h.max_bytes_used,
            age_oldest_secs,
            largest_free_extent: view.free_largest(),
            mvrt: (h.mvrt_set != 0).then(|| MvrtStats {
                usecs: h.mvrt_usecs,
                bytes: h.mvrt_bytes,
                slots: h.mvrt_slots,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::product::{Feedtype, Product};
    use crate::queue::{CreateFlags, ProductQueue};

    #[test]
    fn test_stats_track_inserts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let q = ProductQueue::create(
            dir.path().join("stats.pq"),
            1 << 16,
            32,
            0o600,
            CreateFlags::default(),
        )
        .expect("create");

        let st = q.stats().expect("stats");
        assert_eq!(st.products, 0);
        assert_eq!(st.bytes_used, 0);
        assert_eq!(st.empty_slots, 32);
        assert_eq!(st.free_regions, 1);
        assert_eq!(st.largest_free_extent, 1 << 16);
        assert!(st.age_oldest_secs.is_none());
        assert!(st.mvrt.is_none());

        for i in 0..3 {
            let p = Product::new(Feedtype::TEXT, &format!("s{i}"), "h", 0, vec![b'x'; 100]);
            q.insert_no_signal(&p).expect("insert");
        }
        let st = q.stats().expect("stats");
        assert_eq!(st.products, 3);
        assert_eq!(st.empty_slots, 29);
        assert!(st.bytes_used >= 300);
        assert_eq!(st.max_products, 3);
        assert_eq!(st.min_empty_slots, 29);
        assert_eq!(st.age_oldest_secs, Some(0));
    }

    #[test]
    fn test_clear_min_vrt_resets_block() {
        let dir = tempfile::tempdir().expect("tempdir");
        let q = ProductQueue::create(
            dir.path().join("mvrt.pq"),
            2048,
            8,
            0o600,
            CreateFlags::default(),
        )
        .expect("create");

        // Force an eviction to set the block.
        for i in 0..4 {
            let p = Product::new(Feedtype::TEXT, &format!("m{i}"), "h", 0, vec![b'x'; 800]);
            q.insert_no_signal(&p).expect("insert");
        }
        assert!(q.stats().expect("stats").mvrt.is_some());

        q.clear_min_vrt().expect("clear");
        assert!(q.stats().expect("stats").mvrt.is_none());
    }
}
