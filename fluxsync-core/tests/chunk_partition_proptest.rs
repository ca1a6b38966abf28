//! Property tests for chunk planning

use chrono::{DateTime, TimeZone, Utc};
use fluxsync_core::replication::{plan_chunks, CopyOrder};
use proptest::prelude::*;
use std::time::Duration;

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn order() -> impl Strategy<Value = CopyOrder> {
    prop_oneof![Just(CopyOrder::Reverse), Just(CopyOrder::Forward)]
}

proptest! {
    #[test]
    fn prop_chunks_partition_window(
        start in 1_500_000_000i64..1_800_000_000,
        span in 1i64..(90 * 86_400),
        chunk in 1u64..(7 * 86_400),
        order in order(),
    ) {
        let (s, e) = (at(start), at(start + span));
        let mut windows = plan_chunks(s, e, Duration::from_secs(chunk), Duration::ZERO, order).unwrap();

        let expected = (span as u64 + chunk - 1) / chunk;
        prop_assert_eq!(windows.len() as u64, expected);
        for (i, w) in windows.iter().enumerate() {
            prop_assert_eq!(w.index, i + 1);
            prop_assert_eq!(w.total, windows.len());
            prop_assert!(w.start < w.end);
            prop_assert!(w.end - w.start <= chrono::Duration::seconds(chunk as i64));
        }

        if order == CopyOrder::Reverse {
            prop_assert_eq!(windows[0].end, e);
            windows.reverse();
        }
        prop_assert_eq!(windows[0].start, s);
        prop_assert_eq!(windows[windows.len() - 1].end, e);
        for pair in windows.windows(2) {
            prop_assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn prop_chunk_count_capped(
        span in 1i64..(90 * 86_400),
        chunk in 60u64..86_400,
        max in 60u64..(30 * 86_400),
        order in order(),
    ) {
        let e = at(1_700_000_000);
        let s = e - chrono::Duration::seconds(span);
        let windows = plan_chunks(
            s,
            e,
            Duration::from_secs(chunk),
            Duration::from_secs(max),
            order,
        )
        .unwrap();

        let cap = (max + chunk - 1) / chunk;
        prop_assert!(windows.len() as u64 <= cap);
        // the most recent data is always covered
        prop_assert!(windows.iter().any(|w| w.end == e));
        prop_assert!(windows.iter().all(|w| w.start >= s && w.end <= e));
    }
}
