//! Range math: partition `[0, total_size)` into contiguous segments.

use crate::store::records::{Segment, SegmentState};

/// Smallest amount of work worth a dedicated connection.
pub const SEGMENT_GRANULE: u64 = 256 * 1024;

/// Builds the initial segment plan for a download.
///
/// Unknown size or a server without range support yields a single open-ended
/// segment. Otherwise the file is split into
/// `min(max_segments, max(1, ceil(total / 256 KiB)))` contiguous ranges; all
/// but the last are `total / n` bytes and the last carries the remainder, so
/// the union is exactly `[0, total)`.
pub fn plan_segments(total_size: Option<u64>, resumable: bool, max_segments: u32) -> Vec<Segment> {
    let max_segments = max_segments.max(1) as u64;

    let total = match total_size {
        Some(t) if resumable => t,
        _ => {
            return vec![Segment {
                id: 0,
                offset: 0,
                length: None,
                downloaded: 0,
                state: SegmentState::NotStarted,
            }];
        }
    };

    let n = max_segments.min(total.div_ceil(SEGMENT_GRANULE).max(1));
    let base = total / n;

    let mut out = Vec::with_capacity(n as usize);
    let mut offset = 0u64;
    for i in 0..n {
        let len = if i == n - 1 { total - offset } else { base };
        out.push(Segment {
            id: i as u32,
            offset,
            length: Some(len),
            downloaded: 0,
            state: SegmentState::NotStarted,
        });
        offset += len;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_partition(segments: &[Segment], total: u64) {
        let mut offset = 0u64;
        for s in segments {
            assert_eq!(s.offset, offset, "segments must be contiguous");
            offset += s.length.expect("known-size plan has lengths");
        }
        assert_eq!(offset, total, "union must equal [0, total)");
    }

    #[test]
    fn one_megabyte_four_segments() {
        let segs = plan_segments(Some(1_000_000), true, 4);
        assert_eq!(segs.len(), 4);
        for s in &segs {
            assert_eq!(s.length, Some(250_000));
        }
        assert_partition(&segs, 1_000_000);
    }

    #[test]
    fn last_segment_carries_remainder() {
        let segs = plan_segments(Some(10_000_000), true, 3);
        assert_eq!(segs.len(), 3);
        assert_eq!(segs[0].length, Some(3_333_333));
        assert_eq!(segs[1].length, Some(3_333_333));
        assert_eq!(segs[2].length, Some(3_333_334));
        assert_partition(&segs, 10_000_000);
    }

    #[test]
    fn small_file_gets_one_segment() {
        let segs = plan_segments(Some(100_000), true, 8);
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].length, Some(100_000));
    }

    #[test]
    fn granule_caps_segment_count() {
        // 600 KiB yields ceil(600/256) = 3 even with a higher max.
        let segs = plan_segments(Some(600 * 1024), true, 32);
        assert_eq!(segs.len(), 3);
        assert_partition(&segs, 600 * 1024);
    }

    #[test]
    fn unknown_size_single_open_segment() {
        let segs = plan_segments(None, false, 8);
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].offset, 0);
        assert_eq!(segs[0].length, None);
    }

    #[test]
    fn non_resumable_single_segment_even_with_size() {
        let segs = plan_segments(Some(5_000_000), false, 8);
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].length, None);
    }

    #[test]
    fn zero_total_single_empty_segment() {
        let segs = plan_segments(Some(0), true, 4);
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].length, Some(0));
    }
}
