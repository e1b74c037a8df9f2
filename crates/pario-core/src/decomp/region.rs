//! Region coalescer: flat offsets → minimal `{start, count}` hyperslabs.
//!
//! Reference: spec §4.7, §8 "Coalescing minimality".

/// One contiguous hyperslab plus its position in the task's packed I/O
/// buffer (spec §3 "Region").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub start: Vec<i64>,
    pub count: Vec<i64>,
    /// Offset (in elements) of this region's first element within the
    /// task's linear I/O buffer.
    pub loffset: i64,
}

/// Convert a row-major flat offset to `{start[ndims]}` coordinates in
/// `global_dims`.
fn unflatten(mut offset: i64, global_dims: &[i64]) -> Vec<i64> {
    let ndims = global_dims.len();
    let mut start = vec![0i64; ndims];
    for d in (0..ndims).rev() {
        let dim = global_dims[d];
        start[d] = offset % dim;
        offset /= dim;
    }
    start
}

/// Inverse of [`unflatten`]: row-major `{start[ndims]}` coordinates back to
/// a flat offset in `global_dims` space. Used by the compute↔I/O exchange
/// (spec §4.5, §4.8) to recover the flat offset a region's `start`
/// corresponds to, so arriving elements can be placed by offset rather than
/// by arrival order.
pub fn flatten(start: &[i64], global_dims: &[i64]) -> i64 {
    let mut offset = 0i64;
    for (&s, &dim) in start.iter().zip(global_dims.iter()) {
        offset = offset * dim + s;
    }
    offset
}

/// Walk an ordered list of flat offsets and emit the minimum-cardinality
/// list of hyperslabs whose union is exactly that offset set (spec §4.7).
/// `offsets` must already be sorted ascending; the caller (subset
/// rearranger, or the map normalizer's sorted output) is responsible for
/// that precondition.
pub fn coalesce_regions(offsets: &[i64], global_dims: &[i64]) -> Vec<Region> {
    if offsets.is_empty() {
        return Vec::new();
    }
    let ndims = global_dims.len();
    let last_dim = global_dims[ndims - 1];

    let mut regions = Vec::new();
    let mut run_start_offset = offsets[0];
    let mut run_len: i64 = 1;
    let mut loffset = 0i64;
    let mut run_loffset = 0i64;

    let flush = |regions: &mut Vec<Region>, run_start_offset: i64, run_len: i64, run_loffset: i64| {
        let mut start = unflatten(run_start_offset, global_dims);
        let mut count = vec![1i64; ndims];
        count[ndims - 1] = run_len;
        if ndims == 0 {
            start = Vec::new();
            count = Vec::new();
        }
        regions.push(Region {
            start,
            count,
            loffset: run_loffset,
        });
    };

    for &off in &offsets[1..] {
        loffset += 1;
        let extends = off == run_start_offset + run_len
            && (run_start_offset + run_len) % last_dim != 0
            && run_len < last_dim;
        if extends {
            run_len += 1;
        } else {
            flush(&mut regions, run_start_offset, run_len, run_loffset);
            run_start_offset = off;
            run_len = 1;
            run_loffset = loffset;
        }
    }
    flush(&mut regions, run_start_offset, run_len, run_loffset);
    regions
}

/// `maxregions`: an upper bound on region count that every I/O task can
/// agree on for allocation purposes, before the actual per-task reduction
/// is performed by the caller (spec §4.7).
pub fn maxregions_upper_bound(llen: i64, ndims: usize) -> i64 {
    if ndims == 0 {
        return 1;
    }
    llen.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_run_becomes_one_region() {
        let offsets: Vec<i64> = (0..16).collect();
        let regions = coalesce_regions(&offsets, &[16]);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].start, vec![0]);
        assert_eq!(regions[0].count, vec![16]);
    }

    #[test]
    fn gap_splits_into_two_regions() {
        let offsets = vec![0, 1, 2, 5, 6, 7];
        let regions = coalesce_regions(&offsets, &[8]);
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].start, vec![0]);
        assert_eq!(regions[0].count, vec![3]);
        assert_eq!(regions[1].start, vec![5]);
        assert_eq!(regions[1].count, vec![3]);
    }

    #[test]
    fn row_boundary_splits_2d_regions() {
        // global_dims = [4,4]; offsets 0..8 are flat-contiguous but cross a
        // row boundary at offset 4, where the slower-varying coordinate
        // changes — the coalescer must not merge across it.
        let offsets: Vec<i64> = (0..8).collect();
        let regions = coalesce_regions(&offsets, &[4, 4]);
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].start, vec![0, 0]);
        assert_eq!(regions[0].count, vec![1, 4]);
        assert_eq!(regions[1].start, vec![1, 0]);
        assert_eq!(regions[1].count, vec![1, 4]);
    }

    #[test]
    fn any_permutation_that_sorts_contiguous_yields_one_region() {
        let mut offsets = vec![7, 3, 4, 6, 5];
        offsets.sort_unstable();
        let regions = coalesce_regions(&offsets, &[16]);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].count[0], 5);
    }

    #[test]
    fn empty_input_yields_no_regions() {
        assert!(coalesce_regions(&[], &[16]).is_empty());
    }
}
