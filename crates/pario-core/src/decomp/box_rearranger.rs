//! Box rearranger: every I/O task owns one contiguous hyperslab.
//!
//! Reference: spec §4.5. Split into a pure block-split calculator (fully
//! unit-testable) and the comm-plan construction that needs a live
//! communicator, mirroring the split in [`super::map`].

use crate::element_type::ElementType;

/// One I/O task's contiguous block of the flattened global array, in
/// element units (spec §4.5: "assign every I/O task one contiguous
/// hyperslab of the global array").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoBlock {
    pub start: i64,
    pub count: i64,
}

/// Block-cyclic split of `total_elements` into `num_io_tasks` contiguous
/// blocks targeted at `blocksize`, or the user-supplied `iostart`/`iocount`
/// verbatim when given (spec §4.5). Ties at a block boundary go to the
/// lower-index I/O task — guaranteed here because blocks are assigned in
/// index order with no overlap.
///
/// Returns one [`IoBlock`] per `num_io_tasks`, in I/O-task-index order;
/// tasks past `num_aiotasks` (see [`BoxSplit::num_aiotasks`]) get a
/// zero-count block.
pub struct BoxSplit {
    pub blocks: Vec<IoBlock>,
    /// Number of I/O tasks that actually received a non-empty block; can
    /// be smaller than `num_io_tasks` when the array is small relative to
    /// `num_io_tasks * blocksize` (spec §4.5).
    pub num_aiotasks: i32,
}

pub fn compute_box_split(
    total_elements: i64,
    num_io_tasks: i32,
    blocksize: i64,
    iostart: Option<&[i64]>,
    iocount: Option<&[i64]>,
) -> BoxSplit {
    if let (Some(starts), Some(counts)) = (iostart, iocount) {
        let blocks = starts
            .iter()
            .zip(counts.iter())
            .map(|(&s, &c)| IoBlock { start: s, count: c })
            .collect();
        // Spec §9 open question (b): num_aiotasks equals num_io_tasks
        // unconditionally when iostart/iocount are user-supplied, even
        // though one could argue for counting only non-empty blocks.
        return BoxSplit {
            blocks,
            num_aiotasks: num_io_tasks,
        };
    }

    let target_block = blocksize.max(1);
    let mut remaining = total_elements;
    let mut cursor = 0i64;
    let mut blocks = Vec::with_capacity(num_io_tasks as usize);
    let mut num_aiotasks = 0i32;

    // Distribute in as-equal-as-possible contiguous blocks across exactly
    // num_io_tasks slots, capped by target_block per slot; leftover beyond
    // num_io_tasks*target_block piles onto the last non-empty task.
    let even_share = if num_io_tasks > 0 {
        (total_elements + num_io_tasks as i64 - 1) / num_io_tasks as i64
    } else {
        0
    };
    let per_task = even_share.min(target_block).max(1);

    for i in 0..num_io_tasks {
        let this_count = if remaining <= 0 {
            0
        } else if i == num_io_tasks - 1 {
            remaining
        } else {
            per_task.min(remaining)
        };
        if this_count > 0 {
            num_aiotasks += 1;
        }
        blocks.push(IoBlock {
            start: cursor,
            count: this_count,
        });
        cursor += this_count;
        remaining -= this_count;
    }

    BoxSplit { blocks, num_aiotasks }
}

/// `max_io_buffer_size` as computed on the I/O root: the largest per-task
/// byte count across all blocks (spec §4.5).
pub fn max_io_buffer_size(blocks: &[IoBlock], elem: ElementType) -> i64 {
    blocks
        .iter()
        .map(|b| b.count * elem.byte_size() as i64)
        .max()
        .unwrap_or(0)
}

/// Which I/O task owns a given flat global offset, given the per-task
/// blocks from [`compute_box_split`]. Offsets past the split coverage (can
/// happen only if blocks don't cover everything) return `None`.
pub fn owning_io_task(offset: i64, blocks: &[IoBlock]) -> Option<usize> {
    blocks
        .iter()
        .position(|b| offset >= b.start && offset < b.start + b.count)
}

/// Per-compute-task send-side plan: for each local map entry, how many
/// elements go to each I/O task, and at which user-buffer positions (spec
/// §4.5: `scount[]`, `sindex[]`).
pub struct SendPlan {
    pub scount: Vec<i64>,
    pub sindex: Vec<Vec<usize>>,
}

/// Walk this compute task's map and bucket each non-hole entry by owning
/// I/O task (spec §4.5, third bullet).
pub fn build_send_plan(map: &[i64], blocks: &[IoBlock]) -> SendPlan {
    let mut scount = vec![0i64; blocks.len()];
    let mut sindex: Vec<Vec<usize>> = vec![Vec::new(); blocks.len()];
    for (pos, &v) in map.iter().enumerate() {
        if v <= 0 {
            continue;
        }
        // map entries are one-based global offsets (spec GLOSSARY "Map").
        if let Some(task) = owning_io_task(v - 1, blocks) {
            scount[task] += 1;
            sindex[task].push(pos);
        }
    }
    SendPlan { scount, sindex }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn even_split_across_tasks() {
        let split = compute_box_split(16, 2, 8, None, None);
        assert_eq!(split.num_aiotasks, 2);
        assert_eq!(split.blocks[0], IoBlock { start: 0, count: 8 });
        assert_eq!(split.blocks[1], IoBlock { start: 8, count: 8 });
    }

    #[test]
    fn small_array_yields_fewer_aiotasks() {
        let split = compute_box_split(3, 4, 8, None, None);
        // total_elements(3) < num_io_tasks(4)*blocksize(8): only as many
        // tasks as needed get a non-empty block.
        assert!(split.num_aiotasks <= 4);
        let total: i64 = split.blocks.iter().map(|b| b.count).sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn user_supplied_iostart_iocount_used_verbatim() {
        let starts = [0, 10];
        let counts = [10, 6];
        let split = compute_box_split(16, 2, 999, Some(&starts), Some(&counts));
        assert_eq!(split.num_aiotasks, 2);
        assert_eq!(split.blocks[0], IoBlock { start: 0, count: 10 });
        assert_eq!(split.blocks[1], IoBlock { start: 10, count: 6 });
    }

    #[test]
    fn boundary_offset_belongs_to_lower_task() {
        let blocks = [IoBlock { start: 0, count: 8 }, IoBlock { start: 8, count: 8 }];
        assert_eq!(owning_io_task(7, &blocks), Some(0));
        assert_eq!(owning_io_task(8, &blocks), Some(1));
    }

    #[test]
    fn send_plan_buckets_by_owning_task() {
        let blocks = [IoBlock { start: 0, count: 4 }, IoBlock { start: 4, count: 4 }];
        let map = vec![1, 2, 5, 0, 6];
        let plan = build_send_plan(&map, &blocks);
        assert_eq!(plan.scount, vec![2, 2]);
        assert_eq!(plan.sindex[0], vec![0, 1]);
        assert_eq!(plan.sindex[1], vec![2, 4]);
    }

    #[test]
    fn max_buffer_size_is_largest_block_in_bytes() {
        let blocks = [IoBlock { start: 0, count: 8 }, IoBlock { start: 8, count: 4 }];
        assert_eq!(max_io_buffer_size(&blocks, ElementType::F64), 64);
    }
}
