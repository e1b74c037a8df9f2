//! Subset rearranger: each I/O task owns whatever its assigned compute
//! subset collectively holds.
//!
//! Reference: spec §4.6.

use mpi::topology::{Communicator, SimpleCommunicator};
use mpi::traits::*;

/// Deterministic compute-rank → I/O-task-index mapping (spec §4.6: "compute
/// rank `r` → I/O task `r mod num_io_tasks`").
pub fn owning_io_task_for_rank(compute_rank: i32, num_io_tasks: i32) -> i32 {
    compute_rank.rem_euclid(num_io_tasks)
}

/// Build each compute task's subset-group color: every task sharing an
/// I/O-task owner gets the same color, so `comm.split_by_color` produces
/// the per-spec `subset_comm` (spec §4.6: "a `subset_comm` grouping this
/// I/O task with its assigned compute tasks").
pub fn subset_color(compute_rank: i32, num_io_tasks: i32) -> i32 {
    owning_io_task_for_rank(compute_rank, num_io_tasks)
}

/// Each compute task sends its (already map-normalized) non-zero offsets to
/// its subset's I/O task, which concatenates and sorts them (spec §4.6,
/// second bullet). `subset_comm` must already be split so that exactly one
/// member (the I/O task) is distinguished by `is_io_task`.
///
/// Returns `Some(sorted_offsets)` on the I/O task, `None` on compute-only
/// members (they have nothing further to do in this step).
pub fn gather_and_sort_subset(
    subset_comm: &SimpleCommunicator,
    io_task_rank_in_subset: i32,
    local_offsets: &[i64],
) -> Option<Vec<i64>> {
    let rank = subset_comm.rank();
    let root = subset_comm.process_at_rank(io_task_rank_in_subset);

    let local_len = local_offsets.len() as i32;
    let mut counts = vec![0i32; subset_comm.size() as usize];
    root.gather_into_root(&local_len, &mut counts);

    if rank != io_task_rank_in_subset {
        root.gather_varcount_into(local_offsets);
        return None;
    }

    let mut displs = vec![0i32; counts.len()];
    let mut running = 0i32;
    for (d, c) in displs.iter_mut().zip(counts.iter()) {
        *d = running;
        running += c;
    }
    let mut gathered = vec![0i64; running as usize];
    root.gather_varcount_into_root(local_offsets, &mut gathered, &counts, &displs);

    gathered.sort_unstable();
    Some(gathered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_maps_to_io_task_by_modulo() {
        assert_eq!(owning_io_task_for_rank(0, 2), 0);
        assert_eq!(owning_io_task_for_rank(1, 2), 1);
        assert_eq!(owning_io_task_for_rank(2, 2), 0);
        assert_eq!(owning_io_task_for_rank(3, 2), 1);
    }

    #[test]
    fn subset_color_matches_owning_task() {
        for r in 0..8 {
            assert_eq!(subset_color(r, 3), owning_io_task_for_rank(r, 3));
        }
    }
}
