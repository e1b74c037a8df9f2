//! Drives one end-to-end decomposition → write → read → verify pass plus a
//! decomposition-persistence round trip, collecting per-rank stats for
//! [`crate::report`] to reduce.
//!
//! Reference: modeled on the teacher's `run_benchmark` (`ior-bench/src/
//! runner.rs`) — same phase/barrier skeleton (create, write, close, reduce,
//! open, read, close, reduce) — retargeted from a raw transfer loop onto
//! `pario_core`'s decomposition and multi-buffer machinery.
//!
//! This demo only ever touches the backing file from genuine I/O tasks
//! (`iosys.is_io_task`): a compute-only task never opens `test_file` at
//! all. Every task, I/O or compute-only, participates in the real
//! flow-controlled exchange (spec §4.5, §4.8) that moves each task's
//! local share into and out of the owning I/O task's buffer. On the I/O
//! side `write_darray` only queues; `sync_darray` (called right after,
//! before `close`) is what actually runs the swap via
//! `ExchangeContext`, over everything queued since the file was opened
//! (spec §4.9 "the aggregator invokes the rearranger once"); `read_darray`
//! runs it directly since a read has no aggregation step. Compute-only
//! tasks call `compute_to_io`/`io_to_compute` directly since they have no
//! `File` to queue a write against, and must stay collectively in step
//! with whichever I/O-side call triggers the matching swap. The box/subset
//! region math (`compute_box_split` via `decomp.io_blocks`,
//! `gather_and_sort_subset`) runs over the live communicator exactly as
//! before, but its output now determines where each I/O task's regions
//! actually are rather than being discarded.

use mpi::topology::{Color, SimpleCommunicator};
use mpi::traits::*;

use pario_core::decomp::exchange::{compute_to_io, io_to_compute, ExchangeContext};
use pario_core::decomp::map::collective_coverage;
use pario_core::decomp::subset_rearranger::{gather_and_sort_subset, subset_color};
use pario_core::decomp::{build_decomposition, decomp_detect_duplicates, DecompInitArgs};
use pario_core::decomp_io::{read_nc_decomp, write_nc_decomp};
use pario_core::{read_darray, sync_darray, write_darray};
use pario_core::{BackendOptions, BackendType, ElementType, File, FileBackend, FileMode, IOSystem, Rearranger};
use pario_backend_flatfile::FlatFileBackend;

use crate::cli::ScenarioArg;
use crate::report::LocalRunStats;

const DECOMP_ID: i32 = 512;
/// Sentinel written into the hole region left by the `BoxHole` scenario
/// (spec §4.6 "hole region", §8 seed scenario 2 uses -1 for the same
/// purpose).
const FILL_VALUE: f64 = -1.0;

pub struct RunOutcome {
    pub stats: LocalRunStats,
    /// Only meaningful on rank 0, which is the only rank that runs the
    /// persistence round trip.
    pub decomp_persistence_roundtrip_ok: bool,
}

/// This rank's contiguous equal-share flat-offset range `[start, end)`
/// before any scenario-specific hole/duplicate is carved out of it.
fn task_range(total: i64, rank: i32, size: i32) -> (i64, i64) {
    let per_rank = (total + size as i64 - 1) / size as i64;
    let start = rank as i64 * per_rank;
    let end = (start + per_rank).min(total);
    (start, end)
}

/// Build this rank's one-based map (0 = hole) for the requested scenario, a
/// contiguous equal-share slice of the flattened global array by default.
fn build_local_map(scenario: ScenarioArg, total: i64, rank: i32, size: i32) -> Vec<i64> {
    let (start, end) = task_range(total, rank, size);
    let mut map: Vec<i64> = if start < end { (start + 1..=end).collect() } else { Vec::new() };

    match scenario {
        ScenarioArg::Linear => {}
        ScenarioArg::BoxHole => {
            // Last task gives up its final element, leaving one global
            // offset uncovered by any task's map (spec §4.4 "fill
            // detection").
            if rank == size - 1 {
                if let Some(last) = map.last_mut() {
                    *last = 0;
                }
            }
        }
        ScenarioArg::Duplicate => {
            // Rank 1 claims rank 0's last element too, forcing the
            // collective duplicate check to flip the decomposition
            // read-only (spec §4.4, §8 seed scenario 3).
            if size > 1 && rank == 1 && !map.is_empty() {
                let (_, rank0_end) = task_range(total, 0, size);
                map[0] = rank0_end;
            } else if size == 1 && map.len() > 1 {
                map[1] = map[0];
            }
        }
    }
    map
}

/// Gather every rank's (possibly ragged) map to every rank, in rank order.
fn all_gather_maps(comm: &SimpleCommunicator, local_map: &[i64]) -> Vec<Vec<i64>> {
    let local_len = local_map.len() as i32;
    let mut counts = vec![0i32; comm.size() as usize];
    comm.all_gather_into(&local_len, &mut counts);

    let mut displs = vec![0i32; counts.len()];
    let mut running = 0i32;
    for (d, c) in displs.iter_mut().zip(counts.iter()) {
        *d = running;
        running += c;
    }
    let mut flat = vec![0i64; running as usize];
    comm.all_gather_varcount_into(local_map, &mut flat, &counts, &displs);

    counts
        .iter()
        .zip(displs.iter())
        .map(|(&c, &d)| flat[d as usize..(d + c) as usize].to_vec())
        .collect()
}

#[allow(clippy::too_many_arguments)]
pub fn run(
    world: &SimpleCommunicator,
    global_dims: &[i64],
    num_io_tasks: i32,
    rearranger: Rearranger,
    scenario: ScenarioArg,
    blocksize: i64,
    test_file: &str,
    decomp_file: &str,
    keep_files: bool,
    backend_opts: BackendOptions,
) -> Result<RunOutcome, pario_core::PioError> {
    let rank = world.rank();
    let size = world.size();
    let total: i64 = global_dims.iter().product();

    let mut iosys = IOSystem::init_intracomm(world, num_io_tasks, 1, 0, rearranger)?;
    iosys.set_backend_options(backend_opts);

    let local_map = build_local_map(scenario, total, rank, size);
    let all_maps = all_gather_maps(world, &local_map);

    let mut distinct: Vec<i64> = all_maps.iter().flatten().copied().filter(|&v| v > 0).collect();
    distinct.sort_unstable();
    distinct.dedup();
    let global_distinct_count = distinct.len() as i64;

    let read_only = decomp_detect_duplicates(world, &local_map);

    // Pick up this IOSystem's rearranger defaults (spec §4.11); a caller
    // wanting a non-default exchange policy for this one decomposition
    // would call `iosys.set_rearr_opts` first.
    let args = DecompInitArgs {
        elem_type: ElementType::F64,
        global_dims,
        map: &local_map,
        rearranger,
        iostart: None,
        iocount: None,
        num_io_tasks,
        blocksize: if blocksize > 0 { blocksize } else { 4096 },
        rearr_opts: iosys.rearr_opts,
    };
    let mut decomp = build_decomposition(&args, read_only, global_distinct_count);

    if decomp.read_only {
        world.barrier();
        return Ok(RunOutcome {
            stats: LocalRunStats {
                read_only: true,
                needs_fill: decomp.needs_fill,
                ..Default::default()
            },
            decomp_persistence_roundtrip_ok: true,
        });
    }

    let compute_union_rank = rank;
    let exchange_ctx = ExchangeContext {
        union_comm: &iosys.union_comm,
        compute_union_rank,
        io_ranks: &iosys.io_ranks,
        is_io_task: iosys.is_io_task,
    };

    // Only an I/O task's regions describe real file positions; a
    // compute-only task never calls `finalize_regions` at all (it never
    // touches `decomp.regions`/`llen` — `compute_to_io`/`io_to_compute`
    // only consult those on the I/O side).
    let coverage = decomp.needs_fill.then(|| collective_coverage(world, &local_map, total));
    match rearranger {
        Rearranger::Box => {
            if iosys.is_io_task {
                let my_io_idx = iosys
                    .io_ranks
                    .iter()
                    .position(|&r| r == compute_union_rank)
                    .expect("is_io_task implies this rank is in io_ranks");
                let block = decomp.io_blocks[my_io_idx];
                let covered: Vec<i64> = (block.start..block.start + block.count)
                    .filter(|&o| coverage.as_ref().map_or(true, |c| c[o as usize]))
                    .collect();
                decomp.finalize_regions(&covered, Some((block.start, block.start + block.count)), coverage.as_deref());
            }
        }
        Rearranger::Subset => {
            // Every subset member (I/O and compute alike) must call the
            // gather together; the subset's I/O task is always at
            // subset-local rank 0 since `io_ranks = [0, num_io_tasks)`
            // under this demo's fixed stride/base and is therefore the
            // lowest-ranked — hence first-assigned — member of its color.
            let color = Color::with_value(subset_color(compute_union_rank, num_io_tasks.max(1)));
            if let Some(subset_comm) = iosys.union_comm.split_by_color(color) {
                let nonzero: Vec<i64> = local_map.iter().copied().filter(|&v| v > 0).map(|v| v - 1).collect();
                if let Some(sorted) = gather_and_sort_subset(&subset_comm, 0, &nonzero) {
                    decomp.finalize_regions(&sorted, None, None);
                }
            }
        }
    }
    let regions = decomp.regions.clone();

    // Laid out in this task's own (pre-normalization) map order, one
    // element per map slot including holes (value irrelevant there —
    // `compute_to_io`/`io_to_compute` never touch a hole position since
    // `build_send_plan`/the subset filter both skip non-positive map
    // entries). This is the buffer shape the exchange requires: unlike a
    // direct-to-file write, a compute task's local array always has one
    // slot per map entry, not one slot per nonzero entry.
    let local_values: Vec<f64> = local_map
        .iter()
        .map(|&v| if v > 0 { v as f64 + rank as f64 * 1_000_000.0 } else { 0.0 })
        .collect();
    let write_bytes: Vec<u8> = local_values.iter().flat_map(|v| v.to_le_bytes()).collect();
    let fill_bytes = FILL_VALUE.to_le_bytes();
    let elem_size = ElementType::F64.byte_size();

    if compute_union_rank == iosys.io_root {
        let backend: Box<dyn FileBackend> = Box::new(FlatFileBackend::with_options(&iosys.backend_options));
        let mut file = File::create(_iosys_id(), backend, test_file, BackendType::ClassicSerial)?;
        let mut dim_ids = Vec::with_capacity(global_dims.len());
        for (i, &len) in global_dims.iter().enumerate() {
            dim_ids.push(file.define_dim(&format!("d{i}"), Some(len))?);
        }
        file.define_var("data", ElementType::F64, &dim_ids, false)?;
        file.backend.enddef()?;
        file.close()?;
    }
    world.barrier();

    let write_start = std::time::Instant::now();
    if iosys.is_io_task {
        let backend: Box<dyn FileBackend> = Box::new(FlatFileBackend::with_options(&iosys.backend_options));
        let mut file = File::open(_iosys_id(), backend, test_file, FileMode::ReadWrite, BackendType::ClassicSerial)?;
        let var_index = file.attach_var("data", ElementType::F64, false)?;

        let fill = decomp.needs_fill.then_some(&fill_bytes[..]);
        write_darray(&mut file, DECOMP_ID, &decomp, var_index, None, fill, &write_bytes, Some(&exchange_ctx))?;
        sync_darray(&mut file, DECOMP_ID, Some(&exchange_ctx))?;
        file.close()?;
    } else {
        compute_to_io(
            &iosys.union_comm,
            compute_union_rank,
            &iosys.io_ranks,
            false,
            &decomp,
            decomp.rearr_opts.compute_to_io,
            elem_size,
            &write_bytes,
        )?;
    }
    world.barrier();
    let write_seconds = write_start.elapsed().as_secs_f64();

    let read_start = std::time::Instant::now();
    let mut mismatches = 0u64;
    let mut bytes_read;
    if iosys.is_io_task {
        let backend: Box<dyn FileBackend> = Box::new(FlatFileBackend::with_options(&iosys.backend_options));
        let mut file = File::open(_iosys_id(), backend, test_file, FileMode::ReadOnly, BackendType::ClassicSerial)?;
        let var_id = file.attach_var("data", ElementType::F64, false)?;

        let out = read_darray(&mut file, &decomp, var_id, None, ElementType::F64, Some(&exchange_ctx))?;
        bytes_read = out.len() as i64;
        if out != write_bytes {
            for (a, b) in out.chunks_exact(8).zip(write_bytes.chunks_exact(8)) {
                if a != b {
                    mismatches += 1;
                }
            }
        }

        // This I/O task owns any hole carved out of its own assigned
        // block (spec §4.6); confirm the fill value actually landed there.
        for region in &decomp.hole_regions {
            let count_elems: i64 = region.count.iter().product();
            let mut out = vec![0u8; count_elems as usize * ElementType::F64.byte_size()];
            let req = pario_core::VaraRequest {
                start: region.start.clone(),
                count: region.count.clone(),
                stride: None,
            };
            file.backend.get_vara(var_id, &req, &mut out)?;
            bytes_read += out.len() as i64;
            for chunk in out.chunks_exact(8) {
                if chunk != fill_bytes {
                    mismatches += 1;
                }
            }
        }

        file.close()?;
    } else {
        let out = io_to_compute(
            &iosys.union_comm,
            compute_union_rank,
            &iosys.io_ranks,
            false,
            &decomp,
            decomp.rearr_opts.io_to_compute,
            elem_size,
            &[],
        )?;
        bytes_read = out.len() as i64;
        if out != write_bytes {
            for (a, b) in out.chunks_exact(8).zip(write_bytes.chunks_exact(8)) {
                if a != b {
                    mismatches += 1;
                }
            }
        }
    }
    let read_seconds = read_start.elapsed().as_secs_f64();

    world.barrier();

    let mut decomp_persistence_roundtrip_ok = true;
    if rank == 0 {
        decomp_persistence_roundtrip_ok =
            run_persistence_roundtrip(&decomp, &all_maps, decomp_file, &iosys.backend_options);
    }

    if !keep_files && rank == 0 {
        std::fs::remove_file(test_file).ok();
        std::fs::remove_file(decomp_file).ok();
    }
    world.barrier();

    Ok(RunOutcome {
        stats: LocalRunStats {
            write_seconds,
            read_seconds,
            bytes_written: write_bytes.len() as i64,
            bytes_read,
            mismatches,
            read_only: false,
            needs_fill: decomp.needs_fill,
            regions_written: regions.len() as u64,
        },
        decomp_persistence_roundtrip_ok,
    })
}

/// This demo never registers its IOSystem in a [`pario_core::PioContext`]
/// registry (it only ever has one, live for the process's whole run), so a
/// fixed placeholder id is all `File::create`/`File::open` need.
fn _iosys_id() -> i32 {
    0
}

fn run_persistence_roundtrip(
    decomp: &pario_core::decomp::Decomposition,
    task_maps: &[Vec<i64>],
    decomp_file: &str,
    backend_opts: &BackendOptions,
) -> bool {
    let write_result = (|| -> Result<(), pario_core::PioError> {
        let backend: Box<dyn FileBackend> = Box::new(FlatFileBackend::with_options(backend_opts));
        let mut file = File::create(_iosys_id(), backend, decomp_file, BackendType::ClassicSerial)?;
        write_nc_decomp(&mut file, decomp, task_maps, "pario-demo", "generated by pario-demo", "synthetic")?;
        file.close()
    })();
    if write_result.is_err() {
        return false;
    }

    let read_result = (|| -> Result<bool, pario_core::PioError> {
        let backend: Box<dyn FileBackend> = Box::new(FlatFileBackend::with_options(backend_opts));
        let mut file = File::open(_iosys_id(), backend, decomp_file, FileMode::ReadOnly, BackendType::ClassicSerial)?;
        let contents = read_nc_decomp(&mut file)?;
        file.close()?;
        Ok(contents.global_dims == decomp.global_dims && contents.maps == task_maps)
    })();

    matches!(read_result, Ok(true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_scenario_splits_contiguously_without_overlap() {
        let maps: Vec<Vec<i64>> = (0..4).map(|r| build_local_map(ScenarioArg::Linear, 16, r, 4)).collect();
        let mut all: Vec<i64> = maps.into_iter().flatten().collect();
        all.sort_unstable();
        assert_eq!(all, (1..=16).collect::<Vec<_>>());
    }

    #[test]
    fn box_hole_scenario_leaves_one_offset_uncovered() {
        let maps: Vec<Vec<i64>> = (0..4).map(|r| build_local_map(ScenarioArg::BoxHole, 16, r, 4)).collect();
        let nonzero: Vec<i64> = maps.into_iter().flatten().filter(|&v| v > 0).collect();
        assert_eq!(nonzero.len(), 15);
    }

    #[test]
    fn duplicate_scenario_has_two_tasks_claim_the_same_offset() {
        let map0 = build_local_map(ScenarioArg::Duplicate, 16, 0, 4);
        let map1 = build_local_map(ScenarioArg::Duplicate, 16, 1, 4);
        assert!(map1.contains(map0.last().unwrap()));
    }
}
