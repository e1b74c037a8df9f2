//! Compute↔I/O data exchange: moves one variable's bytes between a
//! compute task's local buffer (indexed in the caller's original order)
//! and the owning I/O task's linear buffer (indexed by
//! [`super::region::Region::loffset`]), via the flow-controlled swap of
//! [`super::flow_control::swapm`].
//!
//! Reference: spec §4.5 ("Build MPI datatypes... sindex[]... rindex[]"),
//! §4.8 "Flow control", §4.9 ("on flush, the rearranger computes
//! scatter-counts and MPI datatypes; flow-controlled exchange delivers to
//! I/O tasks"). Split the same way [`super::map`] and
//! [`super::box_rearranger`] are: [`plan_exchange`] is pure and
//! unit-testable, `compute_to_io`/`io_to_compute` need a live
//! communicator and are only exercised end to end by `pario-demo`.

use std::collections::HashMap;

use mpi::topology::{Communicator, SimpleCommunicator};
use mpi::traits::*;

use super::box_rearranger::build_send_plan;
use super::flow_control::{swapm, SwapPeer};
use super::region::flatten;
use super::subset_rearranger::owning_io_task_for_rank;
use super::Decomposition;
use crate::error::PioError;
use crate::rearranger::{FlowControlOptions, Rearranger};

/// Every exchanged element is tagged with its zero-based flat global
/// offset (as an `i64`) so the receiving side can place it by position
/// rather than by arrival order (spec §4.5 "rindex").
const TAG_BYTES: usize = 8;

/// What a caller needs to route `write_darray`/`read_darray` through the
/// real exchange instead of treating the local buffer as already being in
/// I/O-task layout. `None` at a call site (this crate's own unit tests,
/// which run single-process with no communicator) means exactly that.
pub struct ExchangeContext<'a> {
    pub union_comm: &'a SimpleCommunicator,
    pub compute_union_rank: i32,
    pub io_ranks: &'a [i32],
    pub is_io_task: bool,
}

/// Per-compute-task routing: which union rank each of this task's local
/// map positions (indices into `decomp.map`) must be sent to. No
/// communicator needed — pure function of the decomposition and this
/// task's own identity, same split as [`map`][super::map] keeps between
/// pure and collective halves.
pub struct ExchangePlan {
    /// Destination union rank -> positions into `decomp.map`/`decomp.remap`,
    /// in ascending rank order.
    pub by_dest: Vec<(i32, Vec<usize>)>,
}

pub fn plan_exchange(decomp: &Decomposition, compute_union_rank: i32, io_ranks: &[i32]) -> ExchangePlan {
    let mut buckets: HashMap<i32, Vec<usize>> = HashMap::new();
    match decomp.rearranger {
        Rearranger::Box => {
            let send_plan = build_send_plan(&decomp.map, &decomp.io_blocks);
            for (task_idx, positions) in send_plan.sindex.into_iter().enumerate() {
                if positions.is_empty() {
                    continue;
                }
                if let Some(&rank) = io_ranks.get(task_idx) {
                    buckets.entry(rank).or_default().extend(positions);
                }
            }
        }
        Rearranger::Subset => {
            let task_idx = owning_io_task_for_rank(compute_union_rank, decomp.num_io_tasks.max(1)) as usize;
            if let Some(&rank) = io_ranks.get(task_idx) {
                let positions: Vec<usize> = decomp
                    .map
                    .iter()
                    .enumerate()
                    .filter(|&(_, &v)| v > 0)
                    .map(|(pos, _)| pos)
                    .collect();
                if !positions.is_empty() {
                    buckets.insert(rank, positions);
                }
            }
        }
    }
    let mut by_dest: Vec<(i32, Vec<usize>)> = buckets.into_iter().collect();
    by_dest.sort_by_key(|&(rank, _)| rank);
    ExchangePlan { by_dest }
}

/// Flat global offset -> position within this task's linear I/O buffer,
/// derived from its already-finalized `regions` (spec §4.5 "rindex[]").
/// `loffset` remains the sole positional authority; this just rebuilds a
/// lookup from it for offsets arriving in whatever order the exchange
/// delivers them.
fn position_lookup(decomp: &Decomposition) -> HashMap<i64, i64> {
    let mut lookup = HashMap::with_capacity(decomp.llen.max(0) as usize);
    for region in &decomp.regions {
        let flat_start = flatten(&region.start, &decomp.global_dims);
        let run_len = *region.count.last().unwrap_or(&0);
        for i in 0..run_len {
            lookup.insert(flat_start + i, region.loffset + i);
        }
    }
    lookup
}

/// Redistribute one variable's compute-side buffer (`local_data`, in the
/// caller's original order; `decomp.remap` undoes the map normalizer's
/// sort to find each element's real position) into this task's I/O-side
/// buffer, ordered to match `decomp.regions`' `loffset` layout (spec
/// §4.5, §4.8, §4.9). Every rank sharing `union_comm` — I/O and
/// compute-only alike — must call this together for one variable before
/// any of them moves on to the next. Compute-only tasks (`is_io_task ==
/// false`) get back an empty `Vec`; there's nothing further for them to
/// do with this variable.
pub fn compute_to_io(
    union_comm: &SimpleCommunicator,
    compute_union_rank: i32,
    io_ranks: &[i32],
    is_io_task: bool,
    decomp: &Decomposition,
    fc_opts: FlowControlOptions,
    elem_size: usize,
    local_data: &[u8],
) -> Result<Vec<u8>, PioError> {
    let plan = plan_exchange(decomp, compute_union_rank, io_ranks);
    let union_size = union_comm.size() as usize;
    let stride = TAG_BYTES + elem_size;

    let mut scount = vec![0i64; union_size];
    for (rank, positions) in &plan.by_dest {
        scount[*rank as usize] = positions.len() as i64;
    }
    let mut rcount = vec![0i64; union_size];
    union_comm.all_to_all_into(&scount, &mut rcount);

    let mut send_bufs: Vec<(i32, Vec<u8>)> = Vec::with_capacity(plan.by_dest.len());
    for (rank, positions) in &plan.by_dest {
        let mut buf = Vec::with_capacity(positions.len() * stride);
        for &pos in positions {
            let user_pos = decomp.remap.as_ref().map(|r| r[pos]).unwrap_or(pos);
            let global_offset = decomp.map[pos] - 1;
            buf.extend_from_slice(&global_offset.to_le_bytes());
            let start = user_pos * elem_size;
            let elem = local_data
                .get(start..start + elem_size)
                .ok_or_else(|| PioError::BadRegion("local buffer shorter than decomposition's map implies".into()))?;
            buf.extend_from_slice(elem);
        }
        send_bufs.push((*rank, buf));
    }

    let mut recv_bufs: Vec<(i32, Vec<u8>)> = (0..union_size)
        .filter(|&r| rcount[r] > 0)
        .map(|r| (r as i32, vec![0u8; rcount[r] as usize * stride]))
        .collect();

    {
        let sends: Vec<SwapPeer<'_>> = send_bufs.iter_mut().map(|(rank, buf)| SwapPeer { rank: *rank, buf: &mut buf[..] }).collect();
        let recvs: Vec<SwapPeer<'_>> = recv_bufs.iter_mut().map(|(rank, buf)| SwapPeer { rank: *rank, buf: &mut buf[..] }).collect();
        swapm(union_comm, fc_opts, sends, recvs);
    }

    if !is_io_task {
        return Ok(Vec::new());
    }

    let lookup = position_lookup(decomp);
    let mut io_buf = vec![0u8; decomp.llen as usize * elem_size];
    for (_src, buf) in &recv_bufs {
        for chunk in buf.chunks_exact(stride) {
            let offset = i64::from_le_bytes(chunk[..TAG_BYTES].try_into().expect("stride includes TAG_BYTES"));
            let Some(&pos) = lookup.get(&offset) else { continue };
            let dst = pos as usize * elem_size;
            io_buf[dst..dst + elem_size].copy_from_slice(&chunk[TAG_BYTES..]);
        }
    }
    Ok(io_buf)
}

/// Reverse of [`compute_to_io`]: scatters this I/O task's buffer back out
/// to the compute tasks that own each element (spec §4.9 `read_darray`).
/// Two rounds over the same [`plan_exchange`] routing: first every
/// compute task tells its owning I/O task which global offsets it wants,
/// then the I/O task answers with the values. An I/O task can't, in
/// general, derive which compute rank "owns" a given offset without being
/// told (the box rearranger's split is per-element, not per-sender), so
/// unlike the write direction this can't collapse to one round.
///
/// Returns a buffer in the caller's original (pre-sort) order, sized for
/// `decomp.map.len()` elements; positions this task has no claim on are
/// left zeroed. `io_data` is unused (and may be empty) on non-I/O tasks.
pub fn io_to_compute(
    union_comm: &SimpleCommunicator,
    compute_union_rank: i32,
    io_ranks: &[i32],
    is_io_task: bool,
    decomp: &Decomposition,
    fc_opts: FlowControlOptions,
    elem_size: usize,
    io_data: &[u8],
) -> Result<Vec<u8>, PioError> {
    let plan = plan_exchange(decomp, compute_union_rank, io_ranks);
    let union_size = union_comm.size() as usize;

    let mut scount = vec![0i64; union_size];
    for (rank, positions) in &plan.by_dest {
        scount[*rank as usize] = positions.len() as i64;
    }
    let mut rcount = vec![0i64; union_size];
    union_comm.all_to_all_into(&scount, &mut rcount);

    // Phase A: compute -> io, "I want these offsets" (tag-only payload).
    let mut want_send_bufs: Vec<(i32, Vec<u8>)> = Vec::with_capacity(plan.by_dest.len());
    for (rank, positions) in &plan.by_dest {
        let mut buf = Vec::with_capacity(positions.len() * TAG_BYTES);
        for &pos in positions {
            let global_offset = decomp.map[pos] - 1;
            buf.extend_from_slice(&global_offset.to_le_bytes());
        }
        want_send_bufs.push((*rank, buf));
    }
    let mut want_recv_bufs: Vec<(i32, Vec<u8>)> = (0..union_size)
        .filter(|&r| rcount[r] > 0)
        .map(|r| (r as i32, vec![0u8; rcount[r] as usize * TAG_BYTES]))
        .collect();
    {
        let sends: Vec<SwapPeer<'_>> = want_send_bufs.iter_mut().map(|(rank, buf)| SwapPeer { rank: *rank, buf: &mut buf[..] }).collect();
        let recvs: Vec<SwapPeer<'_>> = want_recv_bufs.iter_mut().map(|(rank, buf)| SwapPeer { rank: *rank, buf: &mut buf[..] }).collect();
        swapm(union_comm, fc_opts, sends, recvs);
    }

    // Phase B: io -> compute, the requested values. Every compute rank
    // sent exactly `scount[me]` offsets to each destination in phase A,
    // so it's owed that many elements back, in the same order.
    let stride = TAG_BYTES + elem_size;
    let lookup = if is_io_task { position_lookup(decomp) } else { HashMap::new() };

    let mut answer_send_bufs: Vec<(i32, Vec<u8>)> = Vec::new();
    if is_io_task {
        for (src_rank, wanted) in &want_recv_bufs {
            let mut buf = Vec::with_capacity((wanted.len() / TAG_BYTES) * stride);
            for chunk in wanted.chunks_exact(TAG_BYTES) {
                let offset = i64::from_le_bytes(chunk.try_into().expect("TAG_BYTES-sized chunk"));
                buf.extend_from_slice(&offset.to_le_bytes());
                match lookup.get(&offset) {
                    Some(&pos) => {
                        let start = pos as usize * elem_size;
                        buf.extend_from_slice(&io_data[start..start + elem_size]);
                    }
                    None => buf.extend(std::iter::repeat(0u8).take(elem_size)),
                }
            }
            answer_send_bufs.push((*src_rank, buf));
        }
    }
    let mut answer_recv_bufs: Vec<(i32, Vec<u8>)> = plan
        .by_dest
        .iter()
        .map(|(rank, positions)| (*rank, vec![0u8; positions.len() * stride]))
        .collect();
    {
        let sends: Vec<SwapPeer<'_>> = answer_send_bufs.iter_mut().map(|(rank, buf)| SwapPeer { rank: *rank, buf: &mut buf[..] }).collect();
        let recvs: Vec<SwapPeer<'_>> = answer_recv_bufs.iter_mut().map(|(rank, buf)| SwapPeer { rank: *rank, buf: &mut buf[..] }).collect();
        swapm(union_comm, fc_opts, sends, recvs);
    }

    let mut out = vec![0u8; decomp.map.len() * elem_size];
    for ((_rank, positions), (_rank2, buf)) in plan.by_dest.iter().zip(answer_recv_bufs.iter()) {
        for (i, &pos) in positions.iter().enumerate() {
            let chunk = &buf[i * stride..(i + 1) * stride];
            let user_pos = decomp.remap.as_ref().map(|r| r[pos]).unwrap_or(pos);
            let dst = user_pos * elem_size;
            out[dst..dst + elem_size].copy_from_slice(&chunk[TAG_BYTES..]);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decomp::box_rearranger::IoBlock;
    use crate::element_type::ElementType;

    fn box_decomp(map: Vec<i64>, blocks: Vec<IoBlock>) -> Decomposition {
        Decomposition {
            elem_type: ElementType::I32,
            ndims: 1,
            global_dims: vec![16],
            maplen: map.len(),
            map,
            remap: None,
            needs_sort: false,
            read_only: false,
            rearranger: Rearranger::Box,
            num_io_tasks: blocks.len() as i32,
            regions: Vec::new(),
            hole_regions: Vec::new(),
            llen: 0,
            needs_fill: false,
            io_blocks: blocks,
            max_io_buffer_size: 0,
            rearr_opts: Default::default(),
        }
    }

    #[test]
    fn box_plan_routes_by_owning_block() {
        let blocks = vec![IoBlock { start: 0, count: 8 }, IoBlock { start: 8, count: 8 }];
        let decomp = box_decomp(vec![1, 2, 9, 10], blocks);
        let plan = plan_exchange(&decomp, 0, &[100, 200]);
        assert_eq!(plan.by_dest, vec![(100, vec![0, 1]), (200, vec![2, 3])]);
    }

    #[test]
    fn box_plan_skips_holes() {
        let blocks = vec![IoBlock { start: 0, count: 8 }, IoBlock { start: 8, count: 8 }];
        let decomp = box_decomp(vec![1, 0, 9], blocks);
        let plan = plan_exchange(&decomp, 0, &[100, 200]);
        assert_eq!(plan.by_dest, vec![(100, vec![0]), (200, vec![2])]);
    }

    #[test]
    fn subset_plan_routes_every_local_entry_to_one_rank() {
        let mut decomp = box_decomp(vec![1, 2, 3], Vec::new());
        decomp.rearranger = Rearranger::Subset;
        decomp.num_io_tasks = 2;
        // compute_union_rank 3 -> owning_io_task_for_rank(3, 2) == 1
        let plan = plan_exchange(&decomp, 3, &[100, 200]);
        assert_eq!(plan.by_dest, vec![(200, vec![0, 1, 2])]);
    }
}
