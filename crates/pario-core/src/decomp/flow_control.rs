//! Flow-controlled exchange ("swapm"): a structured MPI swap that honors
//! handshaking, send mode, and a max-in-flight budget per direction.
//!
//! Reference: spec §4.8, §8 "Flow control". Grounded on the same
//! post/wait/replenish discipline the teacher's `ThreadPool` uses for its
//! pending/completed queues in `ior-backend-posix/src/lib.rs` — here the
//! outstanding units are MPI requests instead of worker-thread jobs, and
//! the budget bounds MPI requests in flight rather than threads.

use mpi::request::{scope, LocalScope};
use mpi::topology::{Communicator, SimpleCommunicator};
use mpi::traits::*;

use crate::rearranger::FlowControlOptions;

/// One side of a swap: a peer rank and the byte buffer to send to or
/// receive from it. Used identically by the box rearranger's compute→io
/// pass and the subset rearranger's compute→io gather.
pub struct SwapPeer<'a> {
    pub rank: i32,
    pub buf: &'a mut [u8],
}

/// Execute a budgeted, optionally-handshaked exchange: `sends` go out to
/// their respective peers, `recvs` come in from theirs, honoring
/// `opts.max_pending` outstanding requests at a time in each direction
/// (spec §4.8). Ordering within one sender-receiver pair is preserved by
/// MPI's own per-pair FIFO guarantee; no cross-pair ordering is implied or
/// needed.
pub fn swapm(comm: &SimpleCommunicator, opts: FlowControlOptions, sends: Vec<SwapPeer<'_>>, recvs: Vec<SwapPeer<'_>>) {
    if opts.handshake {
        for peer in &recvs {
            let ready: [u8; 0] = [];
            comm.process_at_rank(peer.rank).send(&ready[..]);
        }
        for _peer in &sends {
            let mut ready = [0u8; 0];
            comm.process_at_rank(_peer.rank).receive_into(&mut ready);
        }
    }

    if !opts.isend {
        blocking_swap(comm, sends, recvs);
        return;
    }

    let budget = opts.max_pending.map(|m| m as usize).unwrap_or(usize::MAX);
    scope(|s| nonblocking_swap(comm, s, budget, sends, recvs));
}

/// Blocking send-mode path. A rank that both sends and receives within
/// one `swapm` (an I/O task in intracomm mode, where I/O ⊆ compute) must
/// not post every blocking `send` before reaching its own receives: once a
/// message exceeds the eager limit, `send` won't return until its peer
/// drains it, and every such rank would be stuck in `send` before any of
/// them gets to `receive_into`. Post the receives as non-blocking requests
/// first, then issue the blocking sends, then wait on the receives — the
/// sends can always make progress into an already-posted receive no
/// matter how the ranks are interleaved.
fn blocking_swap<'a>(comm: &'a SimpleCommunicator, sends: Vec<SwapPeer<'a>>, recvs: Vec<SwapPeer<'a>>) {
    scope(|s| {
        let recv_reqs: Vec<_> = recvs
            .into_iter()
            .map(|peer| comm.process_at_rank(peer.rank).immediate_receive_into(s, peer.buf))
            .collect();
        for peer in &sends {
            comm.process_at_rank(peer.rank).send(peer.buf);
        }
        for req in recv_reqs {
            req.wait();
        }
    });
}

/// Non-blocking path: post up to `budget` receives, then up to `budget`
/// sends, then wait on the oldest outstanding request of either kind and
/// replenish, until every count is satisfied (spec §4.8 "Loop discipline").
fn nonblocking_swap<'a>(
    comm: &'a SimpleCommunicator,
    s: &LocalScope<'a>,
    budget: usize,
    sends: Vec<SwapPeer<'a>>,
    recvs: Vec<SwapPeer<'a>>,
) {
    let mut recv_iter = recvs.into_iter();
    let mut send_iter = sends.into_iter();

    let mut recv_reqs = Vec::new();
    let mut send_reqs = Vec::new();

    loop {
        while recv_reqs.len() < budget {
            let Some(peer) = recv_iter.next() else { break };
            let req = comm.process_at_rank(peer.rank).immediate_receive_into(s, peer.buf);
            recv_reqs.push(req);
        }
        while send_reqs.len() < budget {
            let Some(peer) = send_iter.next() else { break };
            let req = comm.process_at_rank(peer.rank).immediate_send(s, peer.buf);
            send_reqs.push(req);
        }

        if recv_reqs.is_empty() && send_reqs.is_empty() {
            break;
        }

        if !recv_reqs.is_empty() {
            let req = recv_reqs.remove(0);
            req.wait();
        } else if !send_reqs.is_empty() {
            let req = send_reqs.remove(0);
            req.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_is_finite_when_max_pending_set() {
        let opts = FlowControlOptions {
            handshake: false,
            isend: true,
            max_pending: Some(4),
        };
        assert_eq!(opts.max_pending, Some(4));
    }

    #[test]
    fn unlimited_budget_is_none() {
        let opts = FlowControlOptions::default();
        assert_eq!(opts.max_pending, None);
    }
}
