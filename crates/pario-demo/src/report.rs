//! Collective timing/bandwidth reduction and text reporting.
//!
//! Reference: modeled on the teacher's `report.rs` (`reduce_timers`,
//! `print_result`/`print_summary`), retargeted from raw transfer timers at
//! a decomposition-driven write/read pair.

use mpi::collective::SystemOperation;
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;

const MEBIBYTE: f64 = 1_048_576.0;

/// Local measurements from one run, before cross-rank reduction.
#[derive(Debug, Clone, Default)]
pub struct LocalRunStats {
    pub write_seconds: f64,
    pub read_seconds: f64,
    pub bytes_written: i64,
    pub bytes_read: i64,
    pub mismatches: u64,
    pub read_only: bool,
    pub needs_fill: bool,
    pub regions_written: u64,
}

/// Cross-rank reduced view (meaningful only on rank 0): total bytes moved,
/// worst-case elapsed time (since every task must finish before the
/// collective phase boundary completes), and summed mismatch count.
pub struct ReducedRunStats {
    pub total_bytes_written: i64,
    pub total_bytes_read: i64,
    pub max_write_seconds: f64,
    pub max_read_seconds: f64,
    pub total_mismatches: u64,
    pub any_read_only: bool,
    pub any_needs_fill: bool,
}

pub fn reduce_stats(local: &LocalRunStats, comm: &SimpleCommunicator) -> ReducedRunStats {
    let mut total_bytes_written = 0i64;
    comm.all_reduce_into(&local.bytes_written, &mut total_bytes_written, SystemOperation::sum());

    let mut total_bytes_read = 0i64;
    comm.all_reduce_into(&local.bytes_read, &mut total_bytes_read, SystemOperation::sum());

    let mut max_write_seconds = 0.0f64;
    comm.all_reduce_into(&local.write_seconds, &mut max_write_seconds, SystemOperation::max());

    let mut max_read_seconds = 0.0f64;
    comm.all_reduce_into(&local.read_seconds, &mut max_read_seconds, SystemOperation::max());

    let mut total_mismatches = 0u64;
    comm.all_reduce_into(&local.mismatches, &mut total_mismatches, SystemOperation::sum());

    let local_read_only = local.read_only as i32;
    let mut any_read_only = 0i32;
    comm.all_reduce_into(&local_read_only, &mut any_read_only, SystemOperation::max());

    let local_needs_fill = local.needs_fill as i32;
    let mut any_needs_fill = 0i32;
    comm.all_reduce_into(&local_needs_fill, &mut any_needs_fill, SystemOperation::max());

    ReducedRunStats {
        total_bytes_written,
        total_bytes_read,
        max_write_seconds,
        max_read_seconds,
        total_mismatches,
        any_read_only: any_read_only != 0,
        any_needs_fill: any_needs_fill != 0,
    }
}

/// Print a one-line summary (rank 0 only).
pub fn print_report(stats: &ReducedRunStats, comm: &SimpleCommunicator) {
    if comm.rank() != 0 {
        return;
    }
    println!();
    println!("pario-demo run report");
    println!("  read_only decomposition : {}", stats.any_read_only);
    println!("  fill needed             : {}", stats.any_needs_fill);
    if stats.any_read_only {
        println!("  (write phase skipped; duplicate map entries forced read-only)");
        return;
    }
    let write_bw = if stats.max_write_seconds > 0.0 {
        stats.total_bytes_written as f64 / stats.max_write_seconds / MEBIBYTE
    } else {
        0.0
    };
    let read_bw = if stats.max_read_seconds > 0.0 {
        stats.total_bytes_read as f64 / stats.max_read_seconds / MEBIBYTE
    } else {
        0.0
    };
    println!("  bytes written           : {}", stats.total_bytes_written);
    println!("  bytes read              : {}", stats.total_bytes_read);
    println!("  write bandwidth (MiB/s) : {write_bw:.2}");
    println!("  read bandwidth (MiB/s)  : {read_bw:.2}");
    println!("  read-back mismatches    : {}", stats.total_mismatches);
}
