//! JSON report document, modeled on the teacher's `json_output.rs`
//! (`IorJsonDocument`) but shaped around a decomposition run instead of a
//! raw-transfer benchmark.

use serde::Serialize;

use crate::report::ReducedRunStats;

#[derive(Serialize)]
pub struct DemoJsonDocument {
    pub version: String,
    pub machine: String,
    pub command_line: String,
    pub global_dims: Vec<i64>,
    pub rearranger: String,
    pub scenario: String,
    pub num_io_tasks: i32,
    pub read_only: bool,
    pub needs_fill: bool,
    pub bytes_written: i64,
    pub bytes_read: i64,
    pub write_bandwidth_mib_s: f64,
    pub read_bandwidth_mib_s: f64,
    pub mismatches: u64,
    pub decomp_persistence_roundtrip_ok: bool,
}

const MEBIBYTE: f64 = 1_048_576.0;

pub fn build_report(
    stats: &ReducedRunStats,
    global_dims: &[i64],
    rearranger: &str,
    scenario: &str,
    num_io_tasks: i32,
    command_line: &str,
    decomp_persistence_roundtrip_ok: bool,
) -> DemoJsonDocument {
    let write_bandwidth_mib_s = if stats.max_write_seconds > 0.0 {
        stats.total_bytes_written as f64 / stats.max_write_seconds / MEBIBYTE
    } else {
        0.0
    };
    let read_bandwidth_mib_s = if stats.max_read_seconds > 0.0 {
        stats.total_bytes_read as f64 / stats.max_read_seconds / MEBIBYTE
    } else {
        0.0
    };

    DemoJsonDocument {
        version: env!("CARGO_PKG_VERSION").to_string(),
        machine: machine_string(),
        command_line: command_line.to_string(),
        global_dims: global_dims.to_vec(),
        rearranger: rearranger.to_string(),
        scenario: scenario.to_string(),
        num_io_tasks,
        read_only: stats.any_read_only,
        needs_fill: stats.any_needs_fill,
        bytes_written: stats.total_bytes_written,
        bytes_read: stats.total_bytes_read,
        write_bandwidth_mib_s,
        read_bandwidth_mib_s,
        mismatches: stats.total_mismatches,
        decomp_persistence_roundtrip_ok,
    }
}

fn machine_string() -> String {
    unsafe {
        let mut uts: libc::utsname = std::mem::zeroed();
        if libc::uname(&mut uts) != 0 {
            return String::new();
        }
        let nodename = std::ffi::CStr::from_ptr(uts.nodename.as_ptr());
        let sysname = std::ffi::CStr::from_ptr(uts.sysname.as_ptr());
        let release = std::ffi::CStr::from_ptr(uts.release.as_ptr());
        format!(
            "{} {} {}",
            nodename.to_string_lossy(),
            sysname.to_string_lossy(),
            release.to_string_lossy(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_report_computes_bandwidth_from_bytes_and_seconds() {
        let stats = ReducedRunStats {
            total_bytes_written: 1_048_576,
            total_bytes_read: 1_048_576,
            max_write_seconds: 1.0,
            max_read_seconds: 2.0,
            total_mismatches: 0,
            any_read_only: false,
            any_needs_fill: false,
        };
        let doc = build_report(&stats, &[16], "box", "linear", 2, "pario-demo", true);
        assert!((doc.write_bandwidth_mib_s - 1.0).abs() < 1e-9);
        assert!((doc.read_bandwidth_mib_s - 0.5).abs() < 1e-9);
        assert!(doc.decomp_persistence_roundtrip_ok);
    }
}
