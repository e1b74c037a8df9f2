use clap::{Parser, ValueEnum};
use pario_core::Rearranger;

/// MPI-parallel exerciser for the distributed-array write/read path.
///
/// Reference: modeled on the teacher's own CLI surface (`ior-bench`'s
/// `CliArgs`), trimmed and retargeted at decomposition-driven I/O instead of
/// a raw-transfer benchmark.
#[derive(Parser, Debug)]
#[command(name = "pario-demo", about = "Decomposition-driven parallel I/O exerciser")]
pub struct CliArgs {
    /// Global array shape, comma-separated (e.g. "4,4")
    #[arg(short = 'd', long = "global-dims", default_value = "16")]
    pub global_dims: String,

    /// Number of I/O tasks to carve out of the compute communicator
    #[arg(short = 'n', long = "num-io-tasks", default_value_t = 2)]
    pub num_io_tasks: i32,

    /// Rearranger to exercise
    #[arg(short = 'r', long = "rearranger", value_enum, default_value_t = RearrangerArg::Box)]
    pub rearranger: RearrangerArg,

    /// Which map pattern to generate
    #[arg(short = 's', long = "scenario", value_enum, default_value_t = ScenarioArg::Linear)]
    pub scenario: ScenarioArg,

    /// Target block size in elements for the box rearranger
    #[arg(short = 'b', long = "blocksize", default_value_t = 0)]
    pub blocksize: i64,

    /// Path to the shared data file
    #[arg(short = 'o', long = "test-file", default_value = "pario_demo_data.bin")]
    pub test_file: String,

    /// Path to the decomposition sidecar file (persistence round trip)
    #[arg(long = "decomp-file", default_value = "pario_demo_decomp.bin")]
    pub decomp_file: String,

    /// Keep output files after the run
    #[arg(short = 'k', long = "keep-files")]
    pub keep_files: bool,

    /// Output a JSON report to stdout
    #[arg(long = "json")]
    pub json: bool,

    /// Output a JSON report to this file
    #[arg(long = "json-file")]
    pub json_file: Option<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RearrangerArg {
    Box,
    Subset,
}

impl From<RearrangerArg> for Rearranger {
    fn from(r: RearrangerArg) -> Self {
        match r {
            RearrangerArg::Box => Rearranger::Box,
            RearrangerArg::Subset => Rearranger::Subset,
        }
    }
}

/// Which of the spec's seed test scenarios to generate a map for.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScenarioArg {
    /// Each task owns a contiguous equal-size slice (1-D linear decomposition).
    Linear,
    /// A 2-D decomposition that deliberately leaves one global element
    /// uncovered by any task's map, forcing fill detection.
    BoxHole,
    /// Two tasks claim the same global offset, forcing a read-only
    /// decomposition.
    Duplicate,
}

/// Parse a comma-separated list of dimension sizes.
pub fn parse_dims(s: &str) -> Vec<i64> {
    s.split(',')
        .map(|part| part.trim().parse::<i64>().unwrap_or_else(|_| panic!("invalid dimension size: {part}")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_dim() {
        assert_eq!(parse_dims("16"), vec![16]);
    }

    #[test]
    fn parses_multi_dim() {
        assert_eq!(parse_dims("4, 4"), vec![4, 4]);
    }
}
