//! Rearranger selection and flow-control option types shared by the box and
//! subset rearrangers and by [`crate::iosystem::IOSystem`].
//!
//! Reference: spec §3 ("chosen rearranger tag", "flow-control options"),
//! §4.8, §6 (`set_rearr_opts`).

use bitflags::bitflags;

bitflags! {
    /// Bitmask form of the comm-shape half of `set_rearr_opts` (spec §6):
    /// which collective style the rearranger uses between the compute and
    /// I/O sides. Kept as a bitmask rather than a bare bool since real
    /// rearranger option sets grow more independent toggles over time
    /// (flow-control direction enables, pending-request limits) than a
    /// struct of named bools scales well to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RearrangerCommFlags: u8 {
        /// Use the `subset_comm`-per-I/O-task exchange (spec §4.6) instead
        /// of point-to-point on the union communicator.
        const COMM_TYPE_SUBSET = 0b0000_0001;
        /// Allow more than one flow-controlled exchange in flight across
        /// both directions at once.
        const UNLIMITED_PENDING_REQUESTS = 0b0000_0010;
    }
}

impl Default for RearrangerCommFlags {
    fn default() -> Self {
        RearrangerCommFlags::empty()
    }
}

/// Which rearranger a decomposition uses. Spec §4.1 only accepts these two
/// as defaults for async init; `decomp_init` may also select per-decomposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rearranger {
    #[default]
    Box,
    Subset,
}

/// Direction-specific knobs for the flow-controlled exchange (spec §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControlOptions {
    /// Receiver posts a zero-byte ready-to-receive before the sender ships
    /// data, to avoid eager-buffering storms.
    pub handshake: bool,
    /// Non-blocking (`Isend`) vs blocking send on this side.
    pub isend: bool,
    /// Cap on outstanding requests in flight; `None` = unlimited.
    pub max_pending: Option<u32>,
}

impl Default for FlowControlOptions {
    fn default() -> Self {
        FlowControlOptions {
            handshake: false,
            isend: true,
            max_pending: None,
        }
    }
}

/// The two directions a rearranger exchange can be configured independently
/// for (spec §6 `set_rearr_opts`: `c2i_opts`, `i2c_opts`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RearrangerOptions {
    pub flags: RearrangerCommFlags,
    pub compute_to_io: FlowControlOptions,
    pub io_to_compute: FlowControlOptions,
}

impl RearrangerOptions {
    pub fn comm_type_subset(&self) -> bool {
        self.flags.contains(RearrangerCommFlags::COMM_TYPE_SUBSET)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_unbounded_and_nonblocking_nonhandshake() {
        let fc = FlowControlOptions::default();
        assert!(!fc.handshake);
        assert!(fc.isend);
        assert_eq!(fc.max_pending, None);
    }

    #[test]
    fn rearranger_defaults_to_box() {
        assert_eq!(Rearranger::default(), Rearranger::Box);
    }

    #[test]
    fn comm_type_subset_flag_is_off_by_default() {
        let opts = RearrangerOptions::default();
        assert!(!opts.comm_type_subset());
    }

    #[test]
    fn comm_type_subset_flag_toggles_independent_of_unlimited_pending() {
        let mut opts = RearrangerOptions::default();
        opts.flags |= RearrangerCommFlags::COMM_TYPE_SUBSET;
        assert!(opts.comm_type_subset());
        assert!(!opts.flags.contains(RearrangerCommFlags::UNLIMITED_PENDING_REQUESTS));
    }
}
