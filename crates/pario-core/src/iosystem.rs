//! IO system descriptor and the process-group machinery that builds it.
//!
//! Reference: spec §3 ("IOSystem") and §4.1 ("Process-group layer"). Builds
//! the compute/I/O/union communicator triple from a user-supplied
//! communicator, the way the teacher's benchmark runner carves a test
//! sub-communicator out of `world` with `Color::with_value`/
//! `split_by_color` (`ior-bench/src/main.rs`) — here the split additionally
//! has to separate an I/O subset out of the compute side.

use log::{debug, info};
use mpi::topology::{Color, Communicator, SimpleCommunicator};

use crate::async_dispatch::{dispatch_one, run_dispatch_loop, AsyncIoState};
use crate::backend_options::BackendOptions;
use crate::decomp::Decomposition;
use crate::error::{ErrorHandler, PioError};
use crate::file::{BackendFactory, File};
use crate::rearranger::{Rearranger, RearrangerOptions};
use crate::registry::{Registry, DECOMP_ID_BASE};

/// Root-rank sentinel recorded on the non-root side of a one-sided send,
/// mirroring `MPI_PROC_NULL`'s role in the reference design (spec §4.1).
pub const PROC_NULL: i32 = -1;
/// Recorded on the side that *is* the root, mirroring `MPI_ROOT`.
pub const PROC_ROOT: i32 = -2;

/// A process group triplet plus metadata (spec §3 "IOSystem").
pub struct IOSystem {
    pub compute_comm: SimpleCommunicator,
    pub io_comm: Option<SimpleCommunicator>,
    pub union_comm: SimpleCommunicator,

    /// Union-coordinate ranks of the compute tasks, ascending.
    pub compute_ranks: Vec<i32>,
    /// Union-coordinate ranks of the I/O tasks, ascending.
    pub io_ranks: Vec<i32>,
    /// Union-coordinate rank of the elected compute root.
    pub comp_root: i32,
    /// Union-coordinate rank of the elected I/O root.
    pub io_root: i32,

    pub is_io_task: bool,
    pub async_mode: bool,
    pub default_rearranger: Rearranger,
    pub error_handler: ErrorHandler,
    pub rearr_opts: RearrangerOptions,
    /// Backend hint bag (spec §3 "a backend hint bag"; §6 "backend may
    /// observe environment for parallel-filesystem hints"). A concrete
    /// `FileBackend` that wants to read these constructs itself from it,
    /// the way `pario-backend-flatfile::FlatFileBackend::with_options`
    /// does, rather than this crate reaching into backend internals.
    pub backend_options: BackendOptions,
}

impl IOSystem {
    /// `iosystem_init_intracomm` (spec §4.1, §6). I/O tasks are compute
    /// ranks `(base + i*stride) mod P` for `i in [0, n_iotasks)`.
    pub fn init_intracomm(
        comp: &SimpleCommunicator,
        n_iotasks: i32,
        stride: i32,
        base: i32,
        default_rearranger: Rearranger,
    ) -> Result<IOSystem, PioError> {
        let p = comp.size();
        if n_iotasks < 1 {
            return Err(PioError::BadDims(format!(
                "n_iotasks must be >= 1, got {n_iotasks}"
            )));
        }
        if n_iotasks * stride > p {
            return Err(PioError::BadDims(format!(
                "n_iotasks*stride ({}) exceeds compute size ({})",
                n_iotasks * stride,
                p
            )));
        }

        let io_ranks: Vec<i32> = (0..n_iotasks)
            .map(|i| (base + i * stride).rem_euclid(p))
            .collect();

        let compute_comm = comp.duplicate();
        let union_comm = comp.duplicate();

        let rank = comp.rank();
        let is_io_task = io_ranks.contains(&rank);
        let color = if is_io_task {
            Color::with_value(0)
        } else {
            Color::undefined()
        };
        let io_comm = comp.split_by_color(color);

        let compute_ranks: Vec<i32> = (0..p).collect();

        info!(
            "iosystem_init_intracomm: {} compute tasks, {} io tasks at ranks {:?}",
            p, n_iotasks, io_ranks
        );

        Ok(IOSystem {
            compute_comm,
            io_comm,
            union_comm,
            compute_ranks,
            io_ranks: io_ranks.clone(),
            comp_root: 0,
            io_root: io_ranks[0],
            is_io_task,
            async_mode: false,
            default_rearranger,
            error_handler: ErrorHandler::default(),
            rearr_opts: RearrangerOptions::default(),
            backend_options: BackendOptions::default(),
        })
    }

    /// `iosystem_init_async`, explicit proc lists (spec §4.1, §6). Builds a
    /// single IOSystem for the calling task's component: one compute
    /// intracomm, one shared I/O intracomm, and a union covering both for
    /// cross-side message passing. Only `Box`/`Subset` are valid defaults.
    ///
    /// `comp_ranks` and `io_ranks` are both expressed in `world` coordinates.
    /// The I/O-leader is fixed at union-rank 0; the compute-leader is at
    /// union-rank `io_ranks.len()` (spec §4.1).
    ///
    /// On an I/O task this call does not return until it receives an `EXIT`
    /// message (spec §4.1): it builds the `IOSystem`, then immediately
    /// drives [`run_dispatch_loop`] with a handler built from
    /// `backend_factory`. A compute task returns as soon as the `IOSystem`
    /// is built, same as `init_intracomm`.
    pub fn init_async(
        world: &SimpleCommunicator,
        io_ranks: &[i32],
        comp_ranks: &[i32],
        default_rearranger: Rearranger,
        backend_factory: BackendFactory,
    ) -> Result<IOSystem, PioError> {
        if !matches!(default_rearranger, Rearranger::Box | Rearranger::Subset) {
            return Err(PioError::BadRearranger);
        }

        let rank = world.rank();
        let is_io_task = io_ranks.contains(&rank);
        let is_this_component = comp_ranks.contains(&rank);

        if !is_io_task && !is_this_component {
            return Err(PioError::BadDims(
                "calling rank belongs to neither the io list nor this component's compute list"
                    .into(),
            ));
        }

        // union = io_ranks ++ comp_ranks, in that fixed order (spec §4.1:
        // io-leader at union-rank 0, compute-leader at union-rank
        // io_ranks.len()).
        let union_color = Color::with_value(0);
        let union_comm = world
            .split_by_color(union_color)
            .expect("calling rank participates in the async union by construction");

        let comp_color = if is_this_component {
            Color::with_value(1)
        } else {
            Color::undefined()
        };
        let compute_comm = world.split_by_color(comp_color).unwrap_or_else(|| world.duplicate());

        let io_color = if is_io_task {
            Color::with_value(0)
        } else {
            Color::undefined()
        };
        let io_comm = world.split_by_color(io_color);

        debug!(
            "iosystem_init_async: rank {} is_io={} is_compute_member={}",
            rank, is_io_task, is_this_component
        );

        let iosys = IOSystem {
            compute_comm,
            io_comm,
            union_comm,
            compute_ranks: comp_ranks.to_vec(),
            io_ranks: io_ranks.to_vec(),
            comp_root: io_ranks.len() as i32,
            io_root: 0,
            is_io_task,
            async_mode: true,
            default_rearranger,
            error_handler: ErrorHandler::default(),
            rearr_opts: RearrangerOptions::default(),
            backend_options: BackendOptions::default(),
        };

        if iosys.is_io_task {
            let mut state = AsyncIoState::new(backend_factory);
            run_dispatch_loop(&iosys, |msg| dispatch_one(&iosys, &mut state, msg))?;
        }

        Ok(iosys)
    }

    /// `iosystem_init_async`, derived from existing communicators (spec
    /// §4.1): proc lists are built by exchanging ranks across `world` with
    /// an `Allreduce(MAX)` over a zero-initialized per-rank vote vector,
    /// rather than being supplied explicitly.
    pub fn init_async_from_comms(
        world: &SimpleCommunicator,
        is_io_task: bool,
        default_rearranger: Rearranger,
        backend_factory: BackendFactory,
    ) -> Result<IOSystem, PioError> {
        use mpi::collective::SystemOperation;
        use mpi::traits::*;

        let p = world.size() as usize;
        let rank = world.rank();

        let mut io_votes = vec![0i32; p];
        io_votes[rank as usize] = if is_io_task { rank + 1 } else { 0 };
        let mut io_result = vec![0i32; p];
        world.all_reduce_into(&io_votes, &mut io_result, SystemOperation::max());
        let io_ranks: Vec<i32> = io_result.into_iter().filter(|&v| v > 0).map(|v| v - 1).collect();

        let mut comp_votes = vec![0i32; p];
        comp_votes[rank as usize] = if !is_io_task { rank + 1 } else { 0 };
        let mut comp_result = vec![0i32; p];
        world.all_reduce_into(&comp_votes, &mut comp_result, SystemOperation::max());
        let comp_ranks: Vec<i32> = comp_result
            .into_iter()
            .filter(|&v| v > 0)
            .map(|v| v - 1)
            .collect();

        Self::init_async(world, &io_ranks, &comp_ranks, default_rearranger, backend_factory)
    }

    /// `compmaster`: `MPI_ROOT` sentinel on compute-rank 0, `MPI_PROC_NULL`
    /// elsewhere on the compute side (spec §4.1).
    pub fn compmaster(&self) -> i32 {
        if self.compute_comm.rank() == 0 {
            PROC_ROOT
        } else {
            PROC_NULL
        }
    }

    /// `iomaster`: `MPI_ROOT` on I/O-rank 0 (spec §4.1).
    pub fn iomaster(&self) -> i32 {
        match &self.io_comm {
            Some(c) if c.rank() == 0 => PROC_ROOT,
            _ => PROC_NULL,
        }
    }

    /// `set_rearr_opts` (spec §4.11): overrides this IOSystem's default
    /// rearranger comm-type and flow-control options. Decompositions built
    /// afterward via `decomp_init` pick this up as their default unless the
    /// call supplies its own.
    pub fn set_rearr_opts(&mut self, opts: RearrangerOptions) {
        self.rearr_opts = opts;
    }

    /// Replace this IOSystem's backend hint bag (spec §3). Typically
    /// populated once at startup from `extract_backend_options`'s parsed
    /// command-line hints, before any `File::create`/`File::open` builds a
    /// backend that wants to read it.
    pub fn set_backend_options(&mut self, opts: BackendOptions) {
        self.backend_options = opts;
    }

    /// Central error dispatch every collective op funnels through (spec
    /// §7.2): `InternalAbort` prints `file:line` and aborts, `Return` hands
    /// the per-task result back unchanged, `Broadcast` has every task in
    /// `union_comm` learn whether *any* task in the call failed and, if so,
    /// return that failure — not just the task whose own call errored.
    ///
    /// Must be called collectively by every task in `union_comm` under
    /// `Broadcast` (it runs an `Allreduce`); `Return`/`InternalAbort` never
    /// touch the communicator and are safe to call on a subset.
    #[track_caller]
    pub fn handle_error<T>(&self, result: Result<T, PioError>) -> Result<T, PioError> {
        match self.error_handler {
            ErrorHandler::InternalAbort => self.error_handler.dispatch(result),
            ErrorHandler::Return => result,
            ErrorHandler::Broadcast => {
                use mpi::collective::SystemOperation;
                use mpi::traits::*;

                let local_code = match &result {
                    Err(e) => e.code(),
                    Ok(_) => 0,
                };
                let mut worst = 0i32;
                self.union_comm.all_reduce_into(&local_code, &mut worst, SystemOperation::min());
                if worst == 0 {
                    result
                } else if matches!(&result, Err(e) if e.code() == worst) {
                    result
                } else {
                    Err(PioError::Broadcasted(worst))
                }
            }
        }
    }
}

/// Process-local registries for IOSystems, decompositions, and files
/// (spec §4.2, §9 "Cyclic-style global state"). Bundled into one struct so
/// a host without unrestricted globals can thread it through as context,
/// per the spec's own suggestion.
pub struct PioContext {
    pub iosystems: Registry<IOSystem>,
    pub decompositions: Registry<Decomposition>,
    pub files: Registry<File>,
    pub global_error_handler: ErrorHandler,
}

impl Default for PioContext {
    fn default() -> Self {
        PioContext {
            iosystems: Registry::new(0),
            decompositions: Registry::new(DECOMP_ID_BASE),
            files: Registry::new(0),
            global_error_handler: ErrorHandler::default(),
        }
    }
}

impl PioContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iosystem_free(&mut self, iosysid: i32) -> Result<(), PioError> {
        self.iosystems
            .remove(iosysid)
            .map(|_| ())
            .ok_or(PioError::BadIoSystemId(iosysid))
    }

    /// `decomp_free` (spec §4.2, §6). Errors if `decompid` is unknown
    /// rather than silently succeeding, matching `iosystem_free`'s
    /// behavior above.
    pub fn decomp_free(&mut self, decompid: i32) -> Result<(), PioError> {
        self.decompositions
            .remove(decompid)
            .map(|_| ())
            .ok_or(PioError::BadDecompId(decompid))
    }

    /// `closefile` (spec §3 "File" lifecycle, §6): removes the file from
    /// the registry and runs its `close` (flushing any pending
    /// multi-buffer) before dropping it.
    pub fn close_file(&mut self, fileid: i32) -> Result<(), PioError> {
        let mut file = self.files.remove(fileid).ok_or(PioError::BadFileId(fileid))?;
        file.close()
    }
}
