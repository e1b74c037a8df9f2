//! Error kinds and the per-IOSystem/per-file error handling policy.
//!
//! Reference: spec §7 (six error kinds, three selectable policies).

use thiserror::Error;

/// Library-origin error codes live in a reserved negative range starting at
/// this sentinel (spec §6, §7).
pub const PIO_ERROR_BASE: i32 = -500;

/// All recognized error conditions, grouped by the six kinds of spec §7.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PioError {
    // --- 1. Argument errors ---
    #[error("unknown iosystem id {0}")]
    BadIoSystemId(i32),
    #[error("unknown decomposition id {0}")]
    BadDecompId(i32),
    #[error("unknown file id {0}")]
    BadFileId(i32),
    #[error("required pointer/handle was null")]
    NullArgument,
    #[error("dimension count/size out of range: {0}")]
    BadDims(String),
    #[error("start/count out of range for variable: {0}")]
    BadRegion(String),
    #[error("invalid rearranger requested")]
    BadRearranger,

    // --- 2. State errors ---
    #[error("operation not valid in current define/data mode")]
    WrongMode,
    #[error("write attempted on a read-only decomposition (duplicate map entries)")]
    DecompReadOnly,
    #[error("parallel operation requested on a non-parallel-capable backend")]
    BackendNotParallel,

    // --- 3. Resource errors ---
    #[error("allocation failed: {0}")]
    Alloc(String),
    #[error("exceeded maximum number of open files")]
    TooManyFiles,
    #[error("exceeded maximum number of dimensions or variables")]
    TooManyDimsOrVars,

    // --- 4. Communication errors ---
    #[error("MPI collective failed: {0}")]
    Mpi(String),
    /// Reconstructed on a task whose own call succeeded (or failed
    /// differently) after `ErrorHandler::Broadcast` learned a peer in the
    /// same scope failed (spec §7 "Broadcast"). Carries the peer's code
    /// since the original `PioError` value isn't itself transferable.
    #[error("error broadcast from peer task: code {0}")]
    Broadcasted(i32),

    // --- 5. Backend errors ---
    #[error("file backend error: {0}")]
    Backend(String),

    // --- 6. Protocol errors ---
    #[error("rearranger mismatch between compute and I/O side: {0}")]
    RearrangerMismatch(String),
    #[error("unknown async message code {0}")]
    UnknownMessageCode(i32),
}

impl PioError {
    /// Stable negative sentinel for this error, counted down from
    /// [`PIO_ERROR_BASE`] in declaration order. Backend errors keep whatever
    /// code the backend itself reported when one is available.
    pub fn code(&self) -> i32 {
        use PioError::*;
        match self {
            BadIoSystemId(_) => PIO_ERROR_BASE,
            BadDecompId(_) => PIO_ERROR_BASE - 1,
            BadFileId(_) => PIO_ERROR_BASE - 2,
            NullArgument => PIO_ERROR_BASE - 3,
            BadDims(_) => PIO_ERROR_BASE - 4,
            BadRegion(_) => PIO_ERROR_BASE - 5,
            BadRearranger => PIO_ERROR_BASE - 6,
            WrongMode => PIO_ERROR_BASE - 7,
            DecompReadOnly => PIO_ERROR_BASE - 8,
            BackendNotParallel => PIO_ERROR_BASE - 9,
            Alloc(_) => PIO_ERROR_BASE - 10,
            TooManyFiles => PIO_ERROR_BASE - 11,
            TooManyDimsOrVars => PIO_ERROR_BASE - 12,
            Mpi(_) => PIO_ERROR_BASE - 13,
            Backend(_) => PIO_ERROR_BASE - 14,
            RearrangerMismatch(_) => PIO_ERROR_BASE - 15,
            UnknownMessageCode(_) => PIO_ERROR_BASE - 16,
            Broadcasted(code) => *code,
        }
    }

    /// Protocol errors are fatal under `internal_abort` and otherwise
    /// surfaced verbatim (spec §7 "Recovery scope").
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            PioError::RearrangerMismatch(_) | PioError::UnknownMessageCode(_)
        )
    }
}

impl From<std::io::Error> for PioError {
    fn from(e: std::io::Error) -> Self {
        PioError::Backend(e.to_string())
    }
}

/// Error-handling policy, selectable per IOSystem and overridable per file
/// (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorHandler {
    /// Print `file:line` and abort the whole process group.
    InternalAbort,
    /// Root broadcasts the error code to every member of the relevant
    /// communicator; every task returns it.
    Broadcast,
    /// The failing task returns the error; peers return success.
    #[default]
    Return,
}

impl ErrorHandler {
    /// Apply this policy to a result produced on the calling task.
    ///
    /// Under `InternalAbort` this never returns on `Err`. Under the other
    /// two policies it's the caller's job to have already broadcast (or
    /// not) the code to peers before calling this — `dispatch` only decides
    /// whether to abort.
    #[track_caller]
    pub fn dispatch<T>(self, result: Result<T, PioError>) -> Result<T, PioError> {
        match (&result, self) {
            (Err(e), ErrorHandler::InternalAbort) => {
                let loc = std::panic::Location::caller();
                eprintln!("{}:{}: fatal pio error: {}", loc.file(), loc.line(), e);
                std::process::abort();
            }
            _ => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_distinct_and_descend_from_base() {
        let errs = [
            PioError::BadIoSystemId(1),
            PioError::BadDecompId(1),
            PioError::BadFileId(1),
            PioError::NullArgument,
            PioError::BadDims("x".into()),
            PioError::BadRegion("x".into()),
            PioError::BadRearranger,
            PioError::WrongMode,
            PioError::DecompReadOnly,
            PioError::BackendNotParallel,
            PioError::Alloc("x".into()),
            PioError::TooManyFiles,
            PioError::TooManyDimsOrVars,
            PioError::Mpi("x".into()),
            PioError::Backend("x".into()),
            PioError::RearrangerMismatch("x".into()),
            PioError::UnknownMessageCode(1),
        ];
        let mut codes: Vec<i32> = errs.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errs.len());
        assert!(errs.iter().all(|e| e.code() <= PIO_ERROR_BASE));
    }

    #[test]
    fn protocol_errors_flagged() {
        assert!(PioError::RearrangerMismatch("x".into()).is_protocol());
        assert!(PioError::UnknownMessageCode(7).is_protocol());
        assert!(!PioError::DecompReadOnly.is_protocol());
    }

    #[test]
    fn return_policy_passes_through() {
        let r: Result<i32, PioError> = Err(PioError::DecompReadOnly);
        assert!(ErrorHandler::Return.dispatch(r).is_err());
    }
}
