//! The `FileBackend` trait, and the `File`/`VariableDescriptor` types built
//! on top of it.
//!
//! Reference: spec §1 "Out of scope (external collaborators)" frames the
//! underlying netCDF/PnetCDF calls as an interface, not an implementation;
//! spec §3 "File"/"Variable descriptor". Modeled directly on the teacher's
//! `Aiori` trait (`ior-core/src/aiori.rs`): a small trait of backend
//! primitives plus free-standing default methods for operations most
//! backends share, with one concrete backend (`pario-backend-flatfile`)
//! implementing it for real.

use crate::element_type::ElementType;
use crate::error::{ErrorHandler, PioError};
use crate::multibuffer::MultiBuffer;

/// Backend type tag (spec §3 "File"). Only `ClassicSerial` and
/// `ClassicParallel` have a concrete implementation in this workspace;
/// the HDF5 variants exist as a seam for a future backend crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    ClassicSerial,
    ClassicParallel,
    Hdf5Serial,
    Hdf5Parallel,
}

impl BackendType {
    /// Wire tag for the async dispatch argument encoding (spec §4.3): a
    /// compute task broadcasts this to the I/O side instead of the enum
    /// itself.
    pub fn to_i32(self) -> i32 {
        match self {
            BackendType::ClassicSerial => 0,
            BackendType::ClassicParallel => 1,
            BackendType::Hdf5Serial => 2,
            BackendType::Hdf5Parallel => 3,
        }
    }

    pub fn from_i32(v: i32) -> Result<Self, PioError> {
        Ok(match v {
            0 => BackendType::ClassicSerial,
            1 => BackendType::ClassicParallel,
            2 => BackendType::Hdf5Serial,
            3 => BackendType::Hdf5Parallel,
            other => return Err(PioError::BadDims(format!("unknown backend type tag {other}"))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    ReadOnly,
    ReadWrite,
    Create,
}

impl FileMode {
    pub fn to_i32(self) -> i32 {
        match self {
            FileMode::ReadOnly => 0,
            FileMode::ReadWrite => 1,
            FileMode::Create => 2,
        }
    }

    pub fn from_i32(v: i32) -> Result<Self, PioError> {
        Ok(match v {
            0 => FileMode::ReadOnly,
            1 => FileMode::ReadWrite,
            2 => FileMode::Create,
            other => return Err(PioError::BadDims(format!("unknown file mode tag {other}"))),
        })
    }
}

/// One contiguous write/read region plus its byte offset into a packed
/// caller buffer, the parameters a `put_vara`/`get_vara` call needs (spec
/// §1 "contiguous `put_vara`/`get_vara` with start+count (and optional
/// stride)").
#[derive(Debug, Clone)]
pub struct VaraRequest {
    pub start: Vec<i64>,
    pub count: Vec<i64>,
    pub stride: Option<Vec<i64>>,
}

/// Constructs a concrete [`FileBackend`] for a [`BackendType`] (spec §4.3).
/// `pario-core` can't depend on a concrete backend crate, so the I/O-side
/// async dispatch loop (`async_dispatch::run_dispatch_loop`) takes one of
/// these from its caller instead of naming `pario-backend-flatfile`
/// directly, the same seam `FileBackend` itself already is for the
/// synchronous API.
pub type BackendFactory = std::sync::Arc<dyn Fn(BackendType) -> Result<Box<dyn FileBackend>, PioError> + Send + Sync>;

/// The interface every on-disk array format has to satisfy to be usable as
/// a pio file backend (spec §1). Backends that can't do non-blocking I/O
/// get a synchronous default for `wait_all`.
pub trait FileBackend: Send {
    fn create(&mut self, path: &str) -> Result<(), PioError>;
    fn open(&mut self, path: &str, writable: bool) -> Result<(), PioError>;
    fn close(&mut self) -> Result<(), PioError>;
    fn sync(&mut self) -> Result<(), PioError>;
    /// Leaves define mode, after which dims/vars may no longer be added.
    fn enddef(&mut self) -> Result<(), PioError>;

    fn define_dim(&mut self, name: &str, len: Option<i64>) -> Result<i32, PioError>;
    fn define_var(
        &mut self,
        name: &str,
        elem_type: ElementType,
        dim_ids: &[i32],
    ) -> Result<i32, PioError>;

    /// Inquiry family (spec §1 groups these with the out-of-scope thin
    /// wrappers, but a backend still has to expose *some* way to look up a
    /// dim/var it already defined — our own `pario-backend-flatfile`
    /// implements these for real so `decomp_io`'s round trip has something
    /// to read back against).
    fn inq_dimid(&self, name: &str) -> Result<i32, PioError>;
    fn inq_dimlen(&self, dim_id: i32) -> Result<i64, PioError>;
    fn inq_varid(&self, name: &str) -> Result<i32, PioError>;

    fn put_vara(&mut self, var_id: i32, req: &VaraRequest, data: &[u8]) -> Result<(), PioError>;
    fn get_vara(&mut self, var_id: i32, req: &VaraRequest, out: &mut [u8]) -> Result<(), PioError>;

    /// Queue a non-blocking write and return a request token; default
    /// implementation just performs it synchronously and returns a token
    /// that `wait_all`'s default treats as already complete.
    fn iput_vara(&mut self, var_id: i32, req: &VaraRequest, data: &[u8]) -> Result<u64, PioError> {
        self.put_vara(var_id, req, data)?;
        Ok(0)
    }

    /// Block until every outstanding request named in `tokens` completes.
    /// Default is a no-op: backends whose `iput_vara` is synchronous have
    /// nothing left to wait for.
    fn wait_all(&mut self, tokens: &[u64]) -> Result<(), PioError> {
        let _ = tokens;
        Ok(())
    }
}

/// Attributes of one variable within a file (spec §3 "Variable
/// descriptor").
pub struct VariableDescriptor {
    pub backend_var_id: i32,
    pub is_record_var: bool,
    pub current_record: i64,
    pub pending_requests: Vec<u64>,
    pub fill_value: Option<Vec<u8>>,
    pub fill_enabled: bool,
    pub elem_type: ElementType,
}

impl VariableDescriptor {
    pub fn new(backend_var_id: i32, is_record_var: bool, elem_type: ElementType) -> Self {
        VariableDescriptor {
            backend_var_id,
            is_record_var,
            current_record: 0,
            pending_requests: Vec::new(),
            fill_value: None,
            fill_enabled: false,
            elem_type,
        }
    }
}

/// Attributes of an open file (spec §3 "File"). `iosystem_id` is a
/// non-owning back-reference — the file does not outlive a free'd
/// IOSystem, but the IOSystem has no pointer back to its open files (spec
/// §9 "Cyclic references").
pub struct File {
    pub iosystem_id: i32,
    pub backend: Box<dyn FileBackend>,
    pub backend_type: BackendType,
    pub writable: bool,
    pub variables: Vec<VariableDescriptor>,
    pub multi_buffer: Option<MultiBuffer>,
    /// `set_error_handler(scope=file, ...)` override (spec §7). `None`
    /// means "defer to the owning IOSystem's policy".
    pub error_handler: Option<ErrorHandler>,
}

impl File {
    pub fn create(
        iosystem_id: i32,
        mut backend: Box<dyn FileBackend>,
        path: &str,
        backend_type: BackendType,
    ) -> Result<File, PioError> {
        backend.create(path)?;
        Ok(File {
            iosystem_id,
            backend,
            backend_type,
            writable: true,
            variables: Vec::new(),
            multi_buffer: None,
            error_handler: None,
        })
    }

    pub fn open(
        iosystem_id: i32,
        mut backend: Box<dyn FileBackend>,
        path: &str,
        mode: FileMode,
        backend_type: BackendType,
    ) -> Result<File, PioError> {
        let writable = !matches!(mode, FileMode::ReadOnly);
        backend.open(path, writable)?;
        Ok(File {
            iosystem_id,
            backend,
            backend_type,
            writable,
            variables: Vec::new(),
            multi_buffer: None,
            error_handler: None,
        })
    }

    /// `set_error_handler(scope=file, kind)` (spec §6, §7). Overrides
    /// whatever policy the owning IOSystem has; pass `None` to fall back to
    /// it again.
    pub fn set_error_handler(&mut self, handler: Option<ErrorHandler>) {
        self.error_handler = handler;
    }

    /// Effective policy for an operation on this file: the file-level
    /// override if one was set via `set_error_handler`, else `iosys_default`.
    pub fn effective_error_handler(&self, iosys_default: ErrorHandler) -> ErrorHandler {
        self.error_handler.unwrap_or(iosys_default)
    }

    /// Close implicitly flushes any pending multi-buffer (spec §3 "File"
    /// lifecycle). This flush runs without a compute→io exchange: a caller
    /// driving a live [`crate::decomp::exchange::ExchangeContext`] must
    /// call [`crate::api::sync_darray`] with it before `close` so queued
    /// writes are already redistributed (and the buffer empty) by the time
    /// `close` runs its own unconditional flush.
    pub fn close(&mut self) -> Result<(), PioError> {
        if let Some(mb) = self.multi_buffer.take() {
            crate::multibuffer::flush(self, mb, None)?;
        }
        self.backend.sync()?;
        self.backend.close()
    }

    pub fn define_dim(&mut self, name: &str, len: Option<i64>) -> Result<i32, PioError> {
        self.backend.define_dim(name, len)
    }

    pub fn define_var(
        &mut self,
        name: &str,
        elem_type: ElementType,
        dim_ids: &[i32],
        is_record_var: bool,
    ) -> Result<i32, PioError> {
        let backend_id = self.backend.define_var(name, elem_type, dim_ids)?;
        self.variables.push(VariableDescriptor::new(backend_id, is_record_var, elem_type));
        Ok(self.variables.len() as i32 - 1)
    }

    /// Register a [`VariableDescriptor`] for a variable that already exists
    /// in the backend (a file reopened after `enddef`, where `define_var`
    /// would fail with [`PioError::WrongMode`]). Looks the variable up by
    /// name via `inq_varid` rather than redefining it.
    pub fn attach_var(&mut self, name: &str, elem_type: ElementType, is_record_var: bool) -> Result<i32, PioError> {
        let backend_id = self.backend.inq_varid(name)?;
        self.variables.push(VariableDescriptor::new(backend_id, is_record_var, elem_type));
        Ok(self.variables.len() as i32 - 1)
    }

    pub fn set_record(&mut self, varid: i32, record: i64) -> Result<(), PioError> {
        let var = self
            .variables
            .get_mut(varid as usize)
            .ok_or_else(|| PioError::BadDims(format!("no such varid {varid}")))?;
        var.current_record = record;
        Ok(())
    }

    pub fn advance_record(&mut self, varid: i32) -> Result<(), PioError> {
        let var = self
            .variables
            .get_mut(varid as usize)
            .ok_or_else(|| PioError::BadDims(format!("no such varid {varid}")))?;
        var.current_record += 1;
        Ok(())
    }
}

/// A [`FileBackend`] that performs no I/O at all (spec §4.3): in async
/// mode, a compute task never touches a file's bytes directly — the
/// exchange moves them straight into an I/O task's real backend — but it
/// still needs a local `File` to track dim/var bookkeeping in lockstep
/// with the I/O side's registry so ids line up. dim/var ids always come
/// back as the count of dims/vars already defined, matching the sequential
/// assignment every concrete backend in this workspace also uses.
#[derive(Default)]
pub struct NullBackend {
    ndims: i32,
}

impl FileBackend for NullBackend {
    fn create(&mut self, _path: &str) -> Result<(), PioError> {
        Ok(())
    }
    fn open(&mut self, _path: &str, _writable: bool) -> Result<(), PioError> {
        Ok(())
    }
    fn close(&mut self) -> Result<(), PioError> {
        Ok(())
    }
    fn sync(&mut self) -> Result<(), PioError> {
        Ok(())
    }
    fn enddef(&mut self) -> Result<(), PioError> {
        Ok(())
    }
    fn define_dim(&mut self, _name: &str, _len: Option<i64>) -> Result<i32, PioError> {
        let id = self.ndims;
        self.ndims += 1;
        Ok(id)
    }
    fn define_var(&mut self, _name: &str, _elem_type: ElementType, _dim_ids: &[i32]) -> Result<i32, PioError> {
        Ok(0)
    }
    fn inq_dimid(&self, _name: &str) -> Result<i32, PioError> {
        Ok(0)
    }
    fn inq_dimlen(&self, _dim_id: i32) -> Result<i64, PioError> {
        Ok(0)
    }
    fn inq_varid(&self, _name: &str) -> Result<i32, PioError> {
        Ok(0)
    }
    fn put_vara(&mut self, _var_id: i32, _req: &VaraRequest, _data: &[u8]) -> Result<(), PioError> {
        Ok(())
    }
    fn get_vara(&mut self, _var_id: i32, _req: &VaraRequest, _out: &mut [u8]) -> Result<(), PioError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopBackend;
    impl FileBackend for NoopBackend {
        fn create(&mut self, _path: &str) -> Result<(), PioError> {
            Ok(())
        }
        fn open(&mut self, _path: &str, _writable: bool) -> Result<(), PioError> {
            Ok(())
        }
        fn close(&mut self) -> Result<(), PioError> {
            Ok(())
        }
        fn sync(&mut self) -> Result<(), PioError> {
            Ok(())
        }
        fn enddef(&mut self) -> Result<(), PioError> {
            Ok(())
        }
        fn define_dim(&mut self, _name: &str, _len: Option<i64>) -> Result<i32, PioError> {
            Ok(0)
        }
        fn define_var(&mut self, _name: &str, _elem_type: ElementType, _dim_ids: &[i32]) -> Result<i32, PioError> {
            Ok(0)
        }
        fn inq_dimid(&self, _name: &str) -> Result<i32, PioError> {
            Ok(0)
        }
        fn inq_dimlen(&self, _dim_id: i32) -> Result<i64, PioError> {
            Ok(0)
        }
        fn inq_varid(&self, _name: &str) -> Result<i32, PioError> {
            Ok(0)
        }
        fn put_vara(&mut self, _var_id: i32, _req: &VaraRequest, _data: &[u8]) -> Result<(), PioError> {
            Ok(())
        }
        fn get_vara(&mut self, _var_id: i32, _req: &VaraRequest, _out: &mut [u8]) -> Result<(), PioError> {
            Ok(())
        }
    }

    #[test]
    fn file_error_handler_override_falls_back_to_iosystem_default_when_unset() {
        let file = File::create(0, Box::new(NoopBackend), "mem", BackendType::ClassicSerial).unwrap();
        assert_eq!(file.effective_error_handler(ErrorHandler::Broadcast), ErrorHandler::Broadcast);
    }

    #[test]
    fn file_error_handler_override_takes_precedence() {
        let mut file = File::create(0, Box::new(NoopBackend), "mem", BackendType::ClassicSerial).unwrap();
        file.set_error_handler(Some(ErrorHandler::InternalAbort));
        assert_eq!(file.effective_error_handler(ErrorHandler::Return), ErrorHandler::InternalAbort);
    }

    #[test]
    fn set_record_and_advance_record_update_the_descriptor() {
        let mut file = File::create(0, Box::new(NoopBackend), "mem", BackendType::ClassicSerial).unwrap();
        let varid = file.define_var("v", ElementType::F64, &[], true).unwrap();
        file.set_record(varid, 5).unwrap();
        assert_eq!(file.variables[varid as usize].current_record, 5);
        file.advance_record(varid).unwrap();
        assert_eq!(file.variables[varid as usize].current_record, 6);
    }
}
