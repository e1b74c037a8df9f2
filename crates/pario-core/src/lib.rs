//! Core types and algorithms for a parallel I/O library built around MPI:
//! process-group management, decompositions and their rearrangers, and the
//! distributed-array write path. Concrete file formats live in separate
//! backend crates behind [`file::FileBackend`].

pub mod api;
pub mod async_api;
pub mod async_dispatch;
pub mod backend_options;
pub mod decomp;
pub mod decomp_io;
pub mod element_type;
pub mod error;
pub mod file;
pub mod iosystem;
pub mod multibuffer;
pub mod rearranger;
pub mod registry;

// Re-export primary types for convenience
pub use api::{read_darray, sync_darray, write_darray};
pub use backend_options::{extract_backend_options, BackendOptions, OptionValue};
pub use element_type::ElementType;
pub use error::{ErrorHandler, PioError};
pub use file::{BackendFactory, BackendType, File, FileBackend, FileMode, NullBackend, VaraRequest, VariableDescriptor};
pub use iosystem::{IOSystem, PioContext};
pub use multibuffer::MultiBuffer;
pub use rearranger::{FlowControlOptions, Rearranger, RearrangerCommFlags, RearrangerOptions};
pub use registry::Registry;
