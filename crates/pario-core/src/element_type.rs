//! Element-type tag shared by every typed public entry point.
//!
//! Reference: spec §9 "Dynamic dispatch on element type" — public APIs fan
//! out into one entry per numeric type, but internally this is a single
//! typed operation parameterized by an `(element_type, byte_size, mpi_type)`
//! triple. We represent the triple as a tagged enum plus a small trait of
//! type-specific helpers, the way the teacher represents `DataPacketType`
//! as a tagged enum with free functions rather than duplicating the I/O
//! loop per pattern kind.

use mpi::datatype::{Equivalence, SystemDatatype};
use mpi::topology::SimpleCommunicator;

/// Element type recognized by a decomposition or variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    I32,
    I64,
    F32,
    F64,
    U8,
}

impl ElementType {
    /// Wire tag for the async dispatch argument encoding (spec §4.3).
    pub fn to_i32(self) -> i32 {
        match self {
            ElementType::I32 => 0,
            ElementType::I64 => 1,
            ElementType::F32 => 2,
            ElementType::F64 => 3,
            ElementType::U8 => 4,
        }
    }

    pub fn from_i32(v: i32) -> Result<Self, crate::error::PioError> {
        Ok(match v {
            0 => ElementType::I32,
            1 => ElementType::I64,
            2 => ElementType::F32,
            3 => ElementType::F64,
            4 => ElementType::U8,
            other => return Err(crate::error::PioError::BadDims(format!("unknown element type tag {other}"))),
        })
    }

    /// Byte size of one element.
    pub const fn byte_size(self) -> usize {
        match self {
            ElementType::I32 => 4,
            ElementType::I64 => 8,
            ElementType::F32 => 4,
            ElementType::F64 => 8,
            ElementType::U8 => 1,
        }
    }

    /// The matching MPI predefined datatype, for building derived types on
    /// top of it (box/subset rearranger send/recv types) and for direct
    /// collective calls (duplicate detection, reductions). Delegates to
    /// rsmpi's `Equivalence` impls on the primitive types rather than
    /// poking at raw `MPI_Datatype` values ourselves.
    pub fn mpi_datatype(self) -> SystemDatatype {
        match self {
            ElementType::I32 => i32::equivalent_datatype(),
            ElementType::I64 => i64::equivalent_datatype(),
            ElementType::F32 => f32::equivalent_datatype(),
            ElementType::F64 => f64::equivalent_datatype(),
            ElementType::U8 => u8::equivalent_datatype(),
        }
    }
}

/// Type-specific helpers that would otherwise force per-type code
/// duplication in the fill-value and byte-swap paths (spec §9).
pub trait TypeOps {
    /// Compare a raw little-endian element against this type's fill value,
    /// used by the subset rearranger's hole-filling path.
    fn equals_fill(bytes: &[u8], fill: &[u8]) -> bool {
        bytes == fill
    }
}

impl TypeOps for ElementType {}

/// Byte-swap a single element of `ty` in place. No-op on this platform's
/// native endianness path (row-major little-endian on disk, as written by
/// `pario-backend-flatfile`); kept as a seam for big-endian backends.
pub fn byteswap_elements(ty: ElementType, buf: &mut [u8]) {
    let sz = ty.byte_size();
    if sz <= 1 {
        return;
    }
    for chunk in buf.chunks_exact_mut(sz) {
        chunk.reverse();
    }
}

/// The world/io/compute communicator type used throughout the crate. rsmpi's
/// `SimpleCommunicator` backs both `MPI_COMM_WORLD`-derived communicators and
/// duplicated/split sub-communicators.
pub type Comm = SimpleCommunicator;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_sizes() {
        assert_eq!(ElementType::I32.byte_size(), 4);
        assert_eq!(ElementType::I64.byte_size(), 8);
        assert_eq!(ElementType::F64.byte_size(), 8);
        assert_eq!(ElementType::U8.byte_size(), 1);
    }

    #[test]
    fn byteswap_roundtrip() {
        let mut buf = 0x0102_0304_i32.to_le_bytes().to_vec();
        byteswap_elements(ElementType::I32, &mut buf);
        assert_eq!(buf, vec![0x04, 0x03, 0x02, 0x01]);
        byteswap_elements(ElementType::I32, &mut buf);
        assert_eq!(buf, 0x0102_0304_i32.to_le_bytes().to_vec());
    }

    #[test]
    fn byteswap_u8_is_noop() {
        let mut buf = vec![1u8, 2, 3];
        byteswap_elements(ElementType::U8, &mut buf);
        assert_eq!(buf, vec![1, 2, 3]);
    }
}
