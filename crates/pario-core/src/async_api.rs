//! Compute-side entry points for an asynchronous [`IOSystem`] (spec §4.1,
//! §4.3, §6). Each function mirrors the shape of its synchronous
//! counterpart in [`crate::api`]/[`crate::file`], but a compute task here
//! never touches a backend directly: it sends the I/O side a [`MsgCode`]
//! plus arguments via [`compute_side_call`], then performs the matching
//! local bookkeeping against a shadow [`File`] backed by [`NullBackend`] so
//! its own handle ids stay in lockstep with the real ids the I/O side's
//! [`crate::async_dispatch::dispatch_one`] assigns — both sides run the
//! same insert-order logic against the same message sequence, so no id
//! needs to be sent back.
//!
//! Bulk array data never travels through the message-code argument buffer;
//! `write_darray`/`write_darray_multi`/`read_darray` call
//! [`compute_to_io`]/[`io_to_compute`] directly after the message round
//! trip, the same functions the I/O side calls to meet them.

use mpi::topology::Communicator;

use crate::async_dispatch::{compute_side_call, ArgPacker, MsgCode};
use crate::decomp::exchange::{compute_to_io, io_to_compute};
use crate::element_type::ElementType;
use crate::error::PioError;
use crate::file::{BackendType, File, FileMode, NullBackend};
use crate::iosystem::{IOSystem, PioContext};

fn require_async_compute(iosys: &IOSystem) -> Result<(), PioError> {
    if !iosys.async_mode || iosys.is_io_task {
        return Err(PioError::WrongMode);
    }
    Ok(())
}

/// `file_create` (spec §6, async variant of `File::create`).
pub fn file_create(iosys: &IOSystem, ctx: &mut PioContext, path: &str, backend_type: BackendType) -> Result<i32, PioError> {
    require_async_compute(iosys)?;
    let mut args = ArgPacker::new();
    args.push_str(path);
    args.push_i32(backend_type.to_i32());
    compute_side_call(iosys, MsgCode::Create, args.into_bytes())?;

    let file = File::create(0, Box::new(NullBackend::default()), path, backend_type)?;
    Ok(ctx.files.insert(file))
}

/// `file_open` (spec §6, async variant of `File::open`).
pub fn file_open(iosys: &IOSystem, ctx: &mut PioContext, path: &str, mode: FileMode, backend_type: BackendType) -> Result<i32, PioError> {
    require_async_compute(iosys)?;
    let mut args = ArgPacker::new();
    args.push_str(path);
    args.push_i32(mode.to_i32());
    args.push_i32(backend_type.to_i32());
    compute_side_call(iosys, MsgCode::Open, args.into_bytes())?;

    let file = File::open(0, Box::new(NullBackend::default()), path, mode, backend_type)?;
    Ok(ctx.files.insert(file))
}

/// `closefile` (spec §6, async variant).
pub fn file_close(iosys: &IOSystem, ctx: &mut PioContext, fileid: i32) -> Result<(), PioError> {
    require_async_compute(iosys)?;
    let mut args = ArgPacker::new();
    args.push_i32(fileid);
    compute_side_call(iosys, MsgCode::Close, args.into_bytes())?;

    ctx.close_file(fileid)
}

/// `def_dim` (spec §6, async variant).
pub fn def_dim(iosys: &IOSystem, ctx: &mut PioContext, fileid: i32, name: &str, len: Option<i64>) -> Result<i32, PioError> {
    require_async_compute(iosys)?;
    let mut args = ArgPacker::new();
    args.push_i32(fileid);
    args.push_str(name);
    args.push_opt_i64(len);
    compute_side_call(iosys, MsgCode::DefDim, args.into_bytes())?;

    let file = ctx.files.get_mut(fileid).ok_or(PioError::BadFileId(fileid))?;
    file.define_dim(name, len)
}

/// `def_var` (spec §6, async variant).
pub fn def_var(
    iosys: &IOSystem,
    ctx: &mut PioContext,
    fileid: i32,
    name: &str,
    elem_type: ElementType,
    dim_ids: &[i32],
    is_record_var: bool,
) -> Result<i32, PioError> {
    require_async_compute(iosys)?;
    let mut args = ArgPacker::new();
    args.push_i32(fileid);
    args.push_str(name);
    args.push_i32(elem_type.to_i32());
    args.push_i32(dim_ids.len() as i32);
    for &d in dim_ids {
        args.push_i32(d);
    }
    args.push_i32(is_record_var as i32);
    compute_side_call(iosys, MsgCode::DefVar, args.into_bytes())?;

    let file = ctx.files.get_mut(fileid).ok_or(PioError::BadFileId(fileid))?;
    file.define_var(name, elem_type, dim_ids, is_record_var)
}

/// `enddef` (spec §6, async variant).
pub fn enddef(iosys: &IOSystem, ctx: &mut PioContext, fileid: i32) -> Result<(), PioError> {
    require_async_compute(iosys)?;
    let mut args = ArgPacker::new();
    args.push_i32(fileid);
    compute_side_call(iosys, MsgCode::Enddef, args.into_bytes())?;

    let file = ctx.files.get_mut(fileid).ok_or(PioError::BadFileId(fileid))?;
    file.backend.enddef()
}

/// `sync_file` (spec §6, async variant — the whole-file sync, not
/// [`crate::api::sync_darray`]'s decomposition-scoped flush).
pub fn sync(iosys: &IOSystem, ctx: &mut PioContext, fileid: i32) -> Result<(), PioError> {
    require_async_compute(iosys)?;
    let mut args = ArgPacker::new();
    args.push_i32(fileid);
    compute_side_call(iosys, MsgCode::Sync, args.into_bytes())?;

    let file = ctx.files.get_mut(fileid).ok_or(PioError::BadFileId(fileid))?;
    file.backend.sync()
}

/// `set_record` (spec §6, async variant).
pub fn set_record(iosys: &IOSystem, ctx: &mut PioContext, fileid: i32, varid: i32, record: i64) -> Result<(), PioError> {
    require_async_compute(iosys)?;
    let mut args = ArgPacker::new();
    args.push_i32(fileid);
    args.push_i32(varid);
    args.push_i64(record);
    compute_side_call(iosys, MsgCode::SetRecord, args.into_bytes())?;

    let file = ctx.files.get_mut(fileid).ok_or(PioError::BadFileId(fileid))?;
    file.set_record(varid, record)
}

/// `advance_record` (spec §6, async variant).
pub fn advance_record(iosys: &IOSystem, ctx: &mut PioContext, fileid: i32, varid: i32) -> Result<(), PioError> {
    require_async_compute(iosys)?;
    let mut args = ArgPacker::new();
    args.push_i32(fileid);
    args.push_i32(varid);
    compute_side_call(iosys, MsgCode::AdvanceRecord, args.into_bytes())?;

    let file = ctx.files.get_mut(fileid).ok_or(PioError::BadFileId(fileid))?;
    file.advance_record(varid)
}

/// `write_darray` (spec §4.9, §6, async variant). Unlike
/// [`crate::api::write_darray`] this flushes immediately: there is no
/// per-file `MultiBuffer` to aggregate into on the compute side (it has no
/// real backend to eventually flush against), so every call runs its own
/// `compute_to_io` round. See DESIGN.md's Open Questions for why async mode
/// gives up cross-call aggregation.
pub fn write_darray(
    iosys: &IOSystem,
    ctx: &mut PioContext,
    fileid: i32,
    decompid: i32,
    varid: i32,
    record: Option<i64>,
    fill_value: Option<&[u8]>,
    data: &[u8],
) -> Result<(), PioError> {
    require_async_compute(iosys)?;
    let decomp = ctx.decompositions.get(decompid).ok_or(PioError::BadDecompId(decompid))?.clone();
    if decomp.read_only {
        return Err(PioError::DecompReadOnly);
    }
    let elem_size = decomp.elem_type.byte_size();
    let fill = if decomp.needs_fill { fill_value.map(|f| f.to_vec()) } else { None };

    let mut args = ArgPacker::new();
    args.push_i32(fileid);
    args.push_i32(decompid);
    args.push_i32(elem_size as i32);
    args.push_i32(1);
    args.push_i32(varid);
    args.push_opt_i64(record);
    args.push_opt_bytes(fill.as_deref());
    compute_side_call(iosys, MsgCode::WriteDarray, args.into_bytes())?;

    compute_to_io(
        &iosys.union_comm,
        iosys.union_comm.rank(),
        &iosys.io_ranks,
        false,
        &decomp,
        decomp.rearr_opts.compute_to_io,
        elem_size,
        data,
    )?;
    Ok(())
}

/// `write_darray_multi` (spec §6, async variant): one `compute_to_io` round
/// shared by every listed variable, mirroring the synchronous path's "one
/// rearrangement per flush" even though async mode can't defer the flush
/// itself across separate calls.
pub fn write_darray_multi(
    iosys: &IOSystem,
    ctx: &mut PioContext,
    fileid: i32,
    decompid: i32,
    varids: &[i32],
    records: &[Option<i64>],
    fill_values: &[Option<&[u8]>],
    data: &[u8],
) -> Result<(), PioError> {
    require_async_compute(iosys)?;
    if varids.len() != records.len() || varids.len() != fill_values.len() {
        return Err(PioError::BadDims(
            "write_darray_multi: varids/records/fill_values length mismatch".into(),
        ));
    }
    let decomp = ctx.decompositions.get(decompid).ok_or(PioError::BadDecompId(decompid))?.clone();
    if decomp.read_only {
        return Err(PioError::DecompReadOnly);
    }
    let elem_size = decomp.elem_type.byte_size();

    let mut args = ArgPacker::new();
    args.push_i32(fileid);
    args.push_i32(decompid);
    args.push_i32(elem_size as i32);
    args.push_i32(varids.len() as i32);
    for ((&varid, &record), &fill) in varids.iter().zip(records).zip(fill_values) {
        args.push_i32(varid);
        args.push_opt_i64(record);
        let fill = if decomp.needs_fill { fill.map(|f| f.to_vec()) } else { None };
        args.push_opt_bytes(fill.as_deref());
    }
    compute_side_call(iosys, MsgCode::WriteDarrayMulti, args.into_bytes())?;

    compute_to_io(
        &iosys.union_comm,
        iosys.union_comm.rank(),
        &iosys.io_ranks,
        false,
        &decomp,
        decomp.rearr_opts.compute_to_io,
        elem_size,
        data,
    )?;
    Ok(())
}

/// `read_darray` (spec §4.9, §6, async variant). `fileid` travels in the
/// message purely so the I/O side knows which open file to read from; this
/// side needs only `decompid` to drive its half of the exchange.
pub fn read_darray(
    iosys: &IOSystem,
    ctx: &mut PioContext,
    fileid: i32,
    decompid: i32,
    varid: i32,
    record: Option<i64>,
    elem_type: ElementType,
) -> Result<Vec<u8>, PioError> {
    require_async_compute(iosys)?;
    let decomp = ctx.decompositions.get(decompid).ok_or(PioError::BadDecompId(decompid))?.clone();
    let elem_size = elem_type.byte_size();

    let mut args = ArgPacker::new();
    args.push_i32(fileid);
    args.push_i32(decompid);
    args.push_i32(elem_size as i32);
    args.push_i32(varid);
    args.push_opt_i64(record);
    compute_side_call(iosys, MsgCode::ReadDarray, args.into_bytes())?;

    io_to_compute(
        &iosys.union_comm,
        iosys.union_comm.rank(),
        &iosys.io_ranks,
        false,
        &decomp,
        decomp.rearr_opts.io_to_compute,
        elem_size,
        &[],
    )
}
