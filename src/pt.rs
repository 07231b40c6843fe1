//! Abstract SCSI pass-through port consumed by the copy engine.
//!
//! The engine never builds cdbs itself; it talks to one of these per side.
//! `Err` from a port method means the transport itself failed; SCSI-level
//! outcomes travel in [`PtStatus`] so the engine can retry the transient
//! ones and account for partial progress on medium errors.

use crate::error::{CopyError, Result};
use crate::options::FlagSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtStatus {
    Good,
    /// Transient; retried up to the configured retry budget.
    UnitAttention,
    /// Transient; retried like a unit attention.
    Aborted,
    MediumHard,
    NotReady,
    InvalidOp,
    Protection,
    ProtectionWithInfo,
    /// The transfer exceeded what the transport accepts; reducing bpt is
    /// the usual remedy.
    TransferTooLarge,
    Other,
}

impl PtStatus {
    /// Convert a non-good status into the error it surfaces as, with a
    /// little context for the message.
    pub fn into_error(self, ctx: &str) -> CopyError {
        match self {
            PtStatus::Good => CopyError::other(format!("{}: no error", ctx)),
            PtStatus::UnitAttention => CopyError::unit_attention(ctx.to_string()),
            PtStatus::Aborted => CopyError::aborted(ctx.to_string()),
            PtStatus::MediumHard => CopyError::medium(ctx.to_string()),
            PtStatus::NotReady => CopyError::not_ready(ctx.to_string()),
            PtStatus::InvalidOp => CopyError::invalid_op(ctx.to_string()),
            PtStatus::Protection => CopyError::Protection,
            PtStatus::ProtectionWithInfo => CopyError::ProtectionWithInfo,
            PtStatus::TransferTooLarge | PtStatus::Other => CopyError::other(ctx.to_string()),
        }
    }
}

/// Result of a READ CAPACITY on the port's device.
#[derive(Debug, Clone, Copy)]
pub struct PtCapacity {
    pub num_blocks: i64,
    pub block_size: i32,
    /// Protection type the device was formatted with (0 = none).
    pub prot_type: i32,
    /// P_I_EXPONENT field; protection interval bytes are 8 * 2^exp.
    pub p_i_exp: i32,
}

/// Outcome of a port read: how far it got, the residual byte count the
/// transport reported, and the SCSI-level status.
#[derive(Debug, Clone, Copy)]
pub struct PtRead {
    pub blocks: i32,
    pub resid: i32,
    pub status: PtStatus,
}

/// Per-side knobs that shape the cdbs a concrete port builds.
#[derive(Debug, Clone, Default)]
pub struct PtConfig {
    pub cdbsz: i32,
    pub dpo: bool,
    pub fua: bool,
    pub fua_nv: bool,
    pub rarc: bool,
    /// rdprotect or wrprotect field value (0..7).
    pub protect: i32,
}

impl PtConfig {
    /// Collect the cdb-shaping knobs out of a side's flag set.
    pub fn from_flags(fp: &FlagSet, protect: i32) -> PtConfig {
        PtConfig {
            cdbsz: fp.cdbsz,
            dpo: fp.dpo,
            fua: fp.fua,
            fua_nv: fp.fua_nv,
            rarc: fp.rarc,
            protect,
        }
    }
}

/// One reusable command object per side, built from a [`PtConfig`].
/// Implementations own the device handle; construction and destruction
/// bracket the copy loop.
pub trait PtPort {
    fn read_capacity(&mut self) -> Result<PtCapacity>;

    /// Issue a READ of `blocks` starting at `lba`. On a medium error the
    /// port reports the blocks it did obtain together with `MediumHard`.
    fn read(&mut self, lba: i64, blocks: i32, buf: &mut [u8]) -> Result<PtRead>;

    fn write(&mut self, lba: i64, blocks: i32, buf: &[u8]) -> Result<PtStatus>;

    /// WRITE SAME(16) with the unmap bit, used to trim an all-zeros run.
    fn write_same(&mut self, lba: i64, blocks: i32, block: &[u8]) -> Result<PtStatus>;

    fn sync_cache(&mut self) -> Result<PtStatus>;
}
