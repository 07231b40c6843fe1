//! Count planner: sizes both sides, derives the block count to copy when
//! the user did not give one, and applies the resume adjustment.

use crate::error::{CopyError, Result};
use crate::fileio::{blkdev_capacity, FileKind, Side};
use crate::options::Opts;
use crate::pt::PtCapacity;
use tracing::{debug, warn};

/// Whether the copy should go ahead after planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountOutcome {
    Proceed,
    /// resume found the whole copy already present in OFILE.
    AlreadyComplete,
}

/// Print number of blocks and block size; over 1 MB add the size scaled to
/// MB/GB/TB (decimal, base-10).
fn log_blk_sizes(fname: &str, access: &str, num_sect: i64, sect_sz: i32) {
    if num_sect <= 0 {
        debug!("  {} [{}]: blocks={}, _bs={}", fname, access, num_sect, sect_sz);
        return;
    }
    let n = num_sect as i128 * sect_sz as i128;
    let mb = n / 1_000_000;
    if mb > 999 {
        let gb = mb as f64 / 1000.0;
        if gb > 999.0 {
            debug!(
                "  {} [{}]: blocks={} [0x{:x}], _bs={}, {:.2} TB",
                fname, access, num_sect, num_sect, sect_sz, gb / 1000.0
            );
        } else {
            debug!(
                "  {} [{}]: blocks={} [0x{:x}], _bs={}, {:.2} GB",
                fname, access, num_sect, num_sect, sect_sz, gb
            );
        }
    } else if mb > 0 {
        debug!(
            "  {} [{}]: blocks={} [0x{:x}], _bs={}, {} MB{}",
            fname,
            access,
            num_sect,
            num_sect,
            sect_sz,
            mb,
            if mb < 10 { " approx" } else { "" }
        );
    } else {
        debug!(
            "  {} [{}]: blocks={} [0x{:x}], _bs={}",
            fname, access, num_sect, num_sect, sect_sz
        );
    }
}

/// READ CAPACITY with a single retry past a unit attention or an aborted
/// command, as devices commonly report one right after open.
fn pt_capacity(side: &mut Side, which: &str) -> Result<PtCapacity> {
    let port = side
        .pt
        .as_mut()
        .ok_or_else(|| CopyError::other("pass-through side has no port"))?;
    match port.read_capacity() {
        Err(CopyError::UnitAttention(_)) => {
            warn!("Unit attention (readcap {}), continuing", which);
            port.read_capacity()
        }
        Err(CopyError::AbortedCommand(_)) => {
            warn!("Aborted command (readcap {}), continuing", which);
            port.read_capacity()
        }
        other => other,
    }
}

/// Attempt to size IFILE in input blocks. Returns -1 when unknown.
fn calc_count_in(op: &mut Opts, input: &mut Side) -> Result<i64> {
    match input.kind {
        FileKind::Passthrough => {
            if op.iflag.norcap {
                return Ok(-1);
            }
            let cap = pt_capacity(input, "in").map_err(|e| {
                match &e {
                    CopyError::InvalidOp(_) => {
                        warn!("read capacity not supported on {}", op.inf)
                    }
                    CopyError::NotReady(_) => {
                        warn!("read capacity failed on {} - not ready", op.inf)
                    }
                    _ => warn!("Unable to read capacity on {}", op.inf),
                }
                e
            })?;
            log_blk_sizes(&op.inf, "pt", cap.num_blocks, cap.block_size);
            if cap.num_blocks > 0 && cap.block_size != op.ibs {
                warn!(
                    ">> warning: {} block size confusion: ibs={}, device claims={}",
                    op.inf, op.ibs, cap.block_size
                );
                if !op.iflag.force {
                    return Err(CopyError::other(
                        ">> abort copy, use iflag=force to override",
                    ));
                }
            }
            op.rdprot_typ = cap.prot_type;
            op.rdp_i_exp = cap.p_i_exp;
            Ok(cap.num_blocks)
        }
        _ if op.dd_count > 0 && !op.oflag.resume => Ok(-1),
        FileKind::Block => {
            let file = input.stream.as_ref().and_then(|s| s.file());
            match file.and_then(blkdev_capacity) {
                None => {
                    warn!("Unable to read block capacity on {}", op.inf);
                    Ok(-1)
                }
                Some((num, sect_sz)) => {
                    log_blk_sizes(&op.inf, "blk", num, sect_sz);
                    if num > 0 && op.ibs != sect_sz {
                        warn!(
                            ">> warning: {} block size confusion: bs={}, device claims={}",
                            op.inf, op.ibs, sect_sz
                        );
                        Ok(-1)
                    } else {
                        Ok(num)
                    }
                }
            }
        }
        FileKind::Regular => {
            let md = input
                .stream
                .as_ref()
                .and_then(|s| s.file())
                .and_then(|f| f.metadata().ok());
            match md {
                None => Ok(-1),
                Some(md) => {
                    let mut num = md.len() as i64 / op.ibs as i64;
                    let res = md.len() as i64 % op.ibs as i64;
                    log_blk_sizes(&op.inf, "reg", num, op.ibs);
                    if res != 0 {
                        debug!("    residual_bytes={}", res);
                        num += 1;
                    }
                    Ok(num)
                }
            }
        }
        _ => Ok(-1),
    }
}

/// Attempt to size OFILE in output blocks. Returns -1 when unknown.
fn calc_count_out(op: &mut Opts, output: &mut Side) -> Result<i64> {
    match output.kind {
        FileKind::Passthrough => {
            if op.oflag.norcap {
                return Ok(-1);
            }
            let cap = pt_capacity(output, "out").map_err(|e| {
                match &e {
                    CopyError::InvalidOp(_) => {
                        warn!("read capacity not supported on {}", op.outf)
                    }
                    _ => warn!("Unable to read capacity on {}", op.outf),
                }
                e
            })?;
            log_blk_sizes(&op.outf, "pt", cap.num_blocks, cap.block_size);
            if cap.num_blocks > 0 && cap.block_size != op.obs {
                warn!(
                    ">> warning: {} block size confusion: obs={}, device claims={}",
                    op.outf, op.obs, cap.block_size
                );
                if !op.oflag.force {
                    return Err(CopyError::other(
                        ">> abort copy, use oflag=force to override",
                    ));
                }
            }
            op.wrprot_typ = cap.prot_type;
            op.wrp_i_exp = cap.p_i_exp;
            Ok(cap.num_blocks)
        }
        _ if op.dd_count > 0 && !op.oflag.resume => Ok(-1),
        FileKind::Block => {
            let file = output.stream.as_ref().and_then(|s| s.file());
            match file.and_then(blkdev_capacity) {
                None => {
                    warn!("Unable to read block capacity on {}", op.outf);
                    Ok(-1)
                }
                Some((num, sect_sz)) => {
                    log_blk_sizes(&op.outf, "blk", num, sect_sz);
                    if num > 0 && op.obs != sect_sz {
                        warn!(
                            ">> warning: {} block size confusion: obs={}, device claims={}",
                            op.outf, op.obs, sect_sz
                        );
                        Ok(-1)
                    } else {
                        Ok(num)
                    }
                }
            }
        }
        FileKind::Regular => {
            let md = output
                .stream
                .as_ref()
                .and_then(|s| s.file())
                .and_then(|f| f.metadata().ok());
            match md {
                None => Ok(-1),
                Some(md) => {
                    let mut num = md.len() as i64 / op.obs as i64;
                    let res = md.len() as i64 % op.obs as i64;
                    log_blk_sizes(&op.outf, "reg", num, op.obs);
                    if res != 0 {
                        debug!("    residual_bytes={}", res);
                        num += 1;
                    }
                    Ok(num)
                }
            }
        }
        _ => Ok(-1),
    }
}

/// Look at IFILE and OFILE lengths and block sizes. If dd_count was not
/// given, deduce a value for it. With oflag=resume do the skip, seek and
/// dd_count adjustments.
pub fn count_calculate(
    op: &mut Opts,
    input: &mut Side,
    output: &mut Side,
    reading_fifo: bool,
) -> Result<CountOutcome> {
    let in_num_sect = calc_count_in(op, input)?;
    let out_num_sect = calc_count_out(op, output)?;
    if !op.oflag.resume && op.dd_count > 0 {
        return Ok(CountOutcome::Proceed);
    }
    debug!(
        "calc_count: in_num_sect={}, out_num_sect={}",
        in_num_sect, out_num_sect
    );
    if op.skip > 0 && input.kind == FileKind::Regular && op.skip > in_num_sect {
        op.dd_count = 0;
        return Err(CopyError::other(format!(
            "cannot skip to specified offset on {}",
            op.inf
        )));
    }

    let mut valid_resume = false;
    if op.oflag.resume {
        if output.kind == FileKind::Regular {
            if out_num_sect < 0 {
                warn!("resume cannot determine size of OFILE, ignore");
            } else {
                valid_resume = true;
            }
        } else {
            warn!("resume expects OFILE to be regular, ignore");
        }
    }
    if op.dd_count < 0 && !valid_resume {
        // scale both sizes back by skip and seek respectively
        let mut in_sect = in_num_sect;
        let mut out_sect = out_num_sect;
        if op.skip > 0 && in_sect > op.skip {
            in_sect -= op.skip;
        }
        if op.seek > 0 && out_sect > op.seek {
            out_sect -= op.seek;
        }
        if out_sect < 0 && in_sect > 0 {
            op.dd_count = in_sect;
        } else if reading_fifo && out_sect < 0 {
            // keep reading until EOF
        } else if out_sect < 0 && in_sect <= 0 {
            // both unknown
        } else {
            let ibytes = if in_sect > 0 {
                op.ibs as i64 * in_sect
            } else {
                0
            };
            let obytes = op.obs as i64 * out_sect;
            if ibytes == 0 {
                op.dd_count = obytes / op.ibs as i64;
            } else if ibytes > obytes && output.kind != FileKind::Regular {
                // a regular output can grow so only a device size limits
                op.dd_count = obytes / op.ibs as i64;
            } else {
                op.dd_count = in_sect;
            }
        }
    }
    if valid_resume {
        if op.dd_count < 0 {
            op.dd_count = in_num_sect - op.skip;
        }
        if out_num_sect <= op.seek {
            warn!("resume finds no previous copy, restarting");
        } else {
            let obytes = op.obs as i64 * (out_num_sect - op.seek);
            let mut ibk = obytes / op.ibs as i64;
            if ibk >= op.dd_count {
                eprintln!("resume finds copy complete, exiting");
                op.dd_count = 0;
                return Ok(CountOutcome::AlreadyComplete);
            }
            // align to a bpt multiple
            ibk = (ibk / op.bpt as i64) * op.bpt as i64;
            op.skip += ibk;
            op.seek += (ibk * op.ibs as i64) / op.obs as i64;
            op.dd_count -= ibk;
            eprintln!(
                "resume adjusting skip={}, seek={}, and count={}",
                op.skip, op.seek, op.dd_count
            );
        }
    }
    Ok(CountOutcome::Proceed)
}
