//! Read phase of the copy loop: dispatch by input variant, the
//! continue-on-error fallback for block/regular inputs, and the tape read
//! rules.

use super::state::{CopyState, LeaveReason};
use super::CopyEngine;
use crate::error::{CopyError, Result};
use crate::fileio::{retry_intr, EREMOTEIO};
use crate::pt::PtStatus;
use std::io;
use tracing::{debug, trace};

pub(super) fn is_medium_errno(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(c) if c == libc::EIO || c == EREMOTEIO)
}

impl CopyEngine {
    /// Read via the pass-through port. Transient statuses are retried up to
    /// the configured budget. A short read never produces a partial output
    /// block; the output count is recomputed rounded down.
    pub(super) fn cp_read_pt(&mut self, csp: &mut CopyState) -> Result<()> {
        let nbytes = (csp.icbpt * self.op.ibs_pi) as usize;
        let CopyEngine {
            op,
            stats,
            input,
            wrk,
            err_to_report,
            ..
        } = self;
        let port = input
            .pt
            .as_mut()
            .ok_or_else(|| CopyError::other("pass-through input has no port"))?;
        let buf = &mut wrk.slice_mut()[..nbytes];
        let mut tries = 0;
        let r = loop {
            let r = port.read(op.skip, csp.icbpt, buf)?;
            match r.status {
                PtStatus::UnitAttention | PtStatus::Aborted if tries < op.iflag.retries => {
                    tries += 1;
                    stats.num_retries += 1;
                }
                _ => break r,
            }
        };
        stats.sum_of_resids += r.resid;
        if r.status != PtStatus::Good {
            let msg = format!(
                "pt_read failed,{} at or after lba={} [0x{:x}]",
                if r.status == PtStatus::TransferTooLarge {
                    " try reducing bpt,"
                } else {
                    ""
                },
                op.skip,
                op.skip
            );
            if r.blocks == 0 {
                return Err(r.status.into_error(&msg));
            }
            // limp on with the data we got; stop after the write and hold
            // the error for the exit status
            *err_to_report = Some(r.status.into_error(&msg));
        }
        if r.blocks < csp.icbpt {
            // assume close to the end, or some data prior to a read error
            debug!(
                "short read, requested {} blocks, got {} blocks",
                csp.icbpt, r.blocks
            );
            csp.leave_after_write = true;
            csp.icbpt = r.blocks;
            // round down since partial writes are not done from pt reads
            csp.ocbpt = (r.blocks * op.ibs) / op.obs;
        }
        stats.in_full += csp.icbpt as i64;
        Ok(())
    }

    /// Bookkeeping for an EIO-equivalent medium error: budget, range
    /// tracking, record accounting and the error-block journal.
    pub(super) fn coe_process_eio(&mut self, skip: i64) -> Result<()> {
        let CopyEngine {
            op, stats, errblk, ..
        } = self;
        if op.coe_limit > 0 {
            stats.coe.count += 1;
            if stats.coe.count > op.coe_limit {
                eprintln!(">> coe_limit on consecutive reads exceeded");
                return Err(CopyError::medium(
                    "coe_limit on consecutive reads exceeded",
                ));
            }
        }
        stats.coe.note_unrecovered(skip);
        stats.unrecovered_errs += 1;
        stats.in_partial += 1;
        stats.in_full -= 1;
        eprintln!(
            ">> unrecovered read error at blk={}, substitute zeros",
            skip
        );
        if let Some(j) = errblk.as_mut() {
            j.record(skip as u64);
        }
        Ok(())
    }

    /// An error or short result came back from the bulk block/regular read
    /// with coe active. Keep the full blocks already obtained, then read
    /// the rest of the chunk one block at a time, substituting zeros for
    /// unreadable blocks. `numread_errno` is the bulk read's byte count, or
    /// the negated errno when it failed outright.
    fn coe_read_block_reg(&mut self, csp: &mut CopyState, numread_errno: i32) -> Result<()> {
        let ibs = self.op.ibs_pi;
        if numread_errno == 0 {
            // EOF
            csp.icbpt = 0;
            csp.ocbpt = 0;
            csp.leave_after_write = true;
            csp.leave_reason = LeaveReason::Eof;
            return Ok(());
        }
        let num_read;
        if numread_errno < 0 {
            if -numread_errno == libc::EIO || -numread_errno == EREMOTEIO {
                num_read = 0;
                if csp.icbpt == 1 {
                    // a one block chunk: this must be the bad block
                    let skip = self.op.skip;
                    self.wrk.slice_mut()[..ibs as usize].fill(0);
                    self.coe_process_eio(skip)?;
                    self.stats.in_full += 1;
                    csp.bytes_read += ibs;
                    return Ok(());
                }
            } else {
                return Err(CopyError::other(format!(
                    "reading, skip={} : {}",
                    self.op.skip,
                    io::Error::from_raw_os_error(-numread_errno)
                )));
            }
        } else {
            num_read = (numread_errno / ibs) * ibs;
        }

        let mut k = num_read / ibs;
        if k > 0 {
            self.stats.in_full += k as i64;
            let coe_limit = self.op.coe_limit;
            self.stats.zero_coe_limit_count(coe_limit);
        }
        csp.bytes_read = num_read;
        let mut my_skip = self.op.skip + k as i64;
        let mut offset = my_skip * ibs as i64;
        let mut buf_off = num_read as usize;
        // Some(read length) ends the chunk early: EOF, a short read, or a
        // non-medium error already noted in csp.leave_reason.
        let mut short_res: Option<i32> = None;

        while k < csp.icbpt {
            if offset != csp.if_filepos {
                trace!("moving if filepos: new_pos={}", offset);
                let stream = self.input.stream.as_mut().expect("input stream");
                if let Err(e) = stream.seek_to(offset) {
                    return Err(CopyError::file(format!(
                        "failed moving if filepos: new_pos={} lseek on input: {}",
                        offset, e
                    )));
                }
                csp.if_filepos = offset;
            }
            let res = {
                let CopyEngine {
                    input, stats, wrk, ..
                } = self;
                let stream = input.stream.as_mut().expect("input stream");
                let block = &mut wrk.slice_mut()[buf_off..buf_off + ibs as usize];
                block.fill(0);
                retry_intr(&mut stats.interrupted_retries, || stream.read(block))
            };
            match res {
                Ok(0) => {
                    csp.leave_reason = LeaveReason::Eof;
                    short_res = Some(0);
                    break;
                }
                Err(e) if is_medium_errno(&e) => {
                    // zeros already in place for this block
                    self.coe_process_eio(my_skip)?;
                }
                Err(e) => {
                    eprintln!("reading 1 block, skip={} : {}", my_skip, e);
                    csp.leave_reason = LeaveReason::Other;
                    short_res = Some(0);
                    break;
                }
                Ok(n) if (n as i32) < ibs => {
                    debug!(
                        "short read at skip={} , wanted={}, got={} bytes",
                        my_skip, ibs, n
                    );
                    // assume EOF
                    csp.leave_reason = LeaveReason::Eof;
                    short_res = Some(n as i32);
                    break;
                }
                Ok(_) => {
                    let coe_limit = self.op.coe_limit;
                    self.stats.zero_coe_limit_count(coe_limit);
                    csp.if_filepos += ibs as i64;
                    trace!("reading 1 block, skip={} : okay", my_skip);
                }
            }
            self.stats.in_full += 1;
            csp.bytes_read += ibs;
            k += 1;
            my_skip += 1;
            buf_off += ibs as usize;
            offset += ibs as i64;
        }

        if let Some(res) = short_res {
            let total_read = ibs * k + res.max(0);
            csp.icbpt = total_read / ibs;
            if total_read % ibs > 0 {
                csp.icbpt += 1;
                self.stats.in_partial += 1;
            }
            csp.ocbpt = total_read / self.op.obs;
            csp.leave_after_write = true;
            if csp.leave_reason == LeaveReason::Eof {
                csp.partial_write_bytes = total_read % self.op.obs;
            } else if total_read % self.op.obs > 0 {
                // a short read that is not EOF implies partial writes
                csp.ocbpt += 1;
            }
        }
        Ok(())
    }

    /// Read for a block device or regular file. Lazy seek, one bulk read,
    /// then either the coe fallback or the short-read/EOF handling with a
    /// probe for a lurking medium error.
    pub(super) fn cp_read_block_reg(&mut self, csp: &mut CopyState) -> Result<()> {
        let ibs = self.op.ibs_pi;
        let offset = self.op.skip * ibs as i64;
        let numbytes = (csp.icbpt * ibs) as usize;

        if offset != csp.if_filepos {
            trace!("moving if filepos: new_pos={}", offset);
            let stream = self.input.stream.as_mut().expect("input stream");
            if let Err(e) = stream.seek_to(offset) {
                return Err(CopyError::file(format!(
                    "failed moving if filepos: new_pos={} lseek on input: {}",
                    offset, e
                )));
            }
            csp.if_filepos = offset;
        }

        let res = {
            let CopyEngine {
                input, stats, wrk, ..
            } = self;
            let stream = input.stream.as_mut().expect("input stream");
            let buf = &mut wrk.slice_mut()[..numbytes];
            retry_intr(&mut stats.interrupted_retries, || stream.read(buf))
        };
        trace!("read(unix): requested bytes={}, res={:?}", numbytes, res);

        let short_or_err = match &res {
            Ok(n) => *n < numbytes,
            Err(_) => true,
        };
        if self.op.iflag.coe > 0 && short_or_err {
            let res2 = match &res {
                Ok(n) => *n as i32,
                Err(e) => -e.raw_os_error().unwrap_or(libc::EIO),
            };
            match &res {
                Err(e) => debug!("reading, skip={} : {}, go to coe", self.op.skip, e),
                Ok(_) => debug!("reading, skip={} : short read, go to coe", self.op.skip),
            }
            if res2 > 0 {
                csp.if_filepos += res2 as i64;
            }
            return self.coe_read_block_reg(csp, res2);
        }

        let res = match res {
            Err(e) => {
                let msg = format!("reading, skip={} : {}", self.op.skip, e);
                return if is_medium_errno(&e) {
                    Err(CopyError::medium(msg))
                } else {
                    Err(CopyError::other(msg))
                };
            }
            Ok(n) => n as i32,
        };
        if res < numbytes as i32 {
            csp.icbpt = res / ibs;
            if res % ibs > 0 {
                csp.icbpt += 1;
                self.stats.in_partial += 1;
                self.stats.in_full -= 1;
            }
            csp.ocbpt = res / self.op.obs;
            csp.leave_after_write = true;
            // fall through is assumed EOF
            csp.leave_reason = LeaveReason::Eof;
            debug!(
                "short read, requested {} bytes, got {} bytes",
                numbytes, res
            );
            let mut res2 = 0;
            if res >= ibs && res <= numbytes as i32 - ibs {
                // check for an EIO lurking right after the short read
                let probe = {
                    let CopyEngine {
                        input, stats, wrk, ..
                    } = self;
                    let stream = input.stream.as_mut().expect("input stream");
                    let buf =
                        &mut wrk.slice_mut()[res as usize..res as usize + ibs as usize];
                    retry_intr(&mut stats.interrupted_retries, || stream.read(buf))
                };
                match probe {
                    Err(e) => {
                        if is_medium_errno(&e) {
                            csp.leave_reason = LeaveReason::MediumHard;
                            self.stats.unrecovered_errs += 1;
                        } else {
                            csp.leave_reason = LeaveReason::Other;
                        }
                        debug!(
                            "after short read, read at skip={}: {}",
                            self.op.skip + csp.icbpt as i64,
                            e
                        );
                    }
                    Ok(n) => {
                        // expect 0, indicating EOF
                        csp.if_filepos += n as i64;
                        res2 = n as i32;
                        debug!("extra read after short read, res={}", n);
                    }
                }
            }
            if csp.leave_reason == LeaveReason::Eof {
                // at EOF, allow for a partial write
                csp.partial_write_bytes = (res + res2) % self.op.obs;
            } else if res % self.op.obs > 0 {
                // extra bytes bump the output block count
                csp.ocbpt += 1;
            }
        }
        csp.if_filepos += res as i64;
        csp.bytes_read = res;
        self.stats.in_full += csp.icbpt as i64;
        Ok(())
    }

    /// Tape read: exactly the requested byte count, with the oversize-block
    /// ENOMEM translation and the consecutive same-length read summary. A
    /// short read is normal mid-stream and only marks the iteration.
    pub(super) fn cp_read_tape(&mut self, csp: &mut CopyState) -> Result<()> {
        let num = csp.icbpt * self.op.ibs;
        self.stats.read_tape_numbytes = num;

        let res = {
            let CopyEngine {
                input, stats, wrk, ..
            } = self;
            let stream = input.stream.as_mut().expect("input stream");
            let buf = &mut wrk.slice_mut()[..num as usize];
            retry_intr(&mut stats.interrupted_retries, || stream.read(buf))
        };

        let res_i32 = match &res {
            Ok(n) => *n as i32,
            Err(_) => -1,
        };
        self.stats.print_tape_summary(res_i32, "", self.op.verbose);
        trace!(
            "read(tape{}): requested bytes={}, res={}",
            if res_i32 >= num || res_i32 < 0 { "" } else { ", short" },
            num,
            res_i32
        );

        let res = match res {
            Err(e) => {
                // A tape block larger than the requested read length makes
                // the st driver return ENOMEM; translate so the message is
                // not a baffling "Cannot allocate memory".
                let desc = if e.raw_os_error() == Some(libc::ENOMEM) {
                    "Tape block larger than requested read length".to_string()
                } else {
                    e.to_string()
                };
                let msg = format!("reading, skip={} : {}", self.op.skip, desc);
                // keep print_stats from emitting a stale summary
                self.stats.last_tape_read_len = 0;
                return if is_medium_errno(&e) {
                    Err(CopyError::medium(msg))
                } else {
                    Err(CopyError::other(msg))
                };
            }
            Ok(n) => n as i32,
        };

        if self.op.verbose > 1 {
            if res == self.stats.last_tape_read_len {
                self.stats.consec_same_len_reads += 1;
            } else {
                self.stats.last_tape_read_len = res;
                self.stats.consec_same_len_reads = 1;
            }
        }
        if res < num {
            csp.icbpt = res / self.op.ibs;
            if res % self.op.ibs > 0 {
                csp.icbpt += 1;
                self.stats.in_partial += 1;
                self.stats.in_full -= 1;
            }
            csp.ocbpt = res / self.op.obs;
            csp.leave_after_write = true;
            csp.tape_short_read = true;
            csp.partial_write_bytes = res % self.op.obs;
            if self.op.verbose == 2 && self.stats.consec_same_len_reads == 1 {
                debug!(
                    "short read: requested {} bytes, got {}",
                    self.stats.read_tape_numbytes, res
                );
            }
        }
        csp.if_filepos += res as i64;
        csp.bytes_read = res;
        self.stats.in_full += csp.icbpt as i64;
        Ok(())
    }

    /// Fifo read: never seek, gather bytes until the chunk is full or EOF.
    pub(super) fn cp_read_fifo(&mut self, csp: &mut CopyState) -> Result<()> {
        let offset = self.op.skip * self.op.ibs as i64;
        if offset != csp.if_filepos {
            trace!("fifo: _not_ moving IFILE filepos to {}", offset);
            csp.if_filepos = offset;
        }
        let numbytes = (csp.icbpt * self.op.ibs) as usize;
        let mut k = 0usize;
        while k < numbytes {
            let res = {
                let CopyEngine {
                    input, stats, wrk, ..
                } = self;
                let stream = input.stream.as_mut().expect("input stream");
                let buf = &mut wrk.slice_mut()[k..numbytes];
                retry_intr(&mut stats.interrupted_retries, || stream.read(buf))
            };
            trace!("read(fifo): requested bytes={}, res={:?}", numbytes, res);
            match res {
                Err(e) => {
                    return Err(CopyError::other(format!(
                        "read(fifo), skip={} : {}",
                        self.op.skip, e
                    )));
                }
                Ok(0) => {
                    csp.icbpt = (k as i32) / self.op.ibs;
                    if (k as i32) % self.op.ibs > 0 {
                        csp.icbpt += 1;
                        self.stats.in_partial += 1;
                        self.stats.in_full -= 1;
                    }
                    csp.ocbpt = (k as i32) / self.op.obs;
                    csp.leave_after_write = true;
                    csp.leave_reason = LeaveReason::Eof;
                    csp.partial_write_bytes = (k as i32) % self.op.obs;
                    break;
                }
                Ok(n) => k += n,
            }
        }
        csp.if_filepos += k as i64;
        csp.bytes_read = k as i32;
        self.stats.in_full += csp.icbpt as i64;
        Ok(())
    }

    /// Sparing support: read the chunk's existing content back from a
    /// pass-through output.
    pub(super) fn cp_read_of_pt(&mut self, csp: &mut CopyState) -> Result<()> {
        let nbytes = (csp.ocbpt * self.op.obs_pi) as usize;
        let CopyEngine {
            op, stats, output, wrk2, ..
        } = self;
        let port = output
            .pt
            .as_mut()
            .ok_or_else(|| CopyError::other("pass-through output has no port"))?;
        let buf = &mut wrk2.as_mut().expect("sparing buffer").slice_mut()[..nbytes];
        let mut tries = 0;
        let r = loop {
            let r = port.read(op.seek, csp.ocbpt, buf)?;
            match r.status {
                PtStatus::UnitAttention | PtStatus::Aborted if tries < op.oflag.retries => {
                    tries += 1;
                    stats.num_retries += 1;
                }
                _ => break r,
            }
        };
        if r.status != PtStatus::Good {
            return Err(r.status.into_error(&format!(
                "pt_read(sparing) failed, at or after lba={} [0x{:x}]",
                op.seek, op.seek
            )));
        }
        if r.blocks != csp.ocbpt {
            return Err(CopyError::other(format!(
                "pt_read(sparing) short, at or after lba={}",
                op.seek
            )));
        }
        Ok(())
    }

    /// Sparing support: read the chunk's existing content back from a block
    /// device or regular file output.
    pub(super) fn cp_read_of_block_reg(&mut self, csp: &mut CopyState) -> Result<()> {
        let obs = self.op.obs;
        let offset = self.op.seek * obs as i64;
        let mut numbytes = (csp.ocbpt * obs) as usize;

        if offset != csp.of_filepos {
            trace!("moving of filepos: new_pos={}", offset);
            let stream = self.output.stream.as_mut().expect("output stream");
            if let Err(e) = stream.seek_to(offset) {
                return Err(CopyError::file(format!(
                    "failed moving of filepos: new_pos={} lseek on output: {}",
                    offset, e
                )));
            }
            csp.of_filepos = offset;
        }
        if csp.partial_write_bytes > 0 {
            numbytes += csp.partial_write_bytes as usize;
            debug!(
                "read(sparing): {} bytes extra to fetch due to partial read",
                csp.partial_write_bytes
            );
        }
        let res = {
            let CopyEngine {
                output, stats, wrk2, ..
            } = self;
            let stream = output.stream.as_mut().expect("output stream");
            let buf = &mut wrk2.as_mut().expect("sparing buffer").slice_mut()[..numbytes];
            retry_intr(&mut stats.interrupted_retries, || stream.read(buf))
        };
        trace!("read(sparing): requested bytes={}, res={:?}", numbytes, res);
        match res {
            Err(e) => Err(CopyError::other(format!(
                "read(sparing), seek={} : {}",
                self.op.seek, e
            ))),
            Ok(n) if n == numbytes => {
                csp.of_filepos += numbytes as i64;
                Ok(())
            }
            Ok(_) => Err(CopyError::other("read(sparing): short read")),
        }
    }
}
