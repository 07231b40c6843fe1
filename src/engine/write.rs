//! Write phase of the copy loop: dispatch by output variant, the secondary
//! output, the subdivided sparse/sparing committer and the end-of-copy
//! sparse cleanup.

use super::read::is_medium_errno;
use super::sparse::{plan_chunk, SegOp};
use super::state::CopyState;
use super::CopyEngine;
use crate::error::{CopyError, Result};
use crate::fileio::{retry_intr, FileKind};
use crate::pt::PtStatus;
use tracing::{debug, trace};

impl CopyEngine {
    /// Write `(ocbpt*obs + partial_write_bytes)` bytes to OFILE2, looping
    /// for a fifo until everything is sent. Failure here is fatal to the
    /// iteration.
    pub(super) fn cp_write_of2(&mut self, csp: &mut CopyState) -> Result<()> {
        let numbytes = (csp.ocbpt * self.op.obs + csp.partial_write_bytes) as usize;
        let CopyEngine {
            op,
            stats,
            output2,
            wrk,
            ..
        } = self;
        let side = output2.as_mut().expect("of2 side");
        let is_fifo = side.kind == FileKind::Fifo;
        let stream = side.stream.as_mut().expect("of2 stream");
        let buf = &wrk.slice()[..numbytes];

        // write to a fifo is non-atomic so loop while making progress
        let mut off = 0usize;
        let mut part = false;
        let mut last;
        loop {
            let r = retry_intr(&mut stats.interrupted_retries, || stream.write(&buf[off..]));
            if let Ok(n) = &r {
                if *n > 0 && *n < numbytes - off {
                    part = true;
                }
            }
            last = r;
            if is_fifo {
                if let Ok(n) = &last {
                    if *n > 0 {
                        off += *n;
                        if off < numbytes {
                            continue;
                        }
                    }
                }
            }
            break;
        }
        let res = if off >= numbytes && (is_fifo || numbytes == 0) {
            if part {
                debug!("write to of2 splintered");
            }
            Ok(numbytes)
        } else {
            if off > 0 {
                eprintln!(
                    "write to of2 fifo problem: count={}, off={}, res={:?}",
                    numbytes, off, last
                );
            }
            last
        };
        match res {
            Err(e) => Err(CopyError::other(format!(
                "writing to of2, seek={} : {}",
                op.seek, e
            ))),
            Ok(n) => {
                trace!("write to of2: count={}, res={}", numbytes, n);
                csp.bytes_of2 = n as i32;
                Ok(())
            }
        }
    }

    /// Write `blks` output blocks through the pass-through port at
    /// `seek + seek_delta`. When this write carries the chunk's tail, a
    /// residual is either padded out to a whole block (oflag=pad) or
    /// dropped with a warning.
    pub(super) fn cp_write_pt(
        &mut self,
        csp: &mut CopyState,
        seek_delta: i64,
        blks: i32,
        src_off: usize,
        include_tail: bool,
    ) -> Result<()> {
        if self.op.oflag.nowrite {
            return Ok(());
        }
        let aseek = self.op.seek + seek_delta;
        let obs = self.op.obs;
        let mut blks = blks;
        let mut numbytes = (blks * obs) as usize;
        if csp.partial_write_bytes > 0 && include_tail {
            if self.op.oflag.pad {
                numbytes += csp.partial_write_bytes as usize;
                csp.ocbpt += 1;
                blks += 1;
                let padded = (blks * obs) as usize;
                if padded > numbytes {
                    self.wrk.slice_mut()[src_off + numbytes..src_off + padded].fill(0);
                }
                numbytes = padded;
                debug!("pt_write: padding probable final write at seek={}", aseek);
            } else {
                eprintln!(
                    ">>> ignore partial write of {} bytes to pt (unless oflag=pad given)",
                    csp.partial_write_bytes
                );
            }
        }
        let CopyEngine {
            op,
            stats,
            output,
            wrk,
            ..
        } = self;
        let port = output
            .pt
            .as_mut()
            .ok_or_else(|| CopyError::other("pass-through output has no port"))?;
        let buf = &wrk.slice()[src_off..src_off + numbytes];
        let mut tries = 0;
        let status = loop {
            let status = port.write(aseek, blks, buf)?;
            match status {
                PtStatus::UnitAttention | PtStatus::Aborted if tries < op.oflag.retries => {
                    tries += 1;
                    stats.num_retries += 1;
                }
                _ => break status,
            }
        };
        if status != PtStatus::Good {
            return Err(status.into_error(&format!(
                "pt_write failed,{} seek={}",
                if status == PtStatus::TransferTooLarge {
                    " try reducing bpt,"
                } else {
                    ""
                },
                aseek
            )));
        }
        stats.out_full += blks as i64;
        Ok(())
    }

    /// Tape write: exact byte count. With nopad a residual becomes its own
    /// counted partial record, otherwise it is zero-padded to a whole
    /// block. On ENOSPC with ignoreew the write is retried once (early
    /// warning EOM); a second consecutive ENOSPC is a fatal medium-full.
    pub(super) fn cp_write_tape(&mut self, csp: &mut CopyState, could_be_last: bool) -> Result<()> {
        if self.op.oflag.nowrite {
            return Ok(());
        }
        let obs = self.op.obs;
        let aseek = self.op.seek;
        let mut blks = csp.ocbpt;
        let mut numbytes = (blks * obs) as usize;
        let mut partial = false;
        if csp.partial_write_bytes > 0 {
            partial = true;
            numbytes += csp.partial_write_bytes as usize;
            if self.op.oflag.nopad {
                self.stats.out_partial += 1;
            } else {
                csp.ocbpt += 1;
                blks += 1;
                let padded = (blks * obs) as usize;
                if padded > numbytes {
                    self.wrk.slice_mut()[numbytes..padded].fill(0);
                }
                numbytes = padded;
            }
        }

        let mut got_early_warning = false;
        let res = loop {
            let r = {
                let CopyEngine {
                    output, stats, wrk, ..
                } = self;
                let stream = output.stream.as_mut().expect("output stream");
                let buf = &wrk.slice()[..numbytes];
                retry_intr(&mut stats.interrupted_retries, || stream.write(buf))
            };
            if self.op.verbose > 2 || (self.op.verbose > 0 && could_be_last) {
                let cp = if !self.op.oflag.nopad && partial {
                    ", padded"
                } else {
                    ""
                };
                debug!(
                    "write(tape{}{}): requested bytes={}, res={:?}",
                    if partial { ", partial" } else { "" },
                    cp,
                    numbytes,
                    r
                );
            }
            // The st driver reports end-of-medium early warning as ENOSPC
            // while still accepting further writes; with ignoreew retry
            // once per write, bailing out on two ENOSPC in a row.
            match &r {
                Err(e)
                    if self.op.oflag.ignoreew
                        && !got_early_warning
                        && e.raw_os_error() == Some(libc::ENOSPC) =>
                {
                    got_early_warning = true;
                    if !self.printed_ew_message {
                        debug!("writing, seek={} : EOM early warning, continuing...", aseek);
                        if self.op.verbose == 2 {
                            debug!("(suppressing further early warning messages)");
                            self.printed_ew_message = true;
                        }
                    }
                }
                _ => break r,
            }
        };
        match res {
            Err(e) => {
                let msg = format!("writing, seek={} : {}", aseek, e);
                if is_medium_errno(&e) {
                    Err(CopyError::medium(msg))
                } else {
                    Err(CopyError::other(msg))
                }
            }
            Ok(n) if n < numbytes => {
                eprintln!("write(tape): wrote less than requested, exit");
                csp.of_filepos += n as i64;
                csp.bytes_of = n as i32;
                self.stats.out_full += (n as i32 / obs) as i64;
                // a short write can leave a partial record
                if n as i32 % obs > 0 {
                    self.stats.out_partial += 1;
                    self.stats.out_full += 1;
                }
                Err(CopyError::other("write(tape): wrote less than requested"))
            }
            Ok(_) => {
                csp.of_filepos += numbytes as i64;
                csp.bytes_of = numbytes as i32;
                self.stats.out_full += blks as i64;
                Ok(())
            }
        }
    }

    /// Write for a block device, regular file or fifo: pad or carry the
    /// tail residual, lazy seek, then write (looping for fifos while they
    /// make progress). A short write means the output is full.
    pub(super) fn cp_write_block_reg(
        &mut self,
        csp: &mut CopyState,
        seek_delta: i64,
        blks: i32,
        src_off: usize,
        include_tail: bool,
    ) -> Result<()> {
        if self.op.oflag.nowrite {
            return Ok(());
        }
        let obs = self.op.obs_pi;
        let aseek = self.op.seek + seek_delta;
        let offset = aseek * obs as i64;
        let out_kind = self.output.kind;
        let mut blks = blks;
        let mut numbytes = (blks * obs) as usize;

        if csp.partial_write_bytes > 0 && include_tail {
            if self.op.oflag.pad {
                numbytes += csp.partial_write_bytes as usize;
                csp.ocbpt += 1;
                blks += 1;
                let padded = (blks * obs) as usize;
                if padded > numbytes {
                    self.wrk.slice_mut()[src_off + numbytes..src_off + padded].fill(0);
                }
                numbytes = padded;
                debug!("write(unix): padding probable final write at seek={}", aseek);
            } else if out_kind == FileKind::Block {
                eprintln!(
                    ">>> ignore partial write of {} bytes to block device",
                    csp.partial_write_bytes
                );
            } else {
                numbytes += csp.partial_write_bytes as usize;
                self.stats.out_partial += 1;
            }
        }
        if offset != csp.of_filepos && !csp.tape_short_read {
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

        let res = {
            let CopyEngine {
                output, stats, wrk, ..
            } = self;
            let stream = output.stream.as_mut().expect("output stream");
            let buf = &wrk.slice()[src_off..src_off + numbytes];
            let is_fifo = out_kind == FileKind::Fifo;

            // write to a fifo is non-atomic so loop while making progress
            let mut off = 0usize;
            let mut part = false;
            let mut last;
            loop {
                let r =
                    retry_intr(&mut stats.interrupted_retries, || stream.write(&buf[off..]));
                if let Ok(n) = &r {
                    if *n > 0 && *n < numbytes - off {
                        part = true;
                    }
                }
                last = r;
                if is_fifo {
                    if let Ok(n) = &last {
                        if *n > 0 {
                            off += *n;
                            if off < numbytes {
                                continue;
                            }
                        }
                    }
                }
                break;
            }
            if off >= numbytes && (is_fifo || numbytes == 0) {
                if part {
                    debug!("write to output file splintered");
                }
                Ok(numbytes)
            } else {
                if off > 0 {
                    eprintln!(
                        "write to of fifo problem: count={}, off={}, res={:?}",
                        numbytes, off, last
                    );
                }
                if off == 0 {
                    trace!("write(unix): requested bytes={}, res={:?}", numbytes, last);
                }
                last
            }
        };
        match res {
            Err(e) => {
                let msg = format!("writing, seek={} : {}", aseek, e);
                if is_medium_errno(&e) {
                    Err(CopyError::medium(msg))
                } else {
                    Err(CopyError::other(msg))
                }
            }
            Ok(n) if n < numbytes => {
                eprintln!("output file probably full, seek={}", aseek);
                csp.of_filepos += n as i64;
                csp.bytes_of = n as i32;
                self.stats.out_full += (n as i32 / obs) as i64;
                // a short write can leave a partial record
                if n as i32 % obs > 0 {
                    self.stats.out_partial += 1;
                    self.stats.out_full += 1;
                }
                Err(CopyError::other(format!(
                    "output file probably full, seek={}",
                    aseek
                )))
            }
            Ok(_) => {
                csp.of_filepos += numbytes as i64;
                csp.bytes_of = numbytes as i32;
                self.stats.out_full += blks as i64;
                Ok(())
            }
        }
    }

    /// Subdivided comparison and write for all output types: compare the
    /// chunk against `use_zeros` (sparse) or the read-back output
    /// (sparing) in obpc-block units, write the differing runs and trim
    /// the zero runs when that is enabled. Trim errors are counted and the
    /// copy continues.
    pub(super) fn cp_finer_comp_wr(&mut self, csp: &mut CopyState, use_zeros: bool) -> Result<()> {
        let oblks = csp.ocbpt;
        let obs = self.op.obs;
        let out_kind = self.output.kind;
        if self.op.obpc >= oblks {
            // treat the whole chunk atomically
            match out_kind {
                FileKind::DevNull => (),
                FileKind::Passthrough => {
                    self.cp_write_pt(csp, 0, oblks, 0, true)?;
                }
                _ => self.cp_write_block_reg(csp, 0, oblks, 0, true)?,
            }
            return Ok(());
        }
        let mut numbytes = (oblks * obs) as usize;
        if out_kind == FileKind::Regular && csp.partial_write_bytes > 0 {
            numbytes += csp.partial_write_bytes as usize;
        }
        let chunk = (self.op.obpc * obs) as usize;
        let trim_check =
            self.op.oflag.sparse > 0 && self.op.oflag.wsame16 && out_kind == FileKind::Passthrough;

        let plan = {
            let CopyEngine {
                wrk, wrk2, zeros, ..
            } = self;
            let data = &wrk.slice()[..numbytes];
            let reference: &[u8] = if use_zeros {
                &zeros[..numbytes]
            } else {
                &wrk2.as_ref().expect("sparing buffer").slice()[..numbytes]
            };
            plan_chunk(data, reference, chunk, obs as usize, trim_check)
        };
        self.stats.out_sparse += plan.sparse_blocks;

        for segop in plan.ops {
            match segop {
                SegOp::Write { off, len } => {
                    // only the run reaching the end of the chunk carries the
                    // residual; the run length includes those bytes only for
                    // a regular output (they were part of the comparison)
                    let at_end = off + len == numbytes;
                    let include_tail = at_end && csp.partial_write_bytes > 0;
                    let whole_bytes = if include_tail && out_kind == FileKind::Regular {
                        len - csp.partial_write_bytes as usize
                    } else {
                        len
                    };
                    let whole = (whole_bytes / obs as usize) as i32;
                    let delta = (off / obs as usize) as i64;
                    match out_kind {
                        FileKind::DevNull => (),
                        FileKind::Passthrough => {
                            self.cp_write_pt(csp, delta, whole, off, include_tail)?;
                        }
                        _ => self.cp_write_block_reg(csp, delta, whole, off, include_tail)?,
                    }
                }
                SegOp::Trim { off, len } => {
                    let lba = self.op.seek + (off / obs as usize) as i64;
                    let blocks = (len / obs as usize) as i32;
                    let status = {
                        let CopyEngine { output, zeros, .. } = self;
                        let port = output.pt.as_mut().expect("pt output port");
                        port.write_same(lba, blocks, &zeros[..obs as usize])
                    };
                    // continue past trim errors
                    match status {
                        Ok(PtStatus::Good) => (),
                        _ => self.stats.trim_errs += 1,
                    }
                }
            }
        }
        Ok(())
    }

    /// Only for a regular OFILE with sparse writing: if the last blocks
    /// were bypassed the file may need its length pinned. With strunc the
    /// file is truncated down to the final offset; with sparse level 1 it
    /// is extended to the final offset so the trailing bypassed blocks
    /// remain holes; sparse levels above 1 leave the length alone.
    pub(super) fn cp_sparse_cleanup(&mut self, csp: &mut CopyState) {
        let offset = self.op.seek * self.op.obs as i64;
        let size = match self
            .output
            .stream
            .as_ref()
            .and_then(|s| s.file())
            .and_then(|f| f.metadata().ok())
        {
            Some(md) => md.len() as i64,
            None => {
                eprintln!("sparse cleanup: cannot fstat OFILE");
                return;
            }
        };
        if offset == size {
            debug!("sparse cleanup: OFILE already correct length");
            return;
        }
        if self.op.oflag.strunc {
            // shrink stale bytes past the copy, or pin the length when the
            // trailing blocks were bypassed
            if offset < size || offset > csp.of_filepos {
                debug!("about to truncate {} to byte offset {}", self.op.outf, offset);
                if let Some(f) = self.output.stream.as_ref().and_then(|s| s.file()) {
                    if let Err(e) = f.set_len(offset as u64) {
                        eprintln!("could not ftruncate after copy: {}", e);
                    }
                }
            }
        } else if offset > csp.of_filepos {
            if self.op.oflag.sparse == 1 {
                if offset > size {
                    debug!("pinning OFILE length to byte offset {}", offset);
                    if let Some(f) = self.output.stream.as_ref().and_then(|s| s.file()) {
                        if let Err(e) = f.set_len(offset as u64) {
                            eprintln!("could not extend OFILE after sparse copy: {}", e);
                        }
                    }
                } else {
                    debug!("sparse cleanup: OFILE longer than required, do nothing");
                }
            } else if self.op.oflag.sparse > 1 {
                debug!("asked to bypass pinning OFILE length");
            }
        }
    }
}
