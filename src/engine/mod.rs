//! The copy engine: per-chunk read/transform/compare/write loop and its
//! surrounding setup and teardown.

mod read;
pub mod sparse;
mod state;
mod write;

pub use state::{CopyState, LeaveReason};

use crate::errblk::ErrblkJournal;
use crate::error::{CopyError, Result};
use crate::fileio::{self, FileKind, Side};
use crate::options::Opts;
use crate::planner::{count_calculate, CountOutcome};
use crate::pt::PtStatus;
use crate::signals::{signal_name, SignalEvent, SignalGate};
use crate::stats::{print_throughput, Stats, ThroughputCtx};
use tracing::{debug, info, trace, warn};

/// Work buffer, page-aligned when direct IO is in play.
pub(crate) struct AlignedBuf {
    buf: Vec<u8>,
    off: usize,
    len: usize,
}

impl AlignedBuf {
    fn new(len: usize, aligned: bool) -> AlignedBuf {
        if aligned {
            let psz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            let psz = if psz > 0 { psz as usize } else { 4096 };
            let buf = vec![0u8; len + psz];
            let addr = buf.as_ptr() as usize;
            let off = (psz - (addr % psz)) % psz;
            AlignedBuf { buf, off, len }
        } else {
            AlignedBuf {
                buf: vec![0u8; len],
                off: 0,
                len,
            }
        }
    }

    pub(crate) fn slice(&self) -> &[u8] {
        &self.buf[self.off..self.off + self.len]
    }

    pub(crate) fn slice_mut(&mut self) -> &mut [u8] {
        let (off, len) = (self.off, self.len);
        &mut self.buf[off..off + len]
    }
}

pub struct CopyEngine {
    pub op: Opts,
    pub stats: Stats,
    pub(crate) input: Side,
    pub(crate) output: Side,
    pub(crate) output2: Option<Side>,
    pub(crate) errblk: Option<ErrblkJournal>,
    pub(crate) gate: SignalGate,
    pub(crate) wrk: AlignedBuf,
    pub(crate) wrk2: Option<AlignedBuf>,
    pub(crate) zeros: Vec<u8>,
    pub(crate) reading_fifo: bool,
    pub(crate) read1_or_transfer: bool,
    pub(crate) out_type_hold: FileKind,
    pub(crate) lowest_skip: i64,
    pub(crate) lowest_seek: i64,
    pub(crate) err_to_report: Option<CopyError>,
    pub(crate) printed_ew_message: bool,
    pub(crate) skip_copy: bool,
}

impl CopyEngine {
    /// Validate the sides against the options, run the count planner and
    /// get the buffers ready. After this everything is in place for
    /// [`execute`](Self::execute).
    pub fn new(
        mut op: Opts,
        mut input: Side,
        mut output: Side,
        output2: Option<Side>,
    ) -> Result<CopyEngine> {
        let reading_fifo = matches!(
            input.kind,
            FileKind::Fifo | FileKind::Char | FileKind::Tape
        );
        if input.kind == FileKind::Passthrough && input.pt.is_none() {
            return Err(CopyError::invalid_op(format!(
                "no pass-through transport available for {}",
                op.inf
            )));
        }
        if output.kind == FileKind::Passthrough && output.pt.is_none() {
            return Err(CopyError::invalid_op(format!(
                "no pass-through transport available for {}",
                op.outf
            )));
        }
        let out_type_hold = output.kind;

        // Reading from or writing to tape defaults bpt to 1, avoiding
        // accidental use of the wrong tape block size.
        if !op.bpt_given
            && (input.kind == FileKind::Tape || output.kind == FileKind::Tape)
        {
            op.bpt = 1;
        }

        if op.iflag.sparse > 0 && op.oflag.sparse == 0 {
            if output.kind == FileKind::DevNull {
                warn!("sparse flag usually ignored on input; set it on output in this case");
                op.oflag.sparse += 1;
            } else {
                warn!("sparse flag ignored on input");
            }
        }
        let mut stats = Stats::default();
        if op.oflag.sparse > 0 {
            if matches!(output.kind, FileKind::Fifo | FileKind::Tape) {
                warn!("oflag=sparse needs seekable output file, ignore");
                op.oflag.sparse = 0;
            } else {
                stats.out_sparse_active = true;
                if op.oflag.wsame16 {
                    stats.out_trim_active = true;
                }
            }
        }
        if op.oflag.sparing {
            if matches!(
                output.kind,
                FileKind::DevNull | FileKind::Fifo | FileKind::Tape
            ) {
                warn!("oflag=sparing needs a readable and seekable output file, ignore");
                op.oflag.sparing = false;
            } else {
                stats.out_sparing_active = true;
            }
        }

        let skip_copy = match count_calculate(&mut op, &mut input, &mut output, reading_fifo)? {
            CountOutcome::Proceed => false,
            CountOutcome::AlreadyComplete => true,
        };

        // Protection information setup; each protect flag widens both
        // effective block sizes by its protection interval.
        op.ibs_pi = op.ibs;
        op.obs_pi = op.obs;
        if op.rdprotect > 0 {
            if op.rdprot_typ == 0 || input.kind != FileKind::Passthrough {
                return Err(CopyError::other(
                    "IFILE is not a pt device or doesn't have protection information",
                ));
            }
            if op.ibs != op.obs {
                return Err(CopyError::other(
                    "protect: don't support IFILE and OFILE with different block sizes",
                ));
            }
            if op.wrprotect > 0 && op.rdp_i_exp != op.wrp_i_exp {
                return Err(CopyError::other(
                    "Don't support IFILE and OFILE with different P_I_EXP fields",
                ));
            }
            let pi = (if op.rdp_i_exp > 0 { 1 << op.rdp_i_exp } else { 1 }) * 8;
            op.ibs_pi += pi;
            op.obs_pi += pi;
        }
        if op.wrprotect > 0 {
            if op.wrprot_typ == 0 || output.kind != FileKind::Passthrough {
                return Err(CopyError::other(
                    "OFILE is not a pt device or doesn't have protection information",
                ));
            }
            if op.ibs != op.obs {
                return Err(CopyError::other(
                    "protect: don't support IFILE and OFILE with different block sizes",
                ));
            }
            let pi = (if op.wrp_i_exp > 0 { 1 << op.wrp_i_exp } else { 1 }) * 8;
            op.ibs_pi += pi;
            op.obs_pi += pi;
        }

        if op.dd_count < 0 && !reading_fifo {
            return Err(CopyError::other(
                "Couldn't calculate count, please give one",
            ));
        }
        if op.oflag.prealloc
            && matches!(
                output.kind,
                FileKind::DevNull | FileKind::Fifo | FileKind::Tape | FileKind::Passthrough
            )
        {
            warn!("oflag=pre-alloc needs a normal output file, ignore");
            op.oflag.prealloc = false;
        }
        if !op.cdbsz_given {
            if input.kind == FileKind::Passthrough
                && op.iflag.cdbsz < 16
                && (op.dd_count + op.skip > u32::MAX as i64 || op.bpt > u16::MAX as i32)
            {
                debug!(
                    "SCSI command size increased from 10 to 16 bytes on {}",
                    op.inf
                );
                op.iflag.cdbsz = 16;
            }
            if output.kind == FileKind::Passthrough
                && op.oflag.cdbsz < 16
                && (op.dd_count + op.seek > u32::MAX as i64
                    || (op.ibs * op.bpt) / op.obs > u16::MAX as i32)
            {
                debug!(
                    "SCSI command size increased from 10 to 16 bytes on {}",
                    op.outf
                );
                op.oflag.cdbsz = 16;
            }
        }

        let aligned = op.iflag.direct || op.oflag.direct;
        let wrk = AlignedBuf::new((op.ibs_pi * op.bpt) as usize, aligned);
        let wrk2 = if op.oflag.sparing {
            Some(AlignedBuf::new((op.ibs_pi * op.bpt) as usize, aligned))
        } else {
            None
        };
        let obpt = (op.ibs * op.bpt) / op.obs;
        let zeros = if op.oflag.sparse > 0 {
            vec![0u8; (obpt * op.obs) as usize]
        } else {
            Vec::new()
        };

        debug!(
            "skip={} (blocks on input), seek={} (blocks on output)",
            op.skip, op.seek
        );
        trace!("  ibs={} bytes, obs={} bytes, OBPC={}", op.ibs, op.obs, op.obpc);
        if op.ibs != op.ibs_pi {
            trace!(
                "  due to protect ibs_pi={} bytes, obs_pi={} bytes",
                op.ibs_pi,
                op.obs_pi
            );
        }
        if reading_fifo && op.dd_count < 0 {
            debug!("  reading fifo, blocks_per_transfer={}", op.bpt);
        } else {
            debug!(
                "  initial count={} (blocks of input), blocks_per_transfer={}",
                op.dd_count, op.bpt
            );
        }
        let read1_or_transfer = output.kind == FileKind::DevNull;
        if read1_or_transfer && !op.outf_given && (op.dd_count > 0 || reading_fifo) {
            info!("Output file not specified so no copy, just reading input");
        }

        let gate = SignalGate::install(op.interrupt_io);

        Ok(CopyEngine {
            op,
            stats,
            input,
            output,
            output2,
            errblk: None,
            gate,
            wrk,
            wrk2,
            zeros,
            reading_fifo,
            read1_or_transfer,
            out_type_hold,
            lowest_skip: -1,
            lowest_seek: -1,
            err_to_report: None,
            printed_ew_message: false,
            skip_copy,
        })
    }

    /// Process pending signals: called at the head of each read phase and
    /// each write phase. An info signal prints a progress report and the
    /// copy continues; a fatal signal prints the stats (and the resume
    /// hint when applicable) and terminates via the default disposition.
    fn process_signals(&mut self) {
        let CopyEngine {
            gate,
            stats,
            op,
            reading_fifo,
            out_type_hold,
            read1_or_transfer,
            ..
        } = self;
        let tctx = ThroughputCtx {
            start: gate.start_time(),
            ibs_hold: op.ibs_hold,
            dd_count: op.dd_count,
            reading_fifo: *reading_fifo,
            read1_or_transfer: *read1_or_transfer,
        };
        gate.poll(|ev| match ev {
            SignalEvent::Interrupt(sig) => {
                eprintln!("Interrupted by signal {}", signal_name(sig));
                stats.print("", op.dd_count, *reading_fifo, op.verbose);
                // the hint is pointless when pre-alloc already extended the
                // file to its final length
                if !*reading_fifo
                    && *out_type_hold == FileKind::Regular
                    && !op.oflag.prealloc
                {
                    eprintln!("To resume, invoke with same arguments plus oflag=resume");
                }
            }
            SignalEvent::Info => {
                eprintln!("Progress report:");
                stats.print("  ", op.dd_count, *reading_fifo, op.verbose);
                if op.do_time {
                    print_throughput("  ", true, stats, &tctx);
                }
                eprintln!("  continuing ...");
            }
        });
    }

    /// Suggest the OS drop cache for the ranges this iteration touched
    /// (iflag/oflag=nocache), so a streaming copy does not evict unrelated
    /// cached data. Called before skip/seek advance.
    fn do_fadvise(&mut self, csp: &CopyState) {
        let (bytes_if, bytes_of, bytes_of2) = (csp.bytes_read, csp.bytes_of, csp.bytes_of2);
        let in_valid = matches!(self.input.kind, FileKind::Regular | FileKind::Block);
        let out_valid = matches!(self.output.kind, FileKind::Regular | FileKind::Block);
        let out2_valid = self
            .output2
            .as_ref()
            .map(|s| matches!(s.kind, FileKind::Regular | FileKind::Block))
            .unwrap_or(false);
        if self.op.iflag.nocache > 0 && bytes_if > 0 && in_valid {
            if self.lowest_skip < 0 || self.op.skip > self.lowest_skip {
                self.lowest_skip = self.op.skip;
            }
            if let Some(f) = self.input.stream.as_ref().and_then(|s| s.file()) {
                let ibs = self.op.ibs as i64;
                let rt = fileio::fadvise_dontneed(
                    f,
                    self.lowest_skip * ibs,
                    (self.op.skip - self.lowest_skip) * ibs + bytes_if as i64,
                );
                if rt != 0 {
                    eprintln!("posix_fadvise on read, skip={} ,err={}", self.op.skip, rt);
                }
            }
        }
        if (self.op.oflag.nocache & 2) != 0 && bytes_of2 > 0 && out2_valid {
            if let Some(f) = self
                .output2
                .as_ref()
                .and_then(|s| s.stream.as_ref())
                .and_then(|s| s.file())
            {
                let rt = fileio::fadvise_dontneed(f, 0, 0);
                if rt != 0 {
                    eprintln!("posix_fadvise on of2, seek={} ,err={}", self.op.seek, rt);
                }
            }
        }
        if (self.op.oflag.nocache & 1) != 0 && bytes_of > 0 && out_valid {
            if self.lowest_seek < 0 || self.op.seek > self.lowest_seek {
                self.lowest_seek = self.op.seek;
            }
            if let Some(f) = self.output.stream.as_ref().and_then(|s| s.file()) {
                let obs = self.op.obs as i64;
                let rt = fileio::fadvise_dontneed(
                    f,
                    self.lowest_seek * obs,
                    (self.op.seek - self.lowest_seek) * obs + bytes_of as i64,
                );
                if rt != 0 {
                    eprintln!(
                        "posix_fadvise on output, seek={} , err={}",
                        self.op.seek, rt
                    );
                }
            }
        }
    }

    /// The main loop: copy dd_count input blocks in chunks of bpt blocks.
    fn copy_loop(&mut self, csp: &mut CopyState) -> Result<()> {
        let continual_read = self.reading_fifo && self.op.dd_count < 0;
        if continual_read {
            trace!("copy_loop: reading fifo continually");
        } else {
            trace!("copy_loop: dd_count={}", self.op.dd_count);
        }
        if self.op.dd_count <= 0 && !self.reading_fifo {
            return Ok(());
        }
        let ibpt = self.op.bpt;
        let obpt = (self.op.ibs * self.op.bpt) / self.op.obs;

        while self.op.dd_count > 0 || continual_read {
            csp.bytes_read = 0;
            csp.bytes_of = 0;
            csp.bytes_of2 = 0;
            let mut sparse_skip = false;
            let mut sparing_skip = false;
            let mut wrote_subdivided = false;

            // plan the chunk
            if self.op.dd_count >= ibpt as i64 || continual_read {
                csp.icbpt = ibpt;
                csp.ocbpt = obpt;
            } else {
                csp.icbpt = self.op.dd_count as i32;
                let n = csp.icbpt * self.op.ibs;
                csp.ocbpt = n / self.op.obs;
                if n % self.op.obs != 0 {
                    csp.ocbpt += 1;
                    // pre-zero the work buffer so a final short write pads
                    // cleanly
                    let len = (self.op.ibs * ibpt) as usize;
                    self.wrk.slice_mut()[..len].fill(0);
                }
            }

            // start of reading section
            self.process_signals();
            match self.input.kind {
                FileKind::Passthrough => self.cp_read_pt(csp)?,
                FileKind::Fifo => self.cp_read_fifo(csp)?,
                FileKind::Tape => self.cp_read_tape(csp)?,
                _ => self.cp_read_block_reg(csp)?,
            }
            if csp.icbpt == 0 {
                // nothing read so leave the loop
                break;
            }

            if self.output2.is_some() {
                self.cp_write_of2(csp)?;
            }

            if self.op.oflag.sparse > 0 {
                let n = (csp.ocbpt * self.op.obs + csp.partial_write_bytes) as usize;
                if self.wrk.slice()[..n] == self.zeros[..n] {
                    sparse_skip = true;
                    if self.op.oflag.wsame16 && self.output.kind == FileKind::Passthrough {
                        let res = {
                            let CopyEngine {
                                output, zeros, op, ..
                            } = self;
                            let port = output.pt.as_mut().expect("pt output port");
                            port.write_same(op.seek, csp.ocbpt, &zeros[..op.obs as usize])
                        };
                        match res {
                            Ok(PtStatus::Good) => (),
                            _ => self.stats.trim_errs += 1,
                        }
                    }
                } else if self.op.obpc > 0 {
                    self.cp_finer_comp_wr(csp, true)?;
                    wrote_subdivided = true;
                }
            }
            if self.op.oflag.sparing && !sparse_skip && !wrote_subdivided {
                // in write sparing, read back from the output
                if self.output.kind == FileKind::Passthrough {
                    self.cp_read_of_pt(csp)?;
                } else {
                    self.cp_read_of_block_reg(csp)?;
                }
                let n = (csp.ocbpt * self.op.obs + csp.partial_write_bytes) as usize;
                let equal =
                    self.wrk.slice()[..n] == self.wrk2.as_ref().expect("sparing buffer").slice()[..n];
                if equal {
                    sparing_skip = true;
                } else if self.op.obpc > 0 {
                    self.cp_finer_comp_wr(csp, false)?;
                    wrote_subdivided = true;
                }
            }

            if !wrote_subdivided {
                // start of writing section
                self.process_signals();
                let could_be_last = !continual_read && csp.icbpt as i64 >= self.op.dd_count;
                if sparing_skip || sparse_skip {
                    self.stats.out_sparse += csp.ocbpt as i64;
                    if csp.partial_write_bytes > 0 {
                        self.stats.out_sparse_partial += 1;
                    }
                } else {
                    match self.output.kind {
                        FileKind::Passthrough => {
                            self.cp_write_pt(csp, 0, csp.ocbpt, 0, true)?;
                        }
                        // don't bump out_full for the null device
                        FileKind::DevNull => (),
                        FileKind::Tape => self.cp_write_tape(csp, could_be_last)?,
                        _ => {
                            self.cp_write_block_reg(csp, 0, csp.ocbpt, 0, true)?;
                        }
                    }
                }
            }

            // post-write bookkeeping
            self.do_fadvise(csp);
            if self.op.dd_count > 0 {
                self.op.dd_count -= csp.icbpt as i64;
            }
            self.op.skip += csp.icbpt as i64;
            self.op.seek += csp.ocbpt as i64;
            if csp.leave_after_write {
                if csp.tape_short_read {
                    // allow multiple partial writes for tape
                    csp.partial_write_bytes = 0;
                    csp.leave_after_write = false;
                    csp.tape_short_read = false;
                } else {
                    return match csp.leave_reason {
                        LeaveReason::Eof => Ok(()),
                        LeaveReason::MediumHard => {
                            Err(CopyError::medium("medium error ended the copy"))
                        }
                        LeaveReason::FileError => {
                            Err(CopyError::file("file error ended the copy"))
                        }
                        LeaveReason::Other => Err(CopyError::other("error ended the copy")),
                    };
                }
            }
        }
        Ok(())
    }

    /// Run the copy: pre-allocate if asked, loop, then the termination
    /// duties (sparse cleanup, syncs, journal close, stats, throughput,
    /// cache sync, tape filemark) and the early-termination report.
    pub fn execute(&mut self) -> Result<()> {
        if self.skip_copy {
            return Ok(());
        }
        if self.op.iflag.errblk {
            self.errblk = Some(ErrblkJournal::open());
        }
        if self.op.oflag.prealloc {
            if let Some(f) = self.output.stream.as_ref().and_then(|s| s.file()) {
                let offset = self.op.obs as i64 * self.op.seek;
                let len = self.op.obs as i64 * self.op.dd_count;
                let kept_size = fileio::preallocate(f, offset, len)?;
                trace!("Pre-allocated {} bytes at offset {}", len, offset);
                if kept_size {
                    // apparent length unchanged, so the resume hint stays
                    // valid
                    self.op.oflag.prealloc = false;
                }
            }
        }

        let mut csp = CopyState::default();
        let ret = self.copy_loop(&mut csp);

        // sparse: fix up OFILE length when the last blocks were bypassed
        if self.output.kind == FileKind::Regular
            && !self.op.oflag.nowrite
            && self.op.oflag.sparse > 0
        {
            self.cp_sparse_cleanup(&mut csp);
        }
        match self.output.kind {
            FileKind::Passthrough
            | FileKind::DevNull
            | FileKind::Fifo
            | FileKind::Char
            | FileKind::Tape => (),
            _ => {
                if self.op.oflag.fdatasync {
                    if let Some(f) = self.output.stream.as_ref().and_then(|s| s.file()) {
                        if f.sync_data().is_err() {
                            eprintln!("fdatasync() error");
                        } else {
                            debug!("Called fdatasync() on {} successfully", self.op.outf);
                        }
                    }
                } else if self.op.oflag.fsync {
                    if let Some(f) = self.output.stream.as_ref().and_then(|s| s.file()) {
                        if f.sync_all().is_err() {
                            eprintln!("fsync() error");
                        } else {
                            debug!("Called fsync() on {} successfully", self.op.outf);
                        }
                    }
                }
            }
        }

        if let Some(j) = self.errblk.as_mut() {
            j.close();
        }
        self.stats
            .print("", self.op.dd_count, self.reading_fifo, self.op.verbose);
        if self.output.kind == FileKind::Tape && self.op.oflag.nofm {
            debug!("(suppressing writing of filemark on close)");
        }
        if self.stats.sum_of_resids != 0 {
            eprintln!(
                ">> Non-zero sum of residual counts={}",
                self.stats.sum_of_resids
            );
        }
        if self.op.do_time {
            let tctx = ThroughputCtx {
                start: self.gate.start_time(),
                ibs_hold: self.op.ibs_hold,
                dd_count: self.op.dd_count,
                reading_fifo: self.reading_fifo,
                read1_or_transfer: self.read1_or_transfer,
            };
            print_throughput("", false, &self.stats, &tctx);
        }
        if self.op.oflag.ssync && self.output.kind == FileKind::Passthrough {
            eprintln!(">> SCSI synchronizing cache on {}", self.op.outf);
            if let Some(port) = self.output.pt.as_mut() {
                let _ = port.sync_cache();
            }
        }
        if self.output.kind == FileKind::Tape {
            if let Some(f) = self.output.stream.as_ref().and_then(|s| s.file()) {
                fileio::tape_close_output(f, self.op.oflag.nofm, self.op.oflag.fsync);
            }
        }

        // an error held from a partial pt read now becomes the verdict
        let ret = match ret {
            Ok(()) => match self.err_to_report.take() {
                Some(e) => Err(e),
                None => Ok(()),
            },
            err => err,
        };
        if self.op.dd_count != 0 && !self.reading_fifo {
            match &ret {
                Ok(()) => eprintln!("Early termination, EOF on input?"),
                Err(CopyError::MediumHard(_)) => {
                    eprintln!("Early termination, medium error occurred")
                }
                Err(CopyError::Protection) | Err(CopyError::ProtectionWithInfo) => {
                    eprintln!("Early termination, protection information error occurred")
                }
                Err(_) => eprintln!("Early termination, some error occurred"),
            }
        }
        ret
    }
}
