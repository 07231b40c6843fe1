//! In-memory copy statistics, the coe (continue-on-error) tracker, the
//! stats block printed on interrupt/info/exit and the duration/throughput
//! report.
//!
//! All mutation happens on the single engine thread; the signal reporter
//! only ever reads whole machine-word counters, so no locking is needed.

use std::time::Instant;

/// Tracks the consecutive-unrecovered-read budget and the range of LBAs
/// that were zero-filled.
#[derive(Debug, Clone)]
pub struct CoeTracker {
    pub count: i32,
    pub lowest_unrecovered: i64,
    pub highest_unrecovered: i64,
}

impl Default for CoeTracker {
    fn default() -> Self {
        CoeTracker {
            count: 0,
            lowest_unrecovered: -1,
            highest_unrecovered: -1,
        }
    }
}

impl CoeTracker {
    /// Record one unrecovered LBA, widening the low/high range.
    pub fn note_unrecovered(&mut self, lba: i64) {
        if self.highest_unrecovered < 0 {
            self.highest_unrecovered = lba;
            self.lowest_unrecovered = lba;
        } else {
            if lba < self.lowest_unrecovered {
                self.lowest_unrecovered = lba;
            }
            if lba > self.highest_unrecovered {
                self.highest_unrecovered = lba;
            }
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub in_full: i64,
    pub in_partial: i32,
    pub out_full: i64,
    pub out_partial: i32,
    pub out_sparse: i64,
    pub out_sparse_partial: i32,

    pub recovered_errs: i32,
    pub unrecovered_errs: i32,
    pub wr_recovered_errs: i32,
    pub wr_unrecovered_errs: i32,
    pub trim_errs: i32,
    pub num_retries: i32,
    pub interrupted_retries: u32,
    pub sum_of_resids: i32,

    pub coe: CoeTracker,

    // tape read summary state (consecutive same-length reads)
    pub read_tape_numbytes: i32,
    pub last_tape_read_len: i32,
    pub consec_same_len_reads: i32,

    // which optional stat lines apply to this copy
    pub out_sparse_active: bool,
    pub out_sparing_active: bool,
    pub out_trim_active: bool,
}

impl Stats {
    /// Reset the consecutive-bad-blocks budget after any successful read.
    pub fn zero_coe_limit_count(&mut self, coe_limit: i32) {
        if coe_limit > 0 {
            self.coe.count = 0;
        }
    }

    /// Summarise previous consecutive same-length tape reads, when the read
    /// length changed and more than one read of the old length happened.
    pub fn print_tape_summary(&self, res: i32, prefix: &str, verbose: i32) {
        let len = self.last_tape_read_len;
        let num = self.read_tape_numbytes;
        if verbose > 1 && res != len && self.consec_same_len_reads >= 1 {
            eprintln!(
                "{}({}{} read{} of {} byte{})",
                prefix,
                self.consec_same_len_reads,
                if len < num { " short" } else { "" },
                if self.consec_same_len_reads != 1 { "s" } else { "" },
                len,
                if len != 1 { "s" } else { "" }
            );
        }
    }

    /// Print the whole stats block to stderr, each line led by `prefix`.
    pub fn print(&self, prefix: &str, dd_count: i64, reading_fifo: bool, verbose: i32) {
        self.print_tape_summary(0, prefix, verbose);

        if dd_count != 0 && !reading_fifo {
            eprintln!("  remaining block count={}", dd_count);
        }
        eprintln!("{}{}+{} records in", prefix, self.in_full, self.in_partial);
        eprintln!("{}{}+{} records out", prefix, self.out_full, self.out_partial);
        if self.out_sparse_active || self.out_sparing_active {
            if self.out_trim_active {
                let cp = if self.trim_errs > 0 {
                    "attempted trim"
                } else {
                    "trimmed"
                };
                if self.out_sparse_partial > 0 {
                    eprintln!(
                        "{}{}+{} {} records out",
                        prefix, self.out_sparse, self.out_sparse_partial, cp
                    );
                } else {
                    eprintln!("{}{} {} records out", prefix, self.out_sparse, cp);
                }
            } else if self.out_sparse_partial > 0 {
                eprintln!(
                    "{}{}+{} bypassed records out",
                    prefix, self.out_sparse, self.out_sparse_partial
                );
            } else {
                eprintln!("{}{} bypassed records out", prefix, self.out_sparse);
            }
        }
        if self.recovered_errs > 0 {
            eprintln!("{}{} recovered read errors", prefix, self.recovered_errs);
        }
        if self.num_retries > 0 {
            eprintln!("{}{} retries attempted", prefix, self.num_retries);
        }
        if self.unrecovered_errs > 0 {
            eprintln!(
                "{}{} unrecovered read error{}",
                prefix,
                self.unrecovered_errs,
                if self.unrecovered_errs == 1 { "" } else { "s" }
            );
        }
        if self.unrecovered_errs > 0 && self.coe.highest_unrecovered >= 0 {
            eprintln!(
                "lowest unrecovered read lba={}, highest unrecovered lba={}",
                self.coe.lowest_unrecovered, self.coe.highest_unrecovered
            );
        }
        if self.wr_recovered_errs > 0 {
            eprintln!("{}{} recovered write errors", prefix, self.wr_recovered_errs);
        }
        if self.wr_unrecovered_errs > 0 {
            eprintln!(
                "{}{} unrecovered write error{}",
                prefix,
                self.wr_unrecovered_errs,
                if self.wr_unrecovered_errs == 1 { "" } else { "s" }
            );
        }
        if self.trim_errs > 0 {
            eprintln!("{}{} trim errors", prefix, self.trim_errs);
        }
        if self.interrupted_retries > 0 {
            eprintln!(
                "{}{} {} after interrupted system call(s)",
                prefix,
                self.interrupted_retries,
                if self.interrupted_retries == 1 {
                    "retry"
                } else {
                    "retries"
                }
            );
        }
    }
}

/// Context for the duration/throughput report; everything it needs beyond
/// the counters themselves.
pub struct ThroughputCtx {
    pub start: Instant,
    pub ibs_hold: i32,
    pub dd_count: i64,
    pub reading_fifo: bool,
    /// true when the output is the null device, so only reading happened
    pub read1_or_transfer: bool,
}

/// Transfer duration and throughput, typically in megabytes per second
/// where a megabyte is 10^6 bytes (bigger numbers, preferred by industry).
/// If the transfer is large enough and not about to finish, also estimate
/// the time remaining.
pub fn print_throughput(leadin: &str, contin: bool, stats: &Stats, ctx: &ThroughputCtx) {
    let elapsed = ctx.start.elapsed();
    let a = elapsed.as_secs_f64();
    let b = ctx.ibs_hold as f64 * stats.in_full as f64;
    eprint!(
        "{}time to {} data{}: {}.{:06} secs",
        leadin,
        if ctx.read1_or_transfer { "read" } else { "transfer" },
        if contin { " so far" } else { "" },
        elapsed.as_secs(),
        elapsed.subsec_micros()
    );
    let mut r = 0.0;
    if a > 0.00001 && b > 511.0 {
        r = b / (a * 1_000_000.0);
        if r < 1.0 {
            eprintln!(" at {:.1} KB/sec", r * 1000.0);
        } else {
            eprintln!(" at {:.2} MB/sec", r);
        }
    } else {
        eprintln!();
    }
    if contin && !ctx.reading_fifo && r > 0.01 && ctx.dd_count > 100 {
        let mut secs = ((ctx.ibs_hold as f64 * ctx.dd_count as f64) / (r * 1_000_000.0)) as i64;
        if secs > 10 {
            let h = secs / 3600;
            secs -= h * 3600;
            let m = secs / 60;
            secs -= m * 60;
            if h > 0 {
                eprintln!("{}estimated time remaining: {}:{:02}:{:02}", leadin, h, m, secs);
            } else {
                eprintln!("{}estimated time remaining: {}:{:02}", leadin, m, secs);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coe_tracker_range() {
        let mut t = CoeTracker::default();
        assert!(t.highest_unrecovered < 0);
        t.note_unrecovered(9);
        assert_eq!(t.lowest_unrecovered, 9);
        assert_eq!(t.highest_unrecovered, 9);
        t.note_unrecovered(4);
        t.note_unrecovered(17);
        assert_eq!(t.lowest_unrecovered, 4);
        assert_eq!(t.highest_unrecovered, 17);
    }

    #[test]
    fn test_zero_coe_limit_count_respects_limit() {
        let mut s = Stats::default();
        s.coe.count = 3;
        s.zero_coe_limit_count(0);
        assert_eq!(s.coe.count, 3);
        s.zero_coe_limit_count(5);
        assert_eq!(s.coe.count, 0);
    }
}
