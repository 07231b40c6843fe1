//! Parsed operation parameters: per-side flag sets, dd-style conversions
//! and the post-parse sanity rules that turn the raw command line into a
//! consistent set of copy options.

use crate::cli::Cli;
use crate::error::{CopyError, Result};
use tracing::{debug, warn};

pub const DEF_BLOCK_SIZE: i32 = 512;
pub const DEF_SCSI_CDBSZ: i32 = 10;

/// Side-specific flags (iflag= / oflag=). A few fields are counters rather
/// than booleans because giving a flag twice changes behaviour (nocache) or
/// because a level matters (sparse).
#[derive(Debug, Default, Clone)]
pub struct FlagSet {
    pub append: bool,
    pub cdbsz: i32,
    pub coe: i32,
    pub direct: bool,
    pub dpo: bool,
    pub errblk: bool,
    pub excl: bool,
    pub fdatasync: bool,
    pub flock: bool,
    pub force: bool,
    pub fsync: bool,
    pub fua: bool,
    pub fua_nv: bool,
    pub ignoreew: bool,
    pub nocache: u32,
    pub nofm: bool,
    pub nopad: bool,
    pub norcap: bool,
    pub nowrite: bool,
    pub pad: bool,
    pub prealloc: bool,
    pub pt: bool,
    pub rarc: bool,
    pub resume: bool,
    pub retries: i32,
    pub self_copy: bool,
    pub sparing: bool,
    pub sparse: i32,
    pub ssync: bool,
    pub strunc: bool,
    pub sync: bool,
    pub trunc: bool,
    pub wsame16: bool,
}

impl FlagSet {
    /// Parse a comma separated flag list into this set. Unknown flags are
    /// an error.
    pub fn parse_into(&mut self, arg: &str) -> Result<()> {
        if arg.is_empty() {
            return Err(CopyError::syntax("no flag found"));
        }
        for tok in arg.split(',') {
            match tok {
                "append" => self.append = true,
                "coe" => self.coe += 1,
                "direct" => self.direct = true,
                "dpo" => self.dpo = true,
                "errblk" => self.errblk = true,
                "excl" => self.excl = true,
                "fdatasync" => self.fdatasync = true,
                "flock" => self.flock = true,
                "force" => self.force = true,
                // check fua_nv before fua
                "fua_nv" => self.fua_nv = true,
                "fua" => self.fua = true,
                // "ignore early warning" (tape end-of-medium)
                "ignoreew" => self.ignoreew = true,
                "nocache" => self.nocache += 1,
                // no filemark on tape close
                "nofm" => self.nofm = true,
                "nopad" => self.nopad = true,
                "norcap" => self.norcap = true,
                "nowrite" => self.nowrite = true,
                "null" => (),
                "pad" => self.pad = true,
                "pre-alloc" | "prealloc" => self.prealloc = true,
                "pt" => self.pt = true,
                "rarc" => self.rarc = true,
                "resume" => self.resume = true,
                "self" => self.self_copy = true,
                "sparing" => self.sparing = true,
                "sparse" => self.sparse += 1,
                "ssync" => self.ssync = true,
                "strunc" => self.strunc = true,
                "sync" => self.sync = true,
                // trim (ATA term) and unmap (SCSI term) are synonyms
                "trim" | "unmap" => self.wsame16 = true,
                "trunc" => self.trunc = true,
                _ => return Err(CopyError::syntax(format!("unrecognised flag: {}", tok))),
            }
        }
        Ok(())
    }
}

/// Apply 'conv=' conversions, which are aliases into the two flag sets.
pub fn process_conv(arg: &str, iflag: &mut FlagSet, oflag: &mut FlagSet) -> Result<()> {
    if arg.is_empty() {
        return Err(CopyError::syntax("no conversions found"));
    }
    for tok in arg.split(',') {
        match tok {
            "fdatasync" => oflag.fdatasync = true,
            "fsync" => oflag.fsync = true,
            // will still fail on write error
            "noerror" => iflag.coe += 1,
            // notrunc is the default action so ignore it
            "notrunc" => (),
            "null" => (),
            "resume" => oflag.resume = true,
            "sparing" => oflag.sparing = true,
            "sparse" => oflag.sparse += 1,
            // dd(susv4): pad errored blocks with zeros, done here by default
            "sync" => (),
            "trunc" => oflag.trunc = true,
            _ => return Err(CopyError::syntax(format!("unrecognised flag: {}", tok))),
        }
    }
    Ok(())
}

/// Default transfer (copy buffer) size in input blocks, depending on IBS.
/// 128*2048 for CD/DVDs is too large for some block layers, so scale the
/// default down as the block size grows.
pub fn default_bpt(ibs: i32) -> i32 {
    if ibs < 8 {
        8192
    } else if ibs < 64 {
        1024
    } else if ibs < 1024 {
        128
    } else if ibs < 8192 {
        16
    } else if ibs < 32768 {
        4
    } else {
        1
    }
}

/// The immutable-after-planning operation parameters of a copy, plus the
/// cursors (skip/seek/dd_count) the engine advances as it runs.
#[derive(Debug, Clone)]
pub struct Opts {
    pub inf: String,
    pub outf: String,
    pub out2f: Option<String>,
    pub outf_given: bool,

    pub ibs: i32,
    pub obs: i32,
    /// ibs held across any later adjustment; throughput is reported in
    /// units of this size
    pub ibs_hold: i32,
    /// effective block sizes once protection information bytes are added
    pub ibs_pi: i32,
    pub obs_pi: i32,

    pub bpt: i32,
    pub bpt_given: bool,
    pub obpc: i32,

    pub skip: i64,
    pub seek: i64,
    pub dd_count: i64,

    pub rdprotect: i32,
    pub wrprotect: i32,
    /// protection type / P_I_EXPONENT reported by READ CAPACITY per side
    pub rdprot_typ: i32,
    pub rdp_i_exp: i32,
    pub wrprot_typ: i32,
    pub wrp_i_exp: i32,
    pub coe_limit: i32,
    pub interrupt_io: bool,
    pub do_time: bool,
    pub verbose: i32,
    pub quiet: bool,
    pub cdbsz_given: bool,

    pub iflag: FlagSet,
    pub oflag: FlagSet,
}

impl Opts {
    /// Build options from the parsed command line, applying the dd-style
    /// combination rules and sanity defaults.
    pub fn from_cli(cli: &Cli) -> Result<Opts> {
        let mut iflag = FlagSet::default();
        let mut oflag = FlagSet::default();
        iflag.cdbsz = DEF_SCSI_CDBSZ;
        oflag.cdbsz = DEF_SCSI_CDBSZ;

        if let Some(conv) = &cli.conv {
            process_conv(conv, &mut iflag, &mut oflag)?;
        }
        if let Some(fl) = &cli.iflag {
            iflag.parse_into(fl)?;
        }
        if let Some(fl) = &cli.oflag {
            oflag.parse_into(fl)?;
        }

        let bs_given = cli.bs.is_some();
        if bs_given && (cli.ibs.is_some() || cli.obs.is_some()) {
            return Err(CopyError::syntax(
                "'bs' option cannot be combined with 'ibs' or 'obs'",
            ));
        }
        let mut ibs = cli.bs.or(cli.ibs).unwrap_or(0);
        let mut obs = cli.bs.or(cli.obs).unwrap_or(0);
        if ibs < 0 || obs < 0 {
            return Err(CopyError::syntax("block sizes cannot be negative"));
        }

        if cli.skip.is_some() && cli.iseek.is_some() {
            return Err(CopyError::syntax("both 'skip' and 'iseek' given"));
        }
        if cli.seek.is_some() && cli.oseek.is_some() {
            return Err(CopyError::syntax("both 'seek' and 'oseek' given"));
        }
        let skip = cli.skip.or(cli.iseek).unwrap_or(0);
        let seek = cli.seek.or(cli.oseek).unwrap_or(0);

        let (mut bpt, mut bpt_given, mut obpc) = (0, false, 0);
        if let Some(arg) = &cli.bpt {
            let (b, o) = match arg.split_once(',') {
                Some((b, o)) => (b, Some(o)),
                None => (arg.as_str(), None),
            };
            let n: i32 = b
                .parse()
                .map_err(|_| CopyError::syntax("bad BPT argument to 'bpt='"))?;
            if n < 0 {
                return Err(CopyError::syntax("bad BPT argument to 'bpt='"));
            }
            if n > 0 {
                bpt = n;
                bpt_given = true;
            }
            if let Some(o) = o {
                obpc = o
                    .parse()
                    .map_err(|_| CopyError::syntax("bad OBPC argument to 'bpt='"))?;
                if obpc < 0 {
                    return Err(CopyError::syntax("bad OBPC argument to 'bpt='"));
                }
            }
        }

        let (mut rdprotect, mut wrprotect) = (0, 0);
        if let Some(arg) = &cli.protect {
            let (r, w) = match arg.split_once(',') {
                Some((r, w)) => (r, Some(w)),
                None => (arg.as_str(), None),
            };
            rdprotect = r
                .parse()
                .map_err(|_| CopyError::syntax("bad RDP argument to 'protect='"))?;
            if !(0..=7).contains(&rdprotect) {
                return Err(CopyError::syntax("bad RDP argument to 'protect='"));
            }
            if let Some(w) = w {
                wrprotect = w
                    .parse()
                    .map_err(|_| CopyError::syntax("bad WRP argument to 'protect='"))?;
                if !(0..=7).contains(&wrprotect) {
                    return Err(CopyError::syntax("bad WRP argument to 'protect='"));
                }
            }
        }

        let mut cdbsz_given = false;
        if let Some(sz) = cli.cdbsz {
            iflag.cdbsz = sz;
            oflag.cdbsz = sz;
            cdbsz_given = true;
        }
        if let Some(coe) = cli.coe {
            iflag.coe = coe;
            oflag.coe = coe;
        }
        if cli.coe_limit < 0 {
            return Err(CopyError::syntax("bad argument to 'coe-limit='"));
        }
        // count=-1 is accepted and means calculate the count
        if cli.count < -1 {
            return Err(CopyError::syntax("bad argument to 'count='"));
        }
        if cli.retries < 0 {
            return Err(CopyError::syntax("bad argument to 'retries='"));
        }
        iflag.retries = cli.retries;
        oflag.retries = cli.retries;

        let mut do_time = true;
        if let Some(st) = &cli.status {
            match st.as_str() {
                "null" => (),
                "noxfer" => do_time = false,
                _ => return Err(CopyError::syntax("'status=' expects 'noxfer' or 'null'")),
            }
        }

        let quiet = cli.verbose < 0;
        let verbose = if quiet { 0 } else { cli.verbose };

        // remaining block-size defaults and their notices
        if ibs == 0 && obs == 0 {
            ibs = DEF_BLOCK_SIZE;
            obs = DEF_BLOCK_SIZE;
            warn!(
                "Assume block size of {} bytes for both input and output",
                DEF_BLOCK_SIZE
            );
        } else if obs == 0 {
            obs = DEF_BLOCK_SIZE;
            if ibs != DEF_BLOCK_SIZE {
                warn!("Neither obs nor bs given so set obs={} (default block size)", obs);
            }
        } else if ibs == 0 {
            ibs = DEF_BLOCK_SIZE;
            if obs != DEF_BLOCK_SIZE {
                warn!("Neither ibs nor bs given so set ibs={} (default block size)", ibs);
            }
        }
        if !bpt_given {
            bpt = default_bpt(ibs);
        }

        let mut op = Opts {
            inf: cli.input.clone(),
            outf: cli.output.clone().unwrap_or_default(),
            out2f: cli.output2.clone(),
            outf_given: cli.output.is_some(),
            ibs,
            obs,
            ibs_hold: ibs,
            ibs_pi: ibs,
            obs_pi: obs,
            bpt,
            bpt_given,
            obpc,
            skip,
            seek,
            dd_count: cli.count,
            rdprotect,
            wrprotect,
            rdprot_typ: 0,
            rdp_i_exp: 0,
            wrprot_typ: 0,
            wrp_i_exp: 0,
            coe_limit: cli.coe_limit,
            interrupt_io: cli.intio != 0,
            do_time,
            verbose,
            quiet,
            cdbsz_given,
            iflag,
            oflag,
        };
        op.sanity_defaults()?;
        Ok(op)
    }

    /// Consistency checks and cross-flag adjustments that do not need the
    /// files opened yet.
    fn sanity_defaults(&mut self) -> Result<()> {
        if self.ibs != self.obs && (self.ibs * self.bpt) % self.obs != 0 {
            return Err(CopyError::syntax(format!(
                "when 'ibs' and 'obs' differ, ((ibs*bpt)/obs) must have no remainder (bpt={})",
                self.bpt
            )));
        }
        if self.skip < 0 || self.seek < 0 {
            return Err(CopyError::syntax("neither skip nor seek can be negative"));
        }
        if self.oflag.append && self.seek > 0 {
            return Err(CopyError::syntax("Can't use both append and seek switches"));
        }
        if self.bpt < 1 {
            return Err(CopyError::syntax("bpt must be greater than 0"));
        }
        if self.iflag.append {
            warn!("append flag ignored on input");
        }
        if self.iflag.ignoreew {
            warn!("ignoreew flag ignored on input");
        }
        if self.iflag.nofm {
            warn!("nofm flag ignored on input");
        }
        if self.iflag.prealloc {
            warn!("pre-alloc flag ignored on input");
        }
        if self.iflag.sparing {
            warn!("sparing flag ignored on input");
        }
        if self.iflag.ssync {
            warn!("ssync flag ignored on input");
        }
        if self.oflag.trunc {
            if self.oflag.resume {
                self.oflag.trunc = false;
                debug!("trunc ignored due to resume flag, otherwise open truncates too early");
            } else if self.oflag.append {
                self.oflag.trunc = false;
                warn!("trunc ignored due to append flag");
            } else if self.oflag.sparing {
                return Err(CopyError::syntax("trunc flag conflicts with sparing"));
            }
        }
        if self.iflag.self_copy || self.oflag.self_copy {
            self.oflag.self_copy = true;
            if self.iflag.wsame16 || self.oflag.wsame16 {
                self.oflag.wsame16 = true;
                self.oflag.nowrite = true;
            }
            if self.outf.is_empty() {
                self.outf = self.inf.clone();
            }
            if self.seek == 0 && self.skip > 0 {
                if self.ibs == self.obs {
                    self.seek = self.skip;
                } else {
                    let l = self.skip * self.ibs as i64;
                    self.seek = l / self.obs as i64;
                    if self.seek * self.obs as i64 != l {
                        return Err(CopyError::syntax(
                            "self cannot translate skip to seek properly, try different \
                             skip value",
                        ));
                    }
                }
                debug!("self: set seek={}", self.seek);
            }
        }
        if self.oflag.wsame16 {
            self.oflag.sparse += 2;
        }
        if self.oflag.strunc && self.oflag.sparse == 0 {
            self.oflag.sparse += 1;
        }
        // Sparing compares (and sparse elides) at single output block
        // granularity unless a coarser compare unit was asked for.
        if (self.oflag.sparse > 0 || self.oflag.sparing) && self.obpc == 0 {
            self.obpc = 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(arg: &str) -> FlagSet {
        let mut f = FlagSet::default();
        f.parse_into(arg).unwrap();
        f
    }

    #[test]
    fn test_flag_parsing() {
        let f = flags("coe,direct,pad,pt");
        assert_eq!(f.coe, 1);
        assert!(f.direct && f.pad && f.pt);
        assert!(!f.sparing);

        let f = flags("trim");
        assert!(f.wsame16);
        let f = flags("unmap");
        assert!(f.wsame16);

        let mut f = FlagSet::default();
        assert!(f.parse_into("no_such_flag").is_err());
        assert!(f.parse_into("").is_err());
    }

    #[test]
    fn test_conv_aliases() {
        let mut i = FlagSet::default();
        let mut o = FlagSet::default();
        process_conv("noerror,sync,sparse,resume", &mut i, &mut o).unwrap();
        assert_eq!(i.coe, 1);
        assert_eq!(o.sparse, 1);
        assert!(o.resume);

        assert!(process_conv("bogus", &mut i, &mut o).is_err());
    }

    #[test]
    fn test_default_bpt_ladder() {
        assert_eq!(default_bpt(1), 8192);
        assert_eq!(default_bpt(512), 128);
        assert_eq!(default_bpt(2048), 16);
        assert_eq!(default_bpt(8192), 4);
        assert_eq!(default_bpt(65536), 1);
    }
}
