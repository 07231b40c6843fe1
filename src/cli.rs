use clap::builder::styling::AnsiColor;
use clap::builder::Styles;
use clap::Parser;

const CLAP_STYLING: Styles = Styles::styled()
    .header(AnsiColor::BrightGreen.on_default().bold())
    .usage(AnsiColor::BrightGreen.on_default().bold())
    .literal(AnsiColor::BrightCyan.on_default().bold())
    .placeholder(AnsiColor::BrightCyan.on_default());

#[derive(Parser, Debug)]
#[command(name = "ptcopy")]
#[command(about = "Copy all or part of an input file/device to an output, IBS*BPT bytes at a \
                   time. Similar to the dd command, with support for block devices and devices \
                   accessed via a SCSI pass-through.")]
#[command(version)]
#[command(styles = CLAP_STYLING)]
pub struct Cli {
    /// Input file or device to read from ('-' for stdin)
    #[arg(long = "if", value_name = "IFILE")]
    pub input: String,

    /// Output file or device to write to ('-' for stdout, '.' for no output)
    #[arg(long = "of", value_name = "OFILE")]
    pub output: Option<String>,

    /// Additional output file; must be a regular file or a fifo
    #[arg(long = "of2", value_name = "OFILE2")]
    pub output2: Option<String>,

    /// Block size for both input and output (overrides ibs and obs)
    #[arg(long, value_name = "BS")]
    pub bs: Option<i32>,

    /// Input block size in bytes (default 512)
    #[arg(long, value_name = "IBS")]
    pub ibs: Option<i32>,

    /// Output block size in bytes (default 512); when IBS differs from OBS,
    /// ((IBS * BPT) % OBS) == 0 is required
    #[arg(long, value_name = "OBS")]
    pub obs: Option<i32>,

    /// Input blocks per transfer, optionally followed by the output blocks
    /// per comparison used by sparse/sparing subdivision
    #[arg(long, value_name = "BPT[,OBPC]")]
    pub bpt: Option<String>,

    /// Size of the SCSI READ or WRITE cdb: 6, 10, 12, 16 or 32
    #[arg(long, value_name = "6|10|12|16|32")]
    pub cdbsz: Option<i32>,

    /// 0: exit on read error (default); 1: continue, substituting zeros
    #[arg(long, value_name = "0|1")]
    pub coe: Option<i32>,

    /// Limit on consecutive zero-filled blocks when coe is active
    /// (0, the default, means no limit)
    #[arg(long = "coe-limit", value_name = "CL", default_value_t = 0)]
    pub coe_limit: i32,

    /// dd-style conversions, comma separated: fdatasync, fsync, noerror,
    /// notrunc, null, resume, sparing, sparse, sync, trunc
    #[arg(long, value_name = "CONVS")]
    pub conv: Option<String>,

    /// Number of input blocks to copy (-1, the default, derives the count
    /// from the file/device sizes)
    #[arg(long, value_name = "COUNT", default_value_t = -1, allow_negative_numbers = true)]
    pub count: i64,

    /// Input flags, comma separated (see the flag list in the README)
    #[arg(long, value_name = "FLAGS")]
    pub iflag: Option<String>,

    /// Allow signals during reads and writes (default 0 masks them while
    /// IO is in flight)
    #[arg(long, value_name = "0|1", default_value_t = 0)]
    pub intio: i32,

    /// Block position to start reading from IFILE (same as --skip)
    #[arg(long, value_name = "SKIP", allow_negative_numbers = true)]
    pub iseek: Option<i64>,

    /// Output flags, comma separated
    #[arg(long, value_name = "FLAGS")]
    pub oflag: Option<String>,

    /// Block position to start writing to OFILE (same as --seek)
    #[arg(long, value_name = "SEEK", allow_negative_numbers = true)]
    pub oseek: Option<i64>,

    /// rdprotect and optionally wrprotect field values for pt commands
    #[arg(long, value_name = "RDP[,WRP]")]
    pub protect: Option<String>,

    /// Retry pass-through errors this many times (default 0)
    #[arg(long, value_name = "RETR", default_value_t = 0)]
    pub retries: i32,

    /// Block position to start writing to OFILE
    #[arg(long, value_name = "SEEK", allow_negative_numbers = true)]
    pub seek: Option<i64>,

    /// Block position to start reading from IFILE
    #[arg(long, value_name = "SKIP", allow_negative_numbers = true)]
    pub skip: Option<i64>,

    /// 'noxfer' suppresses the throughput calculation
    #[arg(long, value_name = "STAT")]
    pub status: Option<String>,

    /// Diagnostic verbosity: 0 normal, 1 some noise, 2 more noise, negative
    /// for quiet
    #[arg(long, value_name = "VERB", default_value_t = 0, allow_negative_numbers = true)]
    pub verbose: i32,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
