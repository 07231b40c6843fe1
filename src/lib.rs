//! ptcopy library
//!
//! A block-oriented copy engine for files and storage devices in the
//! spirit of dd, with support for SCSI pass-through ports, mismatched
//! input/output block sizes, sparse and sparing writes, resumable copies,
//! continue-on-error reads and tape semantics.

pub mod cli;
pub mod engine;
pub mod errblk;
pub mod error;
pub mod fileio;
pub mod logger;
pub mod options;
pub mod planner;
pub mod pt;
pub mod signals;
pub mod stats;

// Re-export key types for easier use
pub use cli::Cli;
pub use engine::CopyEngine;
pub use error::{CopyError, Result};
pub use fileio::{ByteStream, FileKind, Side};
pub use options::{FlagSet, Opts};
pub use pt::{PtCapacity, PtConfig, PtPort, PtRead, PtStatus};

#[cfg(test)]
mod tests;

/// Open both sides per the parsed options and run the copy to completion.
pub fn run(cli: Cli) -> Result<()> {
    let mut op = options::Opts::from_cli(&cli)?;
    if op.quiet {
        redirect_stderr_to_null();
    }
    if op.outf.is_empty() {
        // no 'of=OFILE' means the null device
        op.outf = ".".to_string();
    }
    let input = fileio::open_input(&op)?;
    let output = fileio::open_output(&op)?;
    let output2 = match op.out2f.clone() {
        Some(path) => fileio::open_output2(&path)?,
        None => None,
    };
    let mut engine = engine::CopyEngine::new(op, input, output, output2)?;
    engine.execute()
}

fn redirect_stderr_to_null() {
    use std::os::unix::io::AsRawFd;
    if let Ok(null) = std::fs::OpenOptions::new().write(true).open("/dev/null") {
        unsafe {
            libc::dup2(null.as_raw_fd(), libc::STDERR_FILENO);
        }
    }
}
