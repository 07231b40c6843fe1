//! Error-block journal (iflag=errblk): an append-only text log of the LBAs
//! or LBA ranges that failed to read, bracketed by start/stop timestamps.
//! Journal problems are never fatal to the copy.

use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::warn;

pub const ERRBLK_FILE: &str = "errblk.txt";

#[derive(Debug, Default)]
pub struct ErrblkJournal {
    fp: Option<File>,
}

impl ErrblkJournal {
    /// Open (append) the journal in the working directory and stamp the
    /// start of this run.
    pub fn open() -> ErrblkJournal {
        Self::open_path(Path::new(ERRBLK_FILE))
    }

    pub fn open_path(path: &Path) -> ErrblkJournal {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(mut f) => {
                let now = Local::now().format("%Y-%m-%d %H:%M:%S");
                let _ = writeln!(f, "# start: {}", now);
                ErrblkJournal { fp: Some(f) }
            }
            Err(_) => {
                warn!("unable to open or create {}", path.display());
                ErrblkJournal { fp: None }
            }
        }
    }

    pub fn record(&mut self, lba: u64) {
        if let Some(f) = self.fp.as_mut() {
            let _ = writeln!(f, "0x{:x}", lba);
        }
    }

    pub fn record_range(&mut self, lba: u64, num: u32) {
        if self.fp.is_some() {
            if num == 1 {
                self.record(lba);
            } else if num > 1 {
                if let Some(f) = self.fp.as_mut() {
                    let _ = writeln!(f, "0x{:x}-0x{:x}", lba, lba + (num as u64 - 1));
                }
            }
        }
    }

    /// Stamp the end of the run and close the file.
    pub fn close(&mut self) {
        if let Some(mut f) = self.fp.take() {
            let now = Local::now().format("%Y-%m-%d %H:%M:%S");
            let _ = writeln!(f, "# stop: {}", now);
        }
    }
}
