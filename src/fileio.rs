//! File-type detection and the byte-port layer the engine drives for every
//! non-pass-through side, plus the small pile of Unix helpers the copy
//! needs: retry-on-interrupt, advisory locking, cache advice, space
//! pre-allocation, block device sizing and tape close handling.

use crate::error::{CopyError, Result};
use crate::options::Opts;
use crate::pt::PtPort;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::os::unix::io::{AsRawFd, RawFd};
use tracing::{debug, trace, warn};

/// What kind of thing a path refers to. Drives the per-variant read/write
/// rules of the copy engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Passthrough,
    Block,
    Regular,
    Fifo,
    Tape,
    DevNull,
    Char,
    Other,
    /// stat failed; an output with this kind is created as a regular file.
    Missing,
}

impl FileKind {
    pub fn description(&self) -> &'static str {
        match self {
            FileKind::Passthrough => "pass-through [pt] device",
            FileKind::Block => "block device",
            FileKind::Regular => "regular file",
            FileKind::Fifo => "fifo [stdin, stdout, named pipe]",
            FileKind::Tape => "SCSI tape device",
            FileKind::DevNull => "null device",
            FileKind::Char => "char device",
            FileKind::Other => "other file type",
            FileKind::Missing => "unable to 'stat' file",
        }
    }
}

#[cfg(target_os = "linux")]
const SCSI_GENERIC_MAJOR: u32 = 21;
#[cfg(target_os = "linux")]
const SCSI_TAPE_MAJOR: u32 = 9;
#[cfg(target_os = "linux")]
const MEM_MAJOR: u32 = 1;
#[cfg(target_os = "linux")]
const DEV_NULL_MINOR: u32 = 3;

/// The bsg character driver's major number is allocated dynamically; scan
/// /proc/devices for it once.
#[cfg(target_os = "linux")]
fn bsg_major() -> u32 {
    use std::sync::OnceLock;
    static BSG_MAJOR: OnceLock<u32> = OnceLock::new();
    *BSG_MAJOR.get_or_init(|| {
        let text = match std::fs::read_to_string("/proc/devices") {
            Ok(t) => t,
            Err(_) => return 0,
        };
        let mut in_char = false;
        for line in text.lines() {
            if line.starts_with("Character") {
                in_char = true;
                continue;
            }
            if !in_char {
                continue;
            }
            let mut it = line.split_whitespace();
            match (it.next(), it.next()) {
                (Some(num), Some(name)) if name == "bsg" => {
                    return num.parse().unwrap_or(0);
                }
                (Some(_), Some(_)) => continue,
                _ => break,
            }
        }
        0
    })
}

/// Categorise a path by stat(2). '-' is handled by the callers (stdin or
/// stdout fifo) and '.' means the null device.
pub fn detect_kind(path: &str) -> FileKind {
    if path == "." {
        return FileKind::DevNull;
    }
    let md = match std::fs::metadata(path) {
        Ok(md) => md,
        Err(_) => return FileKind::Missing,
    };
    let ft = md.file_type();
    if ft.is_file() {
        FileKind::Regular
    } else if ft.is_char_device() {
        #[cfg(target_os = "linux")]
        {
            use std::os::unix::fs::MetadataExt;
            let rdev = md.rdev();
            let (maj, min) = unsafe { (libc::major(rdev), libc::minor(rdev)) };
            if maj == MEM_MAJOR && min == DEV_NULL_MINOR {
                return FileKind::DevNull;
            }
            if maj == SCSI_GENERIC_MAJOR {
                return FileKind::Passthrough;
            }
            if maj == SCSI_TAPE_MAJOR {
                return FileKind::Tape;
            }
            if bsg_major() != 0 && maj == bsg_major() {
                return FileKind::Passthrough;
            }
            // assume something like /dev/zero
            FileKind::Char
        }
        #[cfg(not(target_os = "linux"))]
        {
            FileKind::Char
        }
    } else if ft.is_block_device() {
        FileKind::Block
    } else if ft.is_fifo() {
        FileKind::Fifo
    } else {
        FileKind::Other
    }
}

/// A positioned byte stream behind one of the copy's sides. Fifo variants
/// (stdin/stdout) cannot seek; the engine never asks them to.
pub enum ByteStream {
    File(File),
    Stdin(io::Stdin),
    Stdout(io::Stdout),
    #[cfg(test)]
    Faulty(FaultyFile),
}

impl ByteStream {
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ByteStream::File(f) => f.read(buf),
            ByteStream::Stdin(s) => s.read(buf),
            ByteStream::Stdout(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "read from write-only stream",
            )),
            #[cfg(test)]
            ByteStream::Faulty(f) => f.read(buf),
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ByteStream::File(f) => f.write(buf),
            ByteStream::Stdout(s) => s.write(buf),
            ByteStream::Stdin(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "write to read-only stream",
            )),
            #[cfg(test)]
            ByteStream::Faulty(f) => f.file.write(buf),
        }
    }

    pub fn seek_to(&mut self, pos: i64) -> io::Result<u64> {
        match self {
            ByteStream::File(f) => f.seek(SeekFrom::Start(pos as u64)),
            #[cfg(test)]
            ByteStream::Faulty(f) => f.file.seek(SeekFrom::Start(pos as u64)),
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "seek on a fifo",
            )),
        }
    }

    pub fn file(&self) -> Option<&File> {
        match self {
            ByteStream::File(f) => Some(f),
            #[cfg(test)]
            ByteStream::Faulty(f) => Some(&f.file),
            _ => None,
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        match self {
            ByteStream::File(f) => f.as_raw_fd(),
            ByteStream::Stdin(s) => s.as_raw_fd(),
            ByteStream::Stdout(s) => s.as_raw_fd(),
            #[cfg(test)]
            ByteStream::Faulty(f) => f.file.as_raw_fd(),
        }
    }
}

/// Test stand-in for a disk with unreadable sectors: reads that touch a bad
/// byte range fail with EIO at the range boundary, exactly as the kernel
/// surfaces a medium error.
#[cfg(test)]
pub struct FaultyFile {
    pub file: File,
    pub bad: Vec<std::ops::Range<u64>>,
}

#[cfg(test)]
impl FaultyFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let pos = self.file.stream_position()?;
        let end = pos + buf.len() as u64;
        let mut limit = buf.len();
        for r in &self.bad {
            if r.contains(&pos) {
                return Err(io::Error::from_raw_os_error(libc::EIO));
            }
            if r.start > pos && r.start < end {
                limit = limit.min((r.start - pos) as usize);
            }
        }
        self.file.read(&mut buf[..limit])
    }
}

/// One side of the copy: its detected kind plus either a byte stream or a
/// pass-through port (never both).
pub struct Side {
    pub kind: FileKind,
    pub stream: Option<ByteStream>,
    pub pt: Option<Box<dyn PtPort>>,
}

impl Side {
    pub fn from_stream(kind: FileKind, stream: ByteStream) -> Side {
        Side {
            kind,
            stream: Some(stream),
            pt: None,
        }
    }

    pub fn from_port(port: Box<dyn PtPort>) -> Side {
        Side {
            kind: FileKind::Passthrough,
            stream: None,
            pt: Some(port),
        }
    }

    pub fn null() -> Side {
        Side {
            kind: FileKind::DevNull,
            stream: None,
            pt: None,
        }
    }
}

/// EREMOTEIO is Linux-specific; elsewhere it folds into EIO.
#[cfg(target_os = "linux")]
pub const EREMOTEIO: i32 = libc::EREMOTEIO;
#[cfg(not(target_os = "linux"))]
pub const EREMOTEIO: i32 = libc::EIO;

/// Retry a blocking call while it reports "interrupted", counting each
/// retry. Applied uniformly to every read/write/seek in the engine.
pub fn retry_intr<T>(retries: &mut u32, mut f: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match f() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => *retries += 1,
            other => return other,
        }
    }
}

pub fn flock_exclusive(file: &File, fname: &str) -> Result<()> {
    let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if res < 0 {
        return Err(CopyError::flock(format!(
            "flock(LOCK_EX | LOCK_NB) on {} failed: {}",
            fname,
            io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Raise read-ahead on a sequentially-read input (iflag=nocache).
pub fn fadvise_sequential(file: &File) {
    let rt = unsafe {
        libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_SEQUENTIAL)
    };
    if rt != 0 {
        warn!("posix_fadvise(SEQUENTIAL), err={}", rt);
    }
}

/// Tell the OS a just-used range will not be needed again soon. Errors are
/// reported, not propagated.
pub fn fadvise_dontneed(file: &File, offset: i64, len: i64) -> i32 {
    unsafe { libc::posix_fadvise(file.as_raw_fd(), offset, len, libc::POSIX_FADV_DONTNEED) }
}

/// Pre-allocate space in the output file (oflag=pre-alloc). Returns true
/// when the KEEP_SIZE form succeeded, so the caller knows the apparent file
/// length was not changed and resume stays usable.
#[cfg(target_os = "linux")]
pub fn preallocate(file: &File, offset: i64, len: i64) -> Result<bool> {
    let fd = file.as_raw_fd();
    debug!("about to call fallocate() with FALLOC_FL_KEEP_SIZE");
    let mut res = unsafe { libc::fallocate(fd, libc::FALLOC_FL_KEEP_SIZE, offset, len) };
    if res == -1 {
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            // the flag is only supported on recent kernels; retry plain
            Some(libc::ENOTTY) | Some(libc::EINVAL) | Some(libc::EOPNOTSUPP) => {
                debug!(
                    "could not pre-allocate with FALLOC_FL_KEEP_SIZE ({}), retrying without",
                    err
                );
                res = unsafe { libc::fallocate(fd, 0, offset, len) };
                if res == -1 {
                    return Err(CopyError::other(format!(
                        "Unable to pre-allocate space: {}",
                        io::Error::last_os_error()
                    )));
                }
                Ok(false)
            }
            _ => Err(CopyError::other(format!(
                "Unable to pre-allocate space: {}",
                err
            ))),
        }
    } else {
        Ok(true)
    }
}

#[cfg(not(target_os = "linux"))]
pub fn preallocate(file: &File, offset: i64, len: i64) -> Result<bool> {
    let res = unsafe { libc::posix_fallocate(file.as_raw_fd(), offset, len) };
    if res != 0 {
        return Err(CopyError::other(format!(
            "Unable to pre-allocate space: {}",
            io::Error::from_raw_os_error(res)
        )));
    }
    // posix_fallocate sets the full length, so resume would see a complete
    // copy; caller suppresses the resume hint.
    Ok(false)
}

/// Number of logical blocks and the logical block size of an opened block
/// device, when the platform lets us ask.
#[cfg(target_os = "linux")]
pub fn blkdev_capacity(file: &File) -> Option<(i64, i32)> {
    const BLKSSZGET: libc::c_ulong = 0x1268;
    const BLKGETSIZE64: libc::c_ulong = 0x80081272;

    let fd = file.as_raw_fd();
    let mut sect_sz: libc::c_int = 0;
    let mut bytes: u64 = 0;
    unsafe {
        if libc::ioctl(fd, BLKSSZGET as _, &mut sect_sz) < 0 || sect_sz <= 0 {
            return None;
        }
        if libc::ioctl(fd, BLKGETSIZE64 as _, &mut bytes) < 0 {
            return None;
        }
    }
    Some((bytes as i64 / sect_sz as i64, sect_sz))
}

#[cfg(not(target_os = "linux"))]
pub fn blkdev_capacity(_file: &File) -> Option<(i64, i32)> {
    None
}

/// On closing a tape output the st driver writes a filemark and flushes the
/// drive buffer. Write the filemark in immediate mode instead (MTWEOFI),
/// suppress it under nofm, and fall back to MTBSR 0 on old kernels.
#[cfg(target_os = "linux")]
pub fn tape_close_output(file: &File, nofm: bool, fsync_flag: bool) {
    #[repr(C)]
    struct MtOp {
        mt_op: libc::c_short,
        mt_count: libc::c_int,
    }
    const MTIOCTOP: libc::c_ulong = 0x40086d01;
    const MTWEOF: libc::c_short = 5;
    const MTBSR: libc::c_short = 4;
    // write an end-of-file record (mark) in immediate mode
    const MTWEOFI: libc::c_short = 35;

    if !(nofm || !fsync_flag) {
        return;
    }
    let fd = file.as_raw_fd();
    let mut cmd = MtOp {
        mt_op: if fsync_flag { MTWEOF } else { MTWEOFI },
        mt_count: if nofm { 0 } else { 1 },
    };
    let res = unsafe { libc::ioctl(fd, MTIOCTOP as _, &cmd) };
    if res != 0 {
        debug!(
            "MTWEOF{} {} failed: {}",
            if fsync_flag { "" } else { "I" },
            cmd.mt_count,
            io::Error::last_os_error()
        );
        if nofm && !fsync_flag {
            debug!("trying MTBSR 0 instead");
            cmd.mt_op = MTBSR;
            let res = unsafe { libc::ioctl(fd, MTIOCTOP as _, &cmd) };
            if res != 0 {
                warn!(
                    "MTBSR 0 failed: {} (filemark will be written when tape file is closed)",
                    io::Error::last_os_error()
                );
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn tape_close_output(_file: &File, _nofm: bool, _fsync_flag: bool) {}

/// Open IFILE per its detected kind and the input flags. Pass-through
/// sides come back without a port; the caller supplies one.
pub fn open_input(op: &Opts) -> Result<Side> {
    if op.inf == "-" {
        debug!(" >> Input file type: fifo [stdin, stdout, named pipe]");
        return Ok(Side::from_stream(FileKind::Fifo, ByteStream::Stdin(io::stdin())));
    }
    let mut kind = detect_kind(&op.inf);
    if kind == FileKind::Missing {
        return Err(CopyError::file(format!("unable to access {}", op.inf)));
    }
    if kind == FileKind::DevNull {
        return Err(CopyError::file(format!(
            "cannot read from the null device {}",
            op.inf
        )));
    }
    if op.iflag.pt {
        if kind == FileKind::Tape {
            return Err(CopyError::file(format!(
                "SCSI tape device {} not supported via pt",
                op.inf
            )));
        }
        if matches!(kind, FileKind::Block | FileKind::Other) {
            kind = FileKind::Passthrough;
        }
    }
    debug!(" >> Input file type: {}", kind.description());
    if kind != FileKind::Passthrough && op.rdprotect != 0 {
        warn!("rdprotect ignored on non-pt device");
    }
    if kind == FileKind::Passthrough {
        return Ok(Side {
            kind,
            stream: None,
            pt: None,
        });
    }

    let mut oo = OpenOptions::new();
    oo.read(true);
    let mut flags = 0;
    if op.iflag.direct {
        flags |= libc::O_DIRECT;
    }
    if op.iflag.excl {
        flags |= libc::O_EXCL;
    }
    if op.iflag.sync {
        flags |= libc::O_SYNC;
    }
    oo.custom_flags(flags);
    let file = oo.open(&op.inf).map_err(|e| {
        CopyError::file(format!("could not open {} for reading: {}", op.inf, e))
    })?;
    trace!("open {}, flags=0x{:x}", op.inf, flags);
    if op.iflag.nocache > 0 {
        fadvise_sequential(&file);
    }
    if op.iflag.flock {
        flock_exclusive(&file, &op.inf)?;
    }
    Ok(Side::from_stream(kind, ByteStream::File(file)))
}

/// Open OFILE per its detected kind and the output flags.
pub fn open_output(op: &Opts) -> Result<Side> {
    if op.outf == "-" {
        debug!(" >> Output file type: fifo [stdin, stdout, named pipe]");
        return Ok(Side::from_stream(
            FileKind::Fifo,
            ByteStream::Stdout(io::stdout()),
        ));
    }
    let mut kind = detect_kind(&op.outf);
    if op.oflag.pt {
        if kind == FileKind::Tape {
            return Err(CopyError::file(format!(
                "SCSI tape device {} not supported via pt",
                op.outf
            )));
        }
        if matches!(kind, FileKind::Block | FileKind::Other) {
            kind = FileKind::Passthrough;
        }
    }
    debug!(" >> Output file type: {}", kind.description());
    if kind != FileKind::Passthrough && op.wrprotect != 0 {
        warn!("wrprotect ignored on non-pt device");
    }
    match kind {
        FileKind::Passthrough => Ok(Side {
            kind,
            stream: None,
            pt: None,
        }),
        FileKind::DevNull => Ok(Side::null()),
        _ => {
            // typically a regular file or a block device node
            let exists = kind != FileKind::Missing;
            let mut oo = OpenOptions::new();
            if op.oflag.sparing {
                oo.read(true).write(true);
            } else {
                oo.write(true);
            }
            if !exists {
                oo.create(true);
            }
            let mut flags = 0;
            if op.oflag.direct {
                flags |= libc::O_DIRECT;
            }
            if op.oflag.excl {
                flags |= libc::O_EXCL;
            }
            if op.oflag.sync {
                flags |= libc::O_SYNC;
            }
            if op.oflag.append {
                flags |= libc::O_APPEND;
            }
            let mut needs_ftruncate = false;
            let mut trunc_offset = 0;
            if kind == FileKind::Regular && exists && op.oflag.trunc && !op.oflag.nowrite {
                if op.seek > 0 {
                    trunc_offset = op.seek * op.obs as i64;
                    let cur = std::fs::metadata(&op.outf).map(|m| m.len()).unwrap_or(0);
                    // only truncate to shorten
                    if cur as i64 > trunc_offset {
                        needs_ftruncate = true;
                    }
                } else {
                    oo.truncate(true);
                }
            }
            oo.custom_flags(flags);
            let file = oo.open(&op.outf).map_err(|e| {
                CopyError::file(format!("could not open {} for writing: {}", op.outf, e))
            })?;
            if needs_ftruncate && trunc_offset > 0 {
                file.set_len(trunc_offset as u64).map_err(|e| {
                    CopyError::file(format!(
                        "could not ftruncate {} after open (seek): {}",
                        op.outf, e
                    ))
                })?;
                trace!("truncated file at byte offset {}", trunc_offset);
            }
            let kind = if exists { kind } else { FileKind::Regular };
            trace!(
                "{} {}, flags=0x{:x}",
                if exists { "open" } else { "create" },
                op.outf,
                flags
            );
            if op.oflag.flock {
                flock_exclusive(&file, &op.outf)?;
            }
            Ok(Side::from_stream(kind, ByteStream::File(file)))
        }
    }
}

/// Open OFILE2, which must be a regular file or a fifo.
pub fn open_output2(path: &str) -> Result<Option<Side>> {
    if path == "-" {
        debug!(" >> Output 2 file type: fifo [stdin, stdout, named pipe]");
        return Ok(Some(Side::from_stream(
            FileKind::Fifo,
            ByteStream::Stdout(io::stdout()),
        )));
    }
    let kind = detect_kind(path);
    match kind {
        FileKind::DevNull => Ok(None),
        FileKind::Regular | FileKind::Fifo | FileKind::Missing => {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .open(path)
                .map_err(|e| {
                    CopyError::file(format!("could not open {} for writing: {}", path, e))
                })?;
            debug!(" >> Output 2 file type: regular");
            let kind = if kind == FileKind::Missing {
                FileKind::Regular
            } else {
                kind
            };
            Ok(Some(Side::from_stream(kind, ByteStream::File(file))))
        }
        _ => Err(CopyError::file(
            "output 2 file type must be regular file or fifo",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn test_detect_kind_basics() {
        assert_eq!(detect_kind("."), FileKind::DevNull);
        assert_eq!(detect_kind("/definitely/not/here"), FileKind::Missing);

        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("f.bin");
        std::fs::write(&p, b"x").unwrap();
        assert_eq!(detect_kind(p.to_str().unwrap()), FileKind::Regular);
        assert_eq!(detect_kind(dir.path().to_str().unwrap()), FileKind::Other);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_detect_kind_dev_null() {
        assert_eq!(detect_kind("/dev/null"), FileKind::DevNull);
    }

    #[test]
    fn test_retry_intr_counts() {
        let mut retries = 0u32;
        let mut attempts = 0;
        let res = retry_intr(&mut retries, || {
            attempts += 1;
            if attempts < 3 {
                Err(io::Error::from(io::ErrorKind::Interrupted))
            } else {
                Ok(attempts)
            }
        });
        assert_eq!(res.unwrap(), 3);
        assert_eq!(retries, 2);
    }

    #[test]
    fn test_faulty_file_read_boundaries() {
        let mut tf = tempfile::NamedTempFile::new().unwrap();
        tf.write_all(&[0xAA; 2048]).unwrap();
        let file = File::open(tf.path()).unwrap();
        let mut faulty = FaultyFile {
            file,
            bad: vec![512..1024],
        };
        let mut buf = [0u8; 1024];
        // first read stops short at the bad range
        let n = faulty.read(&mut buf).unwrap();
        assert_eq!(n, 512);
        // reading at the bad range fails with EIO
        let err = faulty.read(&mut buf).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EIO));
        // past the bad range all is well again
        faulty.file.seek(SeekFrom::Start(1024)).unwrap();
        let n = faulty.read(&mut buf).unwrap();
        assert_eq!(n, 1024);
    }
}
