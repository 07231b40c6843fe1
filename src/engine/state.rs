//! Per-chunk state of the copy loop.

/// Why the loop is being left. A tape short read is deliberately *not* one
/// of these: it only changes how the rest of the iteration is handled, and
/// the loop keeps going afterwards (see `CopyState::tape_short_read`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeaveReason {
    /// Natural end of file / end of copy.
    #[default]
    Eof,
    MediumHard,
    FileError,
    Other,
}

/// Mutable state for one iteration of the copy loop. Created once at loop
/// entry and updated in place; the byte counters are reset at the top of
/// each iteration while the file positions persist across iterations.
#[derive(Debug, Default)]
pub struct CopyState {
    /// input blocks actually read this iteration (<= bpt)
    pub icbpt: i32,
    /// output blocks corresponding to icbpt * ibs bytes, rounded down
    pub ocbpt: i32,
    /// bytes beyond ocbpt * obs forming a short final write
    pub partial_write_bytes: i32,

    /// byte offset we believe the input descriptor points at
    pub if_filepos: i64,
    /// byte offset we believe the output descriptor points at
    pub of_filepos: i64,

    pub bytes_read: i32,
    pub bytes_of: i32,
    pub bytes_of2: i32,

    /// request loop exit once this iteration's writes are done
    pub leave_after_write: bool,
    pub leave_reason: LeaveReason,
    /// tape files are written block-for-block; a short tape read is normal
    /// mid-stream and the loop continues
    pub tape_short_read: bool,
}
