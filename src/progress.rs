//! The progress callback exposed by the core.

/// Invoked after each acknowledged data packet.
///
/// `task_index` is the zero-based position of the current file within
/// the batch (always 0 for plain XMODEM); `task_name` is its logical
/// name (empty for XMODEM, which has no filename packet); `total_bytes`
/// and `done_bytes` are the best-known total and the bytes transferred
/// so far.
pub trait Progress {
    /// Reports progress for the packet just acknowledged.
    fn update(&mut self, task_index: u32, task_name: &str, total_bytes: u64, done_bytes: u64);
}

impl<F> Progress for F
where
    F: FnMut(u32, &str, u64, u64),
{
    fn update(&mut self, task_index: u32, task_name: &str, total_bytes: u64, done_bytes: u64) {
        (self)(task_index, task_name, total_bytes, done_bytes)
    }
}
