//! Transfer records and their state machine.

use std::path::PathBuf;
use std::time::Instant;

use rats_core::PeerHash;
use uuid::Uuid;

/// Which way the bytes flow, from our point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// We stream chunks out
    Sending,
    /// We collect chunks in
    Receiving,
}

/// Lifecycle of a transfer.
///
/// `Completed`, `Failed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Offer sent or received, nothing decided yet
    Pending,
    /// Accepted; streaming is about to begin
    Starting,
    /// Chunks are flowing
    InProgress,
    /// Frozen by either side
    Paused,
    /// Waiting for the remote to pick a resume point
    Resuming,
    /// All bytes over, hash verified
    Completed,
    /// Gave up; see the error field
    Failed,
    /// Abandoned on purpose
    Cancelled,
}

impl TransferStatus {
    /// True for states a transfer never leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }

    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Starting => "starting",
            TransferStatus::InProgress => "in_progress",
            TransferStatus::Paused => "paused",
            TransferStatus::Resuming => "resuming",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
            TransferStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one transfer, handed to callbacks and listings.
#[derive(Debug, Clone)]
pub struct Transfer {
    /// Transfer identity, shared by both ends
    pub id: Uuid,
    /// The other end
    pub peer: PeerHash,
    /// Byte flow direction
    pub direction: TransferDirection,
    /// Offered file name (relative path for directory members)
    pub filename: String,
    /// Local path: source when sending, destination when receiving
    pub path: PathBuf,
    /// Total payload size in bytes
    pub total_bytes: u64,
    /// Chunk size on the wire
    pub chunk_size: u32,
    /// Total number of chunks
    pub chunks_total: u64,
    /// Chunks transferred so far
    pub chunks_done: u64,
    /// Current state
    pub status: TransferStatus,
    /// Failure description, set when status is `Failed`
    pub error: Option<String>,
    /// When the transfer record was created
    pub started_at: Instant,
    /// Smoothed throughput in bytes per second
    pub byte_rate: f64,
    /// Parent transfer for directory members
    pub parent_id: Option<Uuid>,
}

impl Transfer {
    /// Creates a fresh record in `Pending`.
    pub fn new(
        id: Uuid,
        peer: PeerHash,
        direction: TransferDirection,
        filename: String,
        path: PathBuf,
        total_bytes: u64,
        chunk_size: u32,
    ) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            id,
            peer,
            direction,
            filename,
            path,
            total_bytes,
            chunk_size,
            chunks_total: total_bytes.div_ceil(u64::from(chunk_size)),
            chunks_done: 0,
            status: TransferStatus::Pending,
            error: None,
            started_at: Instant::now(),
            byte_rate: 0.0,
            parent_id: None,
        }
    }

    /// Fraction done in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.chunks_total == 0 {
            return 1.0;
        }
        self.chunks_done as f64 / self.chunks_total as f64
    }

    /// Folds a freshly moved chunk into the throughput estimate.
    pub fn record_chunk(&mut self, bytes: u64, elapsed_secs: f64) {
        self.chunks_done += 1;
        if elapsed_secs > 0.0 {
            let instant_rate = bytes as f64 / elapsed_secs;
            self.byte_rate = if self.byte_rate == 0.0 {
                instant_rate
            } else {
                self.byte_rate * 0.8 + instant_rate * 0.2
            };
        }
    }

    /// Moves into `Failed` with a reason.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if !self.status.is_terminal() {
            self.status = TransferStatus::Failed;
            self.error = Some(reason.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(total: u64, chunk: u32) -> Transfer {
        Transfer::new(
            Uuid::new_v4(),
            PeerHash::random(),
            TransferDirection::Sending,
            "f.bin".to_string(),
            PathBuf::from("/tmp/f.bin"),
            total,
            chunk,
        )
    }

    #[test]
    fn test_chunk_count_rounds_up() {
        assert_eq!(transfer(100, 10).chunks_total, 10);
        assert_eq!(transfer(101, 10).chunks_total, 11);
        assert_eq!(transfer(0, 10).chunks_total, 0);
    }

    #[test]
    fn test_progress_bounds() {
        let mut t = transfer(100, 10);
        assert_eq!(t.progress(), 0.0);
        for _ in 0..10 {
            t.record_chunk(10, 0.01);
        }
        assert_eq!(t.progress(), 1.0);

        let empty = transfer(0, 10);
        assert_eq!(empty.progress(), 1.0);
    }

    #[test]
    fn test_rate_smoothing_stays_positive() {
        let mut t = transfer(1000, 10);
        t.record_chunk(10, 0.001);
        let first = t.byte_rate;
        assert!(first > 0.0);
        t.record_chunk(10, 0.001);
        assert!(t.byte_rate > 0.0);
    }

    #[test]
    fn test_fail_is_sticky_after_terminal() {
        let mut t = transfer(100, 10);
        t.status = TransferStatus::Completed;
        t.fail("late failure");
        assert_eq!(t.status, TransferStatus::Completed);
        assert!(t.error.is_none());
    }

    #[test]
    fn test_terminal_states() {
        assert!(TransferStatus::Completed.is_terminal());
        assert!(TransferStatus::Failed.is_terminal());
        assert!(TransferStatus::Cancelled.is_terminal());
        assert!(!TransferStatus::InProgress.is_terminal());
        assert!(!TransferStatus::Paused.is_terminal());
    }
}
