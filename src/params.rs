// ABOUTME: Tunable protocol parameters shared by client and server endpoints
// ABOUTME: Controls epoch timing, liveness thresholds and sliding window size

use std::time::Duration;

/// Configuration for LSP connection behavior.
///
/// Controls the epoch-based liveness/retransmission timer and the sliding
/// window used for flow control. An `Params` is attached to every
/// [`crate::Client`] or [`crate::Server`] at construction and applies to all
/// connections on that endpoint.
///
/// # Example
///
/// ```rust
/// use lsp::Params;
/// use std::time::Duration;
///
/// // Default configuration (2s epoch, 5 silent epochs, window of 1)
/// let params = Params::default();
///
/// // Custom configuration
/// let params = Params::new(Duration::from_millis(50))
///     .with_epoch_limit(10)
///     .with_window_size(8);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Params {
    /// Interval between epoch ticks (default: 2s).
    ///
    /// Each tick drives retransmission of unacknowledged data and advances
    /// the silent-epoch counter used to detect a lost connection.
    pub epoch_interval: Duration,

    /// Number of consecutive silent epochs tolerated before a connection is
    /// declared lost (default: 5).
    pub epoch_limit: u32,

    /// Maximum number of unacknowledged data frames a connection may have
    /// outstanding at once (default: 1).
    pub window_size: u32,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            epoch_interval: Duration::from_millis(2000),
            epoch_limit: 5,
            window_size: 1,
        }
    }
}

impl Params {
    /// Create new params with a custom epoch interval; other fields keep
    /// their defaults.
    pub fn new(epoch_interval: Duration) -> Self {
        Self {
            epoch_interval,
            ..Self::default()
        }
    }

    /// Set the epoch interval in milliseconds.
    pub fn with_epoch_millis(mut self, millis: u64) -> Self {
        self.epoch_interval = Duration::from_millis(millis);
        self
    }

    /// Set the number of silent epochs tolerated before declaring a
    /// connection lost.
    pub fn with_epoch_limit(mut self, limit: u32) -> Self {
        self.epoch_limit = limit;
        self
    }

    /// Set the sliding window size.
    pub fn with_window_size(mut self, size: u32) -> Self {
        self.window_size = size;
        self
    }
}
