use std::time::Duration;

/// Backoff schedule for output pipe flushes.
///
/// Each flush sends the frame, waits `initial_backoff` for the ack, then
/// resends with the wait doubled for as long as it stays below
/// `backoff_limit`. The defaults suit a 1 Mbaud bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wait after the first send.
    pub initial_backoff: Duration,
    /// Waits at or above this end the retry loop.
    pub backoff_limit: Duration,
}

impl RetryPolicy {
    /// Wait durations, one per send attempt.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let limit = self.backoff_limit;
        let first = self.initial_backoff.max(Duration::from_millis(1));
        std::iter::successors(Some(first), |delay| delay.checked_mul(2))
            .take_while(move |delay| *delay < limit)
    }

    /// Number of sends a flush makes before giving up.
    pub fn attempts(&self) -> usize {
        self.delays().count()
    }

    /// Longest time a flush can block.
    pub fn budget(&self) -> Duration {
        self.delays().sum()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(10),
            backoff_limit: Duration::from_millis(1500),
        }
    }
}

/// Configuration for a [`crate::Node`].
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's device identifier.
    pub device_id: u64,
    /// Depth of the inbound frame queue.
    pub rx_queue_depth: usize,
    /// How long the TX path waits for the transport to accept a frame.
    pub send_timeout: Duration,
    /// How long one dispatch iteration waits for an inbound frame.
    pub poll_interval: Duration,
    /// Input pipe table capacity.
    pub max_input_pipes: usize,
    /// Output pipe table capacity.
    pub max_output_pipes: usize,
    /// Port draws before `open_input_pipe` gives up.
    pub port_attempts: u32,
    /// Output pipe flush schedule.
    pub retry: RetryPolicy,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            device_id: 0,
            rx_queue_depth: 10,
            send_timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(2),
            max_input_pipes: 8,
            max_output_pipes: 8,
            port_attempts: 64,
            retry: RetryPolicy::default(),
        }
    }
}

/// Configuration for a [`crate::Worker`].
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Thread name.
    pub name: String,
    /// Job queue depth.
    pub queue_depth: usize,
    /// Wait between idle callback runs when the queue is empty.
    pub idle_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "jdpipe-worker".to_string(),
            queue_depth: 20,
            idle_interval: Duration::from_millis(20),
        }
    }
}
