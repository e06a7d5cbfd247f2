//! Server-level configuration for the appliance daemon.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for `cfgd` and its subsystems.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory holding `tree.snap` and `tree.jrn`.
    pub data_dir: PathBuf,
    /// UNIX-domain socket the local RPC endpoint listens on.
    pub socket_path: PathBuf,
    /// Optional JSON schema file extending the baseline validation rules.
    pub schema_path: Option<PathBuf>,
    /// Local RPC timeouts.
    pub lrpc: LrpcConfig,
    /// Per-subscription buffer capacity on the notification bus.
    pub bus_capacity: usize,
    /// How long the bus may spend draining buffers at shutdown.
    pub drain_timeout: Duration,
    /// Snapshot/journal compaction tuning.
    pub compaction: CompactionConfig,
    /// Cloud command queue and reconciler tuning.
    pub queue: QueueConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/cfgd"),
            socket_path: PathBuf::from("/run/cfgd/cfgd.sock"),
            schema_path: None,
            lrpc: LrpcConfig::default(),
            bus_capacity: 256,
            drain_timeout: Duration::from_secs(5),
            compaction: CompactionConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

/// Timeouts for the local RPC endpoint. Overridable at runtime through
/// `@/settings/cfgd/{send_timeout,recv_timeout,open_timeout}`.
#[derive(Debug, Clone)]
pub struct LrpcConfig {
    /// Maximum time to push a reply frame to a client.
    pub send_timeout: Duration,
    /// Maximum time to wait for a request frame on an open connection.
    pub recv_timeout: Duration,
    /// Maximum time a client waits for the socket to accept.
    pub open_timeout: Duration,
}

impl Default for LrpcConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_millis(10),
            recv_timeout: Duration::from_secs(30),
            open_timeout: Duration::from_secs(1),
        }
    }
}

/// Compaction scheduling.
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Interval between compaction checks.
    pub interval: Duration,
    /// Journal size that triggers compaction ahead of the interval.
    pub journal_high_water: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            journal_high_water: 4 * 1024 * 1024,
        }
    }
}

/// Cloud command queue and reconciler tuning.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long a fetched command may stay in WORK before its lease lapses.
    pub lease_window: Duration,
    /// Lease lapses after which a command is cancelled with TIMEOUT.
    pub max_retries: u32,
    /// Reconciler poll interval when the queue is empty.
    pub poll_interval: Duration,
    /// Initial reconnect backoff.
    pub backoff_initial: Duration,
    /// Reconnect backoff cap.
    pub backoff_cap: Duration,
    /// Interval between lease-reaper sweeps.
    pub reap_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_window: Duration::from_secs(120),
            max_retries: 3,
            poll_interval: Duration::from_secs(5),
            backoff_initial: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            reap_interval: Duration::from_secs(30),
        }
    }
}
