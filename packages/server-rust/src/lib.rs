//! `cfgplane` Server — the appliance configuration daemon and its cloud queue.
//!
//! Subsystems:
//!
//! - **Engine** ([`engine`]): atomic batch execution over the property tree
//! - **Store** ([`store`]): snapshot + journal persistence, recovery, compaction
//! - **Expiry** ([`expiry`]): TTL min-heap and the firing task
//! - **Notify** ([`notify`]): regex subscriptions and event fan-out
//! - **RPC** ([`rpc`]): UNIX-socket endpoint and client
//! - **Queue** ([`queue`]): per-site durable command FIFO with audit log
//! - **Reconcile** ([`reconcile`]): the fetch/apply/complete loop
//! - **Shutdown** ([`shutdown`]): run-state coordination and drains

pub mod config;
pub mod engine;
pub mod expiry;
pub mod notify;
pub mod queue;
pub mod reconcile;
pub mod rpc;
pub mod shutdown;
pub mod store;

pub use config::{CompactionConfig, LrpcConfig, QueueConfig, ServerConfig};
pub use engine::{BatchError, ConfigEngine, ExecOutcome};
pub use expiry::{run_expiry, ExpirySchedule};
pub use notify::{KindFilter, Notification, NotificationBus, SubscriptionHandle};
pub use queue::{run_lease_reaper, Command, CommandState, CommandStore, MemoryCommandStore};
pub use reconcile::{CommandChannel, Reconciler, StoreChannel};
pub use rpc::{ConfigClient, LrpcServer, MonitorStream};
pub use shutdown::{RunState, ShutdownCoordinator};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
