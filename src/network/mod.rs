//! Connectivity tracking.

mod monitor;
mod probe;

pub use monitor::{ConnectivityState, NetworkMonitor};
pub use probe::{BackendProbe, Probe};
