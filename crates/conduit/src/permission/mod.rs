pub mod monitor;
pub mod policy;

pub use monitor::{evaluate, MonitorAction, ToolMonitor};
pub use policy::{validate_limits, PolicySource, RunPolicy, StaticPolicySource, ToolPolicy};
