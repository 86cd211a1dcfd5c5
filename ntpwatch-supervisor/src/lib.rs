//! ntpwatch - keeps one NTP sampling process alive per monitored server
//!
//! This crate provides the supervision engine:
//! - Identity resolution of configured server names (forward + reverse lookup)
//! - A reconciliation loop converging running samplers onto the configuration
//! - Per-server sampler processes restarted every time they exit
//! - A shared, hour-rotated CSV output sink

pub mod config;
pub mod identity;
pub mod reconcile;
pub mod sampler;
pub mod sink;
pub mod state;
pub mod supervisor;

pub use config::{ConfigError, ConfigSource, MonitorConfig, SamplerCommand, YamlConfigSource};
pub use identity::{resolve, Resolution, ResolveError, Resolver, ServerIdentity, SystemResolver};
pub use reconcile::{ReconcileOutcome, Reconciler};
pub use sampler::SamplingSpec;
pub use sink::{Clock, OutputSink, SampleRecord, SinkError, SystemClock};
pub use state::{SamplerInfo, SamplerState, SupervisedSet};
pub use supervisor::{DrainReport, Supervisor, SupervisorContext, SupervisorError};
