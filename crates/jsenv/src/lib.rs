//! Host-side manager for embedded JavaScript environments.
//!
//! Each environment owns a QuickJS runtime, a context and its own event
//! loop. Hosts bootstrap the [`platform`] once, create environments through
//! the [`registry`], drive them with [`registry::tick`] and
//! [`registry::execute_script`], and destroy them before shutting down.

mod bindings;
pub mod clock;
pub mod config;
pub mod environment;
pub mod error;
pub mod event_loop;
pub mod heap;
pub mod platform;
pub mod registry;
mod script;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{EnvironmentConfig, PlatformConfig, StartupArgs};
pub use environment::{Environment, TickStats};
pub use error::{Error, Result};
pub use heap::HeapUsage;
pub use registry::{
    EnvHandle, create_environment, create_environment_with, destroy_environment, execute_script,
    register_environment, tick, with_environment,
};

/// Tracing target for `console.*` output from scripts.
pub const TRACE_TARGET_SCRIPT: &str = "jsenv::script";
