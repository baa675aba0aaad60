//! Process-wide engine bootstrap.
//!
//! The platform moves through `Uninitialized -> Running -> ShutDown` exactly
//! once per process. Environments can only be created while it is running,
//! and it can only shut down once every environment is gone.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    config::{EnvironmentConfig, PlatformConfig},
    error::{Error, Result},
};

enum State {
    Uninitialized,
    Running(PlatformConfig),
    ShutDown,
}

static STATE: Mutex<State> = parking_lot::const_mutex(State::Uninitialized);
static LIVE_ENVIRONMENTS: AtomicUsize = AtomicUsize::new(0);

/// Initialize the platform. Calling it again while running is a no-op and
/// keeps the original configuration.
///
/// # Errors
/// Returns [`Error::ShutDown`] if the platform was already shut down.
pub fn init(config: PlatformConfig) -> Result<()> {
    let mut state = STATE.lock();
    match *state {
        State::Uninitialized => {
            debug!(?config, "platform initialized");
            *state = State::Running(config);
            Ok(())
        }
        State::Running(_) => Ok(()),
        State::ShutDown => Err(Error::ShutDown),
    }
}

/// Shut the platform down. Idempotent once shut down.
///
/// # Errors
/// Returns [`Error::NotInitialized`] before [`init`], and [`Error::Busy`]
/// while environments are alive.
pub fn shutdown() -> Result<()> {
    let mut state = STATE.lock();
    match *state {
        State::Uninitialized => Err(Error::NotInitialized),
        State::Running(_) => {
            let live = LIVE_ENVIRONMENTS.load(Ordering::SeqCst);
            if live > 0 {
                warn!(live, "platform shutdown refused");
                return Err(Error::Busy { live });
            }
            *state = State::ShutDown;
            info!("platform shut down");
            Ok(())
        }
        State::ShutDown => Ok(()),
    }
}

pub fn is_running() -> bool {
    matches!(*STATE.lock(), State::Running(_))
}

pub fn live_environments() -> usize {
    LIVE_ENVIRONMENTS.load(Ordering::SeqCst)
}

/// Keeps the platform from shutting down while an environment exists.
#[derive(Debug)]
pub(crate) struct PlatformLease {
    _private: (),
}

impl PlatformLease {
    /// Register a new environment and hand back the platform's environment
    /// defaults.
    pub(crate) fn acquire() -> Result<(Self, EnvironmentConfig)> {
        let state = STATE.lock();
        match &*state {
            State::Uninitialized => Err(Error::NotInitialized),
            State::ShutDown => Err(Error::ShutDown),
            State::Running(config) => {
                LIVE_ENVIRONMENTS.fetch_add(1, Ordering::SeqCst);
                Ok((Self { _private: () }, config.environment.clone()))
            }
        }
    }
}

impl Drop for PlatformLease {
    fn drop(&mut self) {
        LIVE_ENVIRONMENTS.fetch_sub(1, Ordering::SeqCst);
    }
}
