use rquickjs::{Coerced, FromJs};
use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// Null handle passed to destroy or execute, or an unknown handle passed
    /// to destroy.
    #[error("No env")]
    NoEnv,

    /// Null handle passed to tick.
    #[error("No environment")]
    NoEnvironment,

    #[error("No script")]
    NoScript,

    /// The handle does not name a live environment (never created, or
    /// already destroyed).
    #[error("No isolate")]
    NoIsolate,

    /// The source failed to parse. `message` keeps the engine's diagnostic.
    #[error("Compilation error")]
    Compilation { message: String },

    /// Uncaught error thrown while running a script or a loop callback.
    #[error("Uncaught exception: {message}")]
    Exception {
        message: String,
        stack: Option<String>,
    },

    #[error("Execution budget exceeded")]
    Timeout,

    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Platform not initialized")]
    NotInitialized,

    #[error("Platform already shut down")]
    ShutDown,

    #[error("Platform busy: {live} live environment(s)")]
    Busy { live: usize },

    #[error("Environment registry re-entered from a script callback")]
    Reentrant,

    #[error("engine error: {0}")]
    Engine(#[from] rquickjs::Error),
}

impl Error {
    /// Take the pending exception out of `ctx`.
    pub(crate) fn from_js_catch(ctx: &rquickjs::Ctx<'_>) -> Self {
        let caught = ctx.catch();
        if let Some(exc) = caught.as_exception() {
            return Self::Exception {
                message: exc.message().unwrap_or_default(),
                stack: exc.stack(),
            };
        }
        // Thrown non-Error values are reported the way `String(value)` would.
        let message = match Coerced::<String>::from_js(ctx, caught) {
            Ok(Coerced(message)) => message,
            Err(_) => {
                // A throwing `toString` leaves its own exception pending.
                let _ = ctx.catch();
                "non-error value thrown".to_string()
            }
        };
        Self::Exception {
            message,
            stack: None,
        }
    }

    /// Resolve an engine error, pulling the thrown value out of `ctx` when
    /// the engine reports a pending exception.
    pub(crate) fn from_engine(ctx: &rquickjs::Ctx<'_>, err: rquickjs::Error) -> Self {
        match err {
            rquickjs::Error::Exception => Self::from_js_catch(ctx),
            err => Self::Engine(err),
        }
    }

    pub(crate) fn compilation_from_js_catch(ctx: &rquickjs::Ctx<'_>) -> Self {
        match Self::from_js_catch(ctx) {
            Self::Exception { message, .. } => Self::Compilation { message },
            other => other,
        }
    }
}
