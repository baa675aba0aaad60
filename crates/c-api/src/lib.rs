use std::ffi::{CStr, c_char, c_int};

use jsenv::{EnvHandle, PlatformConfig, platform};
use tracing::{level_filters::LevelFilter, trace};
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt};

pub use crate::error::ErrorCode;
use crate::error::{Error, Result};

mod error;

macro_rules! c_try {
    ($expr:expr) => {
        match $expr {
            Ok(val) => val,
            Err(e) => return $crate::error::fail(e),
        }
    };
}

fn init_logging() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .with_env_var("JSENV_LOG")
        .from_env_lossy();
    // A host that already installed a global subscriber keeps it.
    _ = Registry::default()
        .with(
            tracing_subscriber::fmt::Layer::default()
                .with_writer(std::io::stderr)
                .with_filter(filter),
        )
        .try_init();
}

/// Collect `argc` C strings into owned arguments.
///
/// # Safety
///
/// `argv` must point to `argc` valid, null-terminated C strings.
unsafe fn collect_args(argc: c_int, argv: *const *const c_char) -> Result<Vec<String>> {
    let argc = usize::try_from(argc).map_err(|_| Error::InvalidArgument("argc is negative"))?;
    if argc == 0 {
        return Ok(Vec::new());
    }
    if argv.is_null() {
        return Err(Error::InvalidArgument("argv is null"));
    }

    (0..argc)
        .map(|i| {
            let arg = unsafe { *argv.add(i) };
            if arg.is_null() {
                return Err(Error::InvalidArgument("argv entry is null"));
            }
            unsafe { CStr::from_ptr(arg) }
                .to_str()
                .map(str::to_owned)
                .map_err(|_| Error::InvalidArgument("argv entry is not valid UTF-8"))
        })
        .collect()
}

/// Bootstraps the engine platform. Must be called before any environment is
/// created. Also installs a stderr logger filtered by `JSENV_LOG`.
#[unsafe(no_mangle)]
pub extern "C" fn jsenv_init() -> ErrorCode {
    init_logging();
    let config = c_try!(PlatformConfig::from_env());
    c_try!(platform::init(config));
    error::set_success();
    ErrorCode::Ok
}

/// Shuts the platform down for good. Fails while environments are alive.
#[unsafe(no_mangle)]
pub extern "C" fn jsenv_shutdown() -> ErrorCode {
    c_try!(platform::shutdown());
    error::set_success();
    ErrorCode::Ok
}

/// Creates an environment configured by the process-style arguments in
/// `argv` and writes its handle to `out_env`. On failure `out_env` is set
/// to `0`. The handle may be used from any thread; calls on one environment
/// are serialized.
///
/// # Safety
///
/// `argv` must point to `argc` valid, null-terminated C strings, and
/// `out_env` must be valid for writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn jsenv_env_create(
    argc: c_int,
    argv: *const *const c_char,
    out_env: *mut u64,
) -> ErrorCode {
    if out_env.is_null() {
        return error::fail(Error::InvalidArgument("out_env is null"));
    }
    unsafe { out_env.write(0) };

    let args = c_try!(unsafe { collect_args(argc, argv) });
    let handle = c_try!(jsenv::create_environment(args));
    unsafe { out_env.write(handle.into_raw()) };
    error::set_success();
    ErrorCode::Ok
}

/// Destroys an environment. The handle is invalid afterwards.
#[unsafe(no_mangle)]
pub extern "C" fn jsenv_env_destroy(env: u64) -> ErrorCode {
    let handle = c_try!(EnvHandle::from_raw(env).ok_or(jsenv::Error::NoEnv));
    c_try!(jsenv::destroy_environment(handle));
    error::set_success();
    ErrorCode::Ok
}

/// Runs every timer and immediate callback that is ready, then drains the
/// microtask queue. Never blocks.
#[unsafe(no_mangle)]
pub extern "C" fn jsenv_env_tick(env: u64) -> ErrorCode {
    let handle = c_try!(EnvHandle::from_raw(env).ok_or(jsenv::Error::NoEnvironment));
    let stats = c_try!(jsenv::tick(handle));
    trace!(
        env,
        callbacks = stats.callbacks_run,
        microtasks = stats.microtasks_run,
        pending = stats.pending,
        "tick"
    );
    error::set_success();
    ErrorCode::Ok
}

/// Compiles and runs `script` in the environment's global context.
///
/// # Safety
///
/// `script` must be null or a valid, null-terminated C string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn jsenv_env_execute_script(env: u64, script: *const c_char) -> ErrorCode {
    let handle = c_try!(EnvHandle::from_raw(env).ok_or(jsenv::Error::NoEnv));
    if script.is_null() {
        return error::fail(jsenv::Error::NoScript);
    }
    let script = unsafe { CStr::from_ptr(script) };
    let script = c_try!(
        script
            .to_str()
            .map_err(|_| Error::InvalidArgument("Script is not valid UTF-8"))
    );
    c_try!(jsenv::execute_script(handle, script));
    error::set_success();
    ErrorCode::Ok
}

/// Copies the outcome message of the last call on this thread into `buffer`
/// and returns its full size including the terminator. Nothing is written
/// when `buffer` is null or `size` is `0`; otherwise the copy is truncated
/// to fit and always null-terminated.
///
/// # Safety
///
/// `buffer` must be null or valid for `size` bytes of writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn jsenv_get_error(buffer: *mut c_char, size: u64) -> u64 {
    unsafe { error::copy_last_error(buffer, size) }
}
