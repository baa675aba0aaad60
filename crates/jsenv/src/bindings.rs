use std::sync::Arc;

use parking_lot::Mutex;
use rquickjs::{Ctx, Function, Object};
use tracing::{debug, error, info, trace, warn};

use crate::{
    TRACE_TARGET_SCRIPT,
    config::StartupArgs,
    event_loop::{EventLoop, ReadyTask, TaskKind},
};

const PRELUDE: &str = include_str!("prelude.js");
const DISPATCH: &str = "__jsenv_dispatch";

fn platform_name() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        "windows" => "win32",
        os => os,
    }
}

/// Install `process`, `console`, timers and `queueMicrotask` into the
/// context's global object, wired to `event_loop`.
pub fn install(
    ctx: &Ctx<'_>,
    env_id: u64,
    event_loop: &Arc<Mutex<EventLoop>>,
    args: &StartupArgs,
) -> rquickjs::Result<()> {
    let native = Object::new(ctx.clone())?;

    let schedule_loop = Arc::clone(event_loop);
    native.set(
        "schedule",
        Function::new(
            ctx.clone(),
            move |kind: u32, delay: f64| -> rquickjs::Result<u32> {
                let kind = TaskKind::from_code(kind).ok_or_else(|| {
                    rquickjs::Error::new_from_js_message("number", "task kind", "unknown task kind")
                })?;
                Ok(schedule_loop.lock().schedule(kind, delay))
            },
        )?,
    )?;

    let cancel_loop = Arc::clone(event_loop);
    native.set(
        "cancel",
        Function::new(ctx.clone(), move |id: u32| cancel_loop.lock().cancel(id))?,
    )?;

    native.set(
        "log",
        Function::new(ctx.clone(), move |level: u32, message: String| {
            match level {
                0 => trace!(target: TRACE_TARGET_SCRIPT, env = env_id, "{message}"),
                1 => debug!(target: TRACE_TARGET_SCRIPT, env = env_id, "{message}"),
                2 => info!(target: TRACE_TARGET_SCRIPT, env = env_id, "{message}"),
                3 => warn!(target: TRACE_TARGET_SCRIPT, env = env_id, "{message}"),
                _ => error!(target: TRACE_TARGET_SCRIPT, env = env_id, "{message}"),
            }
        })?,
    )?;

    let init: Function<'_> = ctx.eval(PRELUDE)?;
    init.call::<_, ()>((
        native,
        args.argv.clone(),
        args.exec_argv.clone(),
        platform_name(),
        concat!("v", env!("CARGO_PKG_VERSION")),
    ))?;
    Ok(())
}

/// Run the callback registered for `task`.
pub fn dispatch(ctx: &Ctx<'_>, task: ReadyTask) -> rquickjs::Result<()> {
    let dispatch: Function<'_> = ctx.globals().get(DISPATCH)?;
    dispatch.call::<_, ()>((task.id, task.repeat))
}
