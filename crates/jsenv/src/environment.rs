use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use rquickjs::{Context, Ctx, Runtime};
use tracing::{debug, info_span, warn};

use crate::{
    bindings,
    config::{EnvironmentConfig, StartupArgs},
    error::{Error, Result},
    event_loop::EventLoop,
    heap::{AllocatorBinding, HeapUsage},
    platform::PlatformLease,
    script,
};

const DEFAULT_SCRIPT_NAME: &str = "<script>";

static NEXT_ENV_ID: AtomicU64 = AtomicU64::new(1);

/// Work done by one [`Environment::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickStats {
    pub passes: usize,
    pub callbacks_run: usize,
    pub microtasks_run: usize,
    /// Timers and immediates still scheduled after the tick.
    pub pending: usize,
}

/// Deadline shared with the runtime's interrupt handler, which may be
/// polled from whichever thread is running the environment.
#[derive(Clone, Default)]
struct ExecutionBudget {
    deadline: Arc<Mutex<Option<Instant>>>,
}

impl ExecutionBudget {
    fn arm(&self, timeout: Option<Duration>) {
        *self.deadline.lock() = timeout.map(|timeout| Instant::now() + timeout);
    }

    fn disarm(&self) {
        *self.deadline.lock() = None;
    }

    fn expired(&self) -> bool {
        self.deadline
            .lock()
            .is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// One JavaScript environment: an allocator binding, a runtime (heap), a
/// context and the event loop driving that context's timers.
///
/// An environment is `Send`: it may be moved to, or driven from, any thread,
/// one thread at a time.
pub struct Environment {
    id: u64,
    args: StartupArgs,
    config: EnvironmentConfig,
    budget: ExecutionBudget,
    event_loop: Arc<Mutex<EventLoop>>,
    context: Option<Context>,
    runtime: Option<Runtime>,
    allocator: Option<AllocatorBinding>,
    lease: Option<PlatformLease>,
}

impl Environment {
    /// Create an environment with the platform's default configuration.
    ///
    /// # Errors
    /// Fails if the platform is not running, if `args` carries a malformed
    /// runtime option, or if the engine cannot create the runtime or context.
    pub fn create<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (lease, config) = PlatformLease::acquire()?;
        Self::build(lease, config, StartupArgs::parse(args))
    }

    /// Create an environment with an explicit configuration. Runtime options
    /// in `args` still take precedence.
    ///
    /// # Errors
    /// Same as [`Environment::create`].
    pub fn with_config<I, S>(args: I, config: EnvironmentConfig) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (lease, _) = PlatformLease::acquire()?;
        Self::build(lease, config, StartupArgs::parse(args))
    }

    fn build(lease: PlatformLease, mut config: EnvironmentConfig, args: StartupArgs) -> Result<Self> {
        let id = NEXT_ENV_ID.fetch_add(1, Ordering::Relaxed);
        let _span = info_span!("environment.create", env = id).entered();
        args.apply(&mut config)?;

        let mut allocator =
            AllocatorBinding::new(config.max_memory, config.max_stack_size, config.gc_threshold);
        let runtime = Runtime::new()?;
        allocator.bind(&runtime);

        let budget = ExecutionBudget::default();
        let interrupt = budget.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || interrupt.expired())));

        let context = Context::full(&runtime)?;
        let event_loop = Arc::new(Mutex::new(EventLoop::new(Arc::clone(&config.clock))));
        context.with(|ctx| {
            bindings::install(&ctx, id, &event_loop, &args).map_err(|err| Error::from_engine(&ctx, err))
        })?;
        allocator.observe(&runtime);

        debug!(env = id, argv = ?args.argv, exec_argv = ?args.exec_argv, "environment created");
        Ok(Self {
            id,
            args,
            config,
            budget,
            event_loop,
            context: Some(context),
            runtime: Some(runtime),
            allocator: Some(allocator),
            lease: Some(lease),
        })
    }

    pub const fn id(&self) -> u64 {
        self.id
    }

    pub const fn args(&self) -> &StartupArgs {
        &self.args
    }

    pub const fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    /// Run pending timer and immediate callbacks that are ready now, then
    /// drain the microtask queue. Never waits for future timers.
    ///
    /// # Errors
    /// Returns [`Error::Exception`] if a callback throws; the remaining work
    /// stays queued for the next tick. Returns [`Error::Timeout`] if the
    /// execution budget runs out inside a callback.
    pub fn tick(&mut self) -> Result<TickStats> {
        let context = self.context.as_ref().ok_or(Error::NoIsolate)?;
        let event_loop = &self.event_loop;
        let budget = &self.budget;
        let timeout = self.config.script_timeout;
        let max_passes = self.config.max_tick_passes;
        let now = event_loop.lock().now_ms();

        let mut stats = TickStats::default();
        let result = context.with(|ctx| {
            // Continuations left behind by the last script run go first.
            budget.arm(timeout);
            stats.microtasks_run += drain_microtasks(&ctx);
            budget.disarm();

            while stats.passes < max_passes {
                let queued = event_loop.lock().begin_pass(now);
                if queued == 0 {
                    break;
                }
                stats.passes += 1;
                loop {
                    // The lock is released before the callback can schedule more.
                    let next = event_loop.lock().next_ready(now);
                    let Some(task) = next else {
                        break;
                    };
                    budget.arm(timeout);
                    let outcome = bindings::dispatch(&ctx, task);
                    stats.callbacks_run += 1;
                    if let Err(err) = outcome {
                        let err = Self::caught(&ctx, budget, err);
                        budget.disarm();
                        return Err(err);
                    }
                    stats.microtasks_run += drain_microtasks(&ctx);
                    budget.disarm();
                }
            }
            budget.arm(timeout);
            stats.microtasks_run += drain_microtasks(&ctx);
            budget.disarm();
            Ok(())
        });

        stats.pending = self.event_loop.lock().pending();
        self.observe_heap();
        if let Err(err) = &result {
            warn!(env = self.id, %err, "uncaught error in event loop callback");
        }
        result.map(|()| stats)
    }

    /// Compile and run `source` in this environment's context.
    ///
    /// # Errors
    /// [`Error::Compilation`] on a syntax error, [`Error::Exception`] if the
    /// script throws, [`Error::Timeout`] if the execution budget runs out.
    pub fn execute_script(&mut self, source: &str) -> Result<()> {
        self.execute_script_named(DEFAULT_SCRIPT_NAME, source)
    }

    /// Like [`Environment::execute_script`], with `name` used as the file name
    /// in stack traces.
    ///
    /// # Errors
    /// Same as [`Environment::execute_script`].
    pub fn execute_script_named(&mut self, name: &str, source: &str) -> Result<()> {
        let context = self.context.as_ref().ok_or(Error::NoIsolate)?;
        let _span = info_span!("environment.execute", env = self.id, script = name).entered();

        let budget = &self.budget;
        budget.arm(self.config.script_timeout);
        let result = context.with(|ctx| {
            script::compile_and_run(&ctx, source, name).map_err(|err| match err {
                Error::Exception { .. } if budget.expired() => Error::Timeout,
                err => err,
            })
        });
        budget.disarm();
        self.observe_heap();

        if let Err(Error::Compilation { message }) = &result {
            debug!(env = self.id, %message, "script failed to compile");
        }
        result
    }

    /// Run `f` inside this environment's context, e.g. to install host
    /// functions or read globals.
    ///
    /// # Errors
    /// Returns [`Error::NoIsolate`] if the environment is being torn down.
    pub fn with_context<F, R>(&self, f: F) -> Result<R>
    where
        F: for<'js> FnOnce(Ctx<'js>) -> R + Send,
        R: Send,
    {
        let context = self.context.as_ref().ok_or(Error::NoIsolate)?;
        Ok(context.with(f))
    }

    pub fn has_pending_work(&self) -> bool {
        self.event_loop.lock().has_pending()
            || self.runtime.as_ref().is_some_and(Runtime::is_job_pending)
    }

    /// Earliest clock time at which [`Environment::tick`] will find a timer
    /// or immediate to run.
    pub fn next_deadline_ms(&self) -> Option<u64> {
        self.event_loop.lock().next_deadline_ms()
    }

    pub fn heap_usage(&self) -> HeapUsage {
        self.allocator
            .as_ref()
            .map(AllocatorBinding::usage)
            .unwrap_or_default()
    }

    /// Tear the environment down. Equivalent to dropping it.
    pub fn destroy(self) {
        drop(self);
    }

    fn caught(ctx: &Ctx<'_>, budget: &ExecutionBudget, err: rquickjs::Error) -> Error {
        let err = Error::from_engine(ctx, err);
        if budget.expired() { Error::Timeout } else { err }
    }

    fn observe_heap(&mut self) {
        if let (Some(allocator), Some(runtime)) = (self.allocator.as_mut(), self.runtime.as_ref()) {
            allocator.observe(runtime);
        }
    }

    /// Release resources in order: loop and context, then the runtime, then
    /// the allocator binding, then the platform lease. Running it twice is a
    /// no-op.
    pub(crate) fn teardown(&mut self) {
        if self.lease.is_none() {
            return;
        }
        let _span = info_span!("environment.destroy", env = self.id).entered();

        self.event_loop.lock().clear();
        if let Some(context) = self.context.take() {
            drop(context);
            debug!(env = self.id, "context released");
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.run_gc();
            if let Some(allocator) = self.allocator.as_mut() {
                allocator.observe(&runtime);
            }
            drop(runtime);
            debug!(env = self.id, "runtime disposed");
        }
        if let Some(allocator) = self.allocator.take() {
            allocator.release(self.id);
        }
        self.lease = None;
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn drain_microtasks(ctx: &Ctx<'_>) -> usize {
    let mut count = 0;
    while ctx.execute_pending_job() {
        count += 1;
    }
    count
}
