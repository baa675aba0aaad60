use std::{fmt, sync::Arc, time::Duration};

use crate::{
    clock::{Clock, MonotonicClock},
    error::{Error, Result},
};

#[derive(Clone)]
pub struct EnvironmentConfig {
    /// Heap limit in bytes. `None` leaves the heap unbounded.
    pub max_memory: Option<usize>,
    pub max_stack_size: usize,
    pub gc_threshold: Option<usize>,
    /// Budget for a single script run or loop callback. `None` lets scripts
    /// run to completion.
    pub script_timeout: Option<Duration>,
    /// Upper bound on loop passes per tick.
    pub max_tick_passes: usize,
    pub clock: Arc<dyn Clock>,
}

impl EnvironmentConfig {
    pub const DEFAULT_MAX_STACK_SIZE: usize = 2 * 1024 * 1024;
    pub const DEFAULT_MAX_TICK_PASSES: usize = 64;

    #[must_use]
    pub const fn max_memory(mut self, max_memory: Option<usize>) -> Self {
        self.max_memory = max_memory;
        self
    }

    #[must_use]
    pub const fn max_stack_size(mut self, max_stack_size: usize) -> Self {
        self.max_stack_size = max_stack_size;
        self
    }

    #[must_use]
    pub const fn gc_threshold(mut self, gc_threshold: Option<usize>) -> Self {
        self.gc_threshold = gc_threshold;
        self
    }

    #[must_use]
    pub const fn script_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.script_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn max_tick_passes(mut self, passes: usize) -> Self {
        self.max_tick_passes = passes;
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            max_memory: None,
            max_stack_size: Self::DEFAULT_MAX_STACK_SIZE,
            gc_threshold: None,
            script_timeout: None,
            max_tick_passes: Self::DEFAULT_MAX_TICK_PASSES,
            clock: Arc::new(MonotonicClock::new()),
        }
    }
}

impl fmt::Debug for EnvironmentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvironmentConfig")
            .field("max_memory", &self.max_memory)
            .field("max_stack_size", &self.max_stack_size)
            .field("gc_threshold", &self.gc_threshold)
            .field("script_timeout", &self.script_timeout)
            .field("max_tick_passes", &self.max_tick_passes)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, Default)]
pub struct PlatformConfig {
    /// Defaults for every environment created on this platform.
    pub environment: EnvironmentConfig,
}

impl PlatformConfig {
    /// Defaults overridden by `JSENV_MAX_MEMORY`, `JSENV_STACK_SIZE`,
    /// `JSENV_GC_THRESHOLD` (all bytes) and `JSENV_SCRIPT_TIMEOUT_MS`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if a variable is set but is not a
    /// number.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let parse = |name: &str, what: &'static str| -> Result<Option<usize>> {
            lookup(name)
                .map(|value| {
                    value
                        .trim()
                        .parse::<usize>()
                        .map_err(|_| Error::InvalidArgument(what))
                })
                .transpose()
        };

        let mut environment = EnvironmentConfig::default();
        if let Some(max_memory) = parse("JSENV_MAX_MEMORY", "JSENV_MAX_MEMORY is not a number")? {
            environment.max_memory = Some(max_memory);
        }
        if let Some(stack) = parse("JSENV_STACK_SIZE", "JSENV_STACK_SIZE is not a number")? {
            environment.max_stack_size = stack;
        }
        if let Some(threshold) =
            parse("JSENV_GC_THRESHOLD", "JSENV_GC_THRESHOLD is not a number")?
        {
            environment.gc_threshold = Some(threshold);
        }
        if let Some(timeout) = parse(
            "JSENV_SCRIPT_TIMEOUT_MS",
            "JSENV_SCRIPT_TIMEOUT_MS is not a number",
        )? {
            environment.script_timeout = Some(Duration::from_millis(timeout as u64));
        }
        Ok(Self { environment })
    }
}

/// Process-style startup arguments, split the way `node` splits them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StartupArgs {
    /// Program name followed by the positional arguments.
    pub argv: Vec<String>,
    /// Runtime options given before the first positional argument.
    pub exec_argv: Vec<String>,
}

impl StartupArgs {
    pub fn parse<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut args = args.into_iter().map(Into::into);
        let mut parsed = Self::default();
        let Some(program) = args.next() else {
            return parsed;
        };
        parsed.argv.push(program);

        let mut options_done = false;
        for arg in args {
            if options_done {
                parsed.argv.push(arg);
            } else if arg == "--" {
                options_done = true;
            } else if arg.starts_with('-') && arg.len() > 1 {
                parsed.exec_argv.push(arg);
            } else {
                options_done = true;
                parsed.argv.push(arg);
            }
        }
        parsed
    }

    /// Apply the recognised runtime options to `config`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if a recognised option has a
    /// malformed value.
    pub fn apply(&self, config: &mut EnvironmentConfig) -> Result<()> {
        for option in &self.exec_argv {
            let Some((name, value)) = option.split_once('=') else {
                continue;
            };
            match name {
                "--max-old-space-size" => {
                    let mib: usize = value
                        .parse()
                        .map_err(|_| Error::InvalidArgument("invalid --max-old-space-size"))?;
                    config.max_memory = Some(mib.saturating_mul(1024 * 1024));
                }
                "--stack-size" => {
                    let kib: usize = value
                        .parse()
                        .map_err(|_| Error::InvalidArgument("invalid --stack-size"))?;
                    config.max_stack_size = kib.saturating_mul(1024);
                }
                _ => {}
            }
        }
        Ok(())
    }
}
