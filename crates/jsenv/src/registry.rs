//! Handle-addressed table of environments.
//!
//! Environments live in a process-wide arena, so a handle may be used from
//! any thread. A handle packs the slot index with the slot's generation, so a
//! handle to a destroyed environment stays dead even after its slot is
//! reused.
//!
//! The table lock is only held to look a handle up. Each environment has its
//! own lock, held while it runs, so different environments run in parallel
//! and calls on one environment are serialized.

use std::{cell::Cell, fmt, num::NonZeroU64, sync::Arc};

use parking_lot::{Mutex, const_mutex};
use tracing::debug;

use crate::{
    config::EnvironmentConfig,
    environment::{Environment, TickStats},
    error::{Error, Result},
};

/// Opaque, non-null environment handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnvHandle(NonZeroU64);

impl EnvHandle {
    fn new(index: u32, generation: u32) -> Self {
        let raw = (u64::from(generation) << 32) | (u64::from(index) + 1);
        // The low word is at least one, so `raw` is never zero.
        Self(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    /// Rebuild a handle from its integer form; `0` is the null handle.
    pub const fn from_raw(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }

    pub const fn into_raw(self) -> u64 {
        self.0.get()
    }

    fn index(self) -> Option<usize> {
        let low = (self.0.get() & u64::from(u32::MAX)) as u32;
        low.checked_sub(1).map(|index| index as usize)
    }

    const fn generation(self) -> u32 {
        (self.0.get() >> 32) as u32
    }
}

impl fmt::Debug for EnvHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnvHandle({:#x})", self.0)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Generation-checked arena.
pub(crate) struct Slots<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> Slots<T> {
    pub(crate) const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub(crate) fn insert(&mut self, value: T) -> Result<EnvHandle> {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return Ok(EnvHandle::new(index, slot.generation));
        }
        let index = u32::try_from(self.slots.len())
            .ok()
            .filter(|index| *index < u32::MAX)
            .ok_or(Error::InvalidArgument("environment registry is full"))?;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        Ok(EnvHandle::new(index, 0))
    }

    fn slot(&self, handle: EnvHandle) -> Option<&Slot<T>> {
        self.slots
            .get(handle.index()?)
            .filter(|slot| slot.generation == handle.generation())
    }

    pub(crate) fn contains(&self, handle: EnvHandle) -> bool {
        self.slot(handle).is_some_and(|slot| slot.value.is_some())
    }

    pub(crate) fn get(&self, handle: EnvHandle) -> Option<&T> {
        self.slot(handle)?.value.as_ref()
    }

    pub(crate) fn remove(&mut self, handle: EnvHandle) -> Option<T> {
        let index = handle.index()?;
        let slot = self
            .slots
            .get_mut(index)
            .filter(|slot| slot.generation == handle.generation())?;
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        #[allow(clippy::cast_possible_truncation)]
        self.free.push(index as u32);
        Some(value)
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

type Shared = Arc<Mutex<Environment>>;

static REGISTRY: Mutex<Slots<Shared>> = const_mutex(Slots::new());

thread_local! {
    /// Set while this thread is inside an environment.
    static ENTERED: Cell<bool> = const { Cell::new(false) };
}

struct EnteredGuard;

impl EnteredGuard {
    fn enter() -> Result<Self> {
        if ENTERED.replace(true) {
            return Err(Error::Reentrant);
        }
        Ok(Self)
    }
}

impl Drop for EnteredGuard {
    fn drop(&mut self) {
        ENTERED.set(false);
    }
}

fn lookup(handle: EnvHandle) -> Option<Shared> {
    REGISTRY.lock().get(handle).cloned()
}

fn insert(env: Environment) -> Result<EnvHandle> {
    let id = env.id();
    let handle = REGISTRY.lock().insert(Arc::new(Mutex::new(env)))?;
    debug!(env = id, ?handle, "environment registered");
    Ok(handle)
}

/// Create an environment and register it.
///
/// # Errors
/// See [`Environment::create`]. Returns [`Error::Reentrant`] when called
/// from inside a script callback.
pub fn create_environment<I, S>(args: I) -> Result<EnvHandle>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let _entered = EnteredGuard::enter()?;
    // Built before the table is locked; a failed build leaves no entry.
    insert(Environment::create(args)?)
}

/// Like [`create_environment`], with an explicit configuration.
///
/// # Errors
/// See [`Environment::with_config`].
pub fn create_environment_with<I, S>(args: I, config: EnvironmentConfig) -> Result<EnvHandle>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let _entered = EnteredGuard::enter()?;
    insert(Environment::with_config(args, config)?)
}

/// Register an environment built by the caller.
///
/// # Errors
/// Returns [`Error::Reentrant`] when called from inside a script callback.
pub fn register_environment(env: Environment) -> Result<EnvHandle> {
    let _entered = EnteredGuard::enter()?;
    insert(env)
}

/// Unregister and tear down an environment. The handle is dead before
/// teardown starts. If another thread is running the environment, teardown
/// waits for it to finish.
///
/// # Errors
/// Returns [`Error::NoEnv`] for an unknown or already destroyed handle.
pub fn destroy_environment(handle: EnvHandle) -> Result<()> {
    let _entered = EnteredGuard::enter()?;
    let env = REGISTRY.lock().remove(handle).ok_or(Error::NoEnv)?;
    env.lock().teardown();
    debug!(?handle, "environment unregistered");
    Ok(())
}

/// Run `f` against a live environment, on the calling thread.
///
/// # Errors
/// Returns [`Error::NoIsolate`] for an unknown or destroyed handle and
/// [`Error::Reentrant`] when called from inside a script callback.
pub fn with_environment<R>(handle: EnvHandle, f: impl FnOnce(&mut Environment) -> R) -> Result<R> {
    let _entered = EnteredGuard::enter()?;
    let env = lookup(handle).ok_or(Error::NoIsolate)?;
    let mut env = env.lock();
    Ok(f(&mut env))
}

/// Advance the environment's event loop. See [`Environment::tick`].
///
/// # Errors
/// Returns [`Error::NoIsolate`] for an unknown or destroyed handle, or the
/// failure of the tick itself.
pub fn tick(handle: EnvHandle) -> Result<TickStats> {
    with_environment(handle, Environment::tick)?
}

/// Compile and run `source` in the environment's context.
///
/// # Errors
/// Returns [`Error::NoIsolate`] for an unknown or destroyed handle, or the
/// failure of the script itself.
pub fn execute_script(handle: EnvHandle, source: &str) -> Result<()> {
    with_environment(handle, |env| env.execute_script(source))?
}

pub fn is_live(handle: EnvHandle) -> bool {
    REGISTRY.lock().contains(handle)
}

/// Number of registered environments, across all threads.
pub fn registered_environments() -> usize {
    REGISTRY.lock().len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_never_zero() {
        let mut slots = Slots::new();
        let handle = slots.insert("a").unwrap();
        assert_ne!(handle.into_raw(), 0);
        assert_eq!(EnvHandle::from_raw(handle.into_raw()), Some(handle));
        assert_eq!(EnvHandle::from_raw(0), None);
    }

    #[test]
    fn removed_handle_is_dead() {
        let mut slots = Slots::new();
        let handle = slots.insert(1).unwrap();
        assert_eq!(slots.remove(handle), Some(1));
        assert_eq!(slots.remove(handle), None);
        assert!(slots.get(handle).is_none());
        assert!(!slots.contains(handle));
        assert_eq!(slots.len(), 0);
    }

    #[test]
    fn reused_slot_rejects_stale_handle() {
        let mut slots = Slots::new();
        let first = slots.insert("first").unwrap();
        slots.remove(first);
        let second = slots.insert("second").unwrap();

        assert_eq!(first.index(), second.index());
        assert_ne!(first, second);
        assert!(slots.get(first).is_none());
        assert_eq!(slots.get(second).copied(), Some("second"));
    }

    #[test]
    fn handles_address_their_own_slot() {
        let mut slots = Slots::new();
        let a = slots.insert(10).unwrap();
        let b = slots.insert(20).unwrap();

        assert_eq!(slots.get(a).copied(), Some(10));
        assert_eq!(slots.get(b).copied(), Some(20));
        assert_eq!(slots.len(), 2);
    }

    #[test]
    fn forged_handles_are_unknown() {
        let mut slots: Slots<u8> = Slots::new();
        slots.insert(1).unwrap();

        let no_index = EnvHandle::from_raw(1 << 32).unwrap();
        let out_of_range = EnvHandle::from_raw(99).unwrap();
        assert!(slots.get(no_index).is_none());
        assert!(slots.get(out_of_range).is_none());
        assert_eq!(slots.remove(out_of_range), None);
    }
}
