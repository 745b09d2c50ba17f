//! Process-wide diagnostic hooks, and the two terminal paths they observe.
//!
//! The hooks are meant to be installed once at startup, before additional
//! workers exist. Replacing them later is memory-safe but racy in effect:
//! a worker may still run the previous hook.

use core::fmt;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use crate::defer::PanicUnwind;
use crate::error::{fatal, Fatal};
use crate::except::{self, context, ExceptionUnwind, Thrown};
use crate::worker::{self, WorkerExit};
use crate::report;

pub type Hook = Arc<dyn Fn(&Thrown) + Send + Sync>;

/// The set of diagnostic hooks. Unset slots use the default behavior.
#[derive(Clone, Default)]
pub struct Hooks {
    on_throw: Option<Hook>,
    on_unhandled: Option<Hook>,
    on_unexpected: Option<Hook>,
}

impl Hooks {
    pub const fn new() -> Self {
        Self {
            on_throw: None,
            on_unhandled: None,
            on_unexpected: None,
        }
    }

    /// Called for every throw, including rethrows and propagation to an
    /// enclosing construct.
    pub fn on_throw(mut self, hook: impl Fn(&Thrown) + Send + Sync + 'static) -> Self {
        self.on_throw = Some(Arc::new(hook));
        self
    }

    /// Called when an exception reaches the top of a worker uncaught.
    pub fn on_unhandled(mut self, hook: impl Fn(&Thrown) + Send + Sync + 'static) -> Self {
        self.on_unhandled = Some(Arc::new(hook));
        self
    }

    /// Called when a catch or finally body, or another hook, throws.
    pub fn on_unexpected(mut self, hook: impl Fn(&Thrown) + Send + Sync + 'static) -> Self {
        self.on_unexpected = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_throw", &self.on_throw.is_some())
            .field("on_unhandled", &self.on_unhandled.is_some())
            .field("on_unexpected", &self.on_unexpected.is_some())
            .finish()
    }
}

static HOOKS: RwLock<Hooks> = RwLock::new(Hooks::new());

/// Replaces the installed hooks.
pub fn install(hooks: Hooks) {
    debug!(?hooks, "hooks installed");
    *HOOKS.write().unwrap_or_else(PoisonError::into_inner) = hooks;
}

/// Restores the default behavior for every hook.
pub fn reset() {
    install(Hooks::new());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Throw,
    Unhandled,
    Unexpected,
}

fn get(slot: Slot) -> Option<Hook> {
    let hooks = HOOKS.read().unwrap_or_else(PoisonError::into_inner);
    match slot {
        Slot::Throw => hooks.on_throw.clone(),
        Slot::Unhandled => hooks.on_unhandled.clone(),
        Slot::Unexpected => hooks.on_unexpected.clone(),
    }
}

fn clear(slot: Slot) {
    let mut hooks = HOOKS.write().unwrap_or_else(PoisonError::into_inner);
    match slot {
        Slot::Throw => hooks.on_throw = None,
        Slot::Unhandled => hooks.on_unhandled = None,
        Slot::Unexpected => hooks.on_unexpected = None,
    }
}

thread_local! {
    /// Context depth at which the innermost running hook was entered.
    static HOOK_BOUNDARY: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Whether a throw at context `depth` would escape the running hook.
pub(crate) fn inside_hook(depth: usize) -> bool {
    HOOK_BOUNDARY.get().is_some_and(|boundary| depth <= boundary)
}

/// Runs `hook`. An exception escaping it, or a Rust panic, is a failure.
fn call(slot: Slot, hook: &Hook, thrown: &Thrown) -> Result<(), ()> {
    let saved = HOOK_BOUNDARY.replace(Some(context::depth()));
    let result = panic::catch_unwind(AssertUnwindSafe(|| hook(thrown)));
    HOOK_BOUNDARY.set(saved);

    match result {
        Ok(()) => Ok(()),
        Err(payload) if payload.is::<ExceptionUnwind>() => {
            warn!(?slot, "hook threw");
            Err(())
        }
        Err(payload) if payload.is::<PanicUnwind>() || payload.is::<WorkerExit>() => {
            panic::resume_unwind(payload)
        }
        Err(_) => {
            warn!(?slot, "hook panicked");
            Err(())
        }
    }
}

fn in_flight() -> Thrown {
    match except::current() {
        Some(thrown) => thrown,
        None => fatal(Fatal::MissingException),
    }
}

pub(crate) fn notify_throw() {
    let Some(hook) = get(Slot::Throw) else {
        return;
    };
    if call(Slot::Throw, &hook, &in_flight()).is_err() {
        unexpected();
    }
}

/// The exception reached the top of the worker. Terminal.
pub(crate) fn unhandled() -> ! {
    let thrown = in_flight();
    error!(r#type = thrown.type_name(), "unhandled exception");

    match get(Slot::Unhandled) {
        Some(hook) => {
            if call(Slot::Unhandled, &hook, &thrown).is_err() {
                unexpected();
            }
        }
        None => report::unhandled(&thrown),
    }

    worker::exit(libc::EXIT_FAILURE)
}

/// An exception was raised while handling another. Terminal.
pub(crate) fn unexpected() -> ! {
    let thrown = in_flight();
    error!(r#type = thrown.type_name(), "unexpected exception");

    match get(Slot::Unexpected) {
        Some(hook) => {
            if call(Slot::Unexpected, &hook, &thrown).is_err() {
                warn!("on_unexpected hook failed, falling back to the default");
                clear(Slot::Unexpected);
                unexpected();
            }
        }
        None => report::unexpected(&thrown),
    }

    worker::exit(libc::EXIT_FAILURE)
}
