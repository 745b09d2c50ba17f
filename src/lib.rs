//! Structured non-local error handling for Rust workers.
//!
//! Three mechanisms share one unwinding protocol:
//!
//! - [`defer`]/[`recover`]/[`signal_error`]: scope-exit cleanups and
//!   integer error codes that travel to the nearest recovery point.
//! - [`Try`]/[`throw`]/[`rethrow`]: try / catch / finally for small typed
//!   values.
//! - [`fault`]: hardware faults turned into exceptions.
//!
//! Every thread is its own worker with its own chains; nothing is shared
//! between workers except the [`Hooks`] and the fault handler.

#[macro_use]
extern crate tracing;

mod stdext;

pub mod config;
pub mod defer;
mod errno;
mod error;
pub mod except;
pub mod fault;
pub mod hooks;
mod identify;
mod report;
pub mod worker;

use std::sync::atomic::{AtomicBool, Ordering};

pub use config::{Backtraces, Config};
pub use defer::{defer, defer_fn, recover, scope, signal_error, unwind_all, Panic, Scope, DEFER_MAX};
pub use error::Error;
pub use except::{current, rethrow, throw, Thrown, Try, TryAny, TypeTag};
pub use hooks::Hooks;

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Applies `config` to the process and makes the calling thread the main
/// worker. Can be called once.
///
/// None of this is required: every mechanism works on any thread without
/// it, with the default hooks and fault translation off.
pub fn init(config: Config) -> Result<(), Error> {
    if INITIALIZED.swap(true, Ordering::AcqRel) {
        return Err(Error::AlreadyInitialized);
    }
    let _span = info_span!("init", ?config).entered();

    worker::mark_main();
    report::set_backtraces(config.backtraces);
    hooks::install(config.hooks);

    if config.translate_faults {
        if let Err(err) = fault::enable() {
            INITIALIZED.store(false, Ordering::Release);
            return Err(err);
        }
    }

    info!("runtime initialized");
    Ok(())
}
