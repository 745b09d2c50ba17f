//! Worker boundaries.
//!
//! A worker is a thread running under [`run`] (or started with [`spawn`]).
//! The boundary is where [`exit`] lands, and leaving it runs every cleanup
//! still registered on the worker.

use core::marker::PhantomData;
use std::cell::Cell;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::sync::OnceLock;
use std::thread::{self, JoinHandle, ThreadId};

use crate::{defer, except};

/// Unwind payload of a worker exit.
pub(crate) struct WorkerExit {
    code: i32,
}

thread_local! {
    static BOUNDARIES: Cell<usize> = const { Cell::new(0) };
}

static MAIN: OnceLock<ThreadId> = OnceLock::new();

pub(crate) fn mark_main() {
    let _ = MAIN.set(thread::current().id());
}

/// Whether this is the main worker: the thread that called
/// [`init`](crate::init), or the thread named `main` before that.
pub fn is_main() -> bool {
    let current = thread::current();
    match MAIN.get() {
        Some(main) => *main == current.id(),
        None => current.name() == Some("main"),
    }
}

/// Per-worker state for a thread that is not started through [`run`].
/// Dropping it runs every cleanup still registered on the thread.
#[must_use = "the worker is torn down as soon as the guard is dropped"]
#[derive(Debug)]
pub struct WorkerGuard {
    depth: usize,
    _not_send: PhantomData<*const ()>,
}

/// Initializes the calling thread as a worker.
pub fn init() -> WorkerGuard {
    // Touch the chains now, so a fault handler never initializes them.
    let depth = defer::depth();
    let _ = except::context::depth();
    let _ = except::current();
    trace!(depth, "worker initialized");
    WorkerGuard {
        depth,
        _not_send: PhantomData,
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        defer::unwind_to(self.depth);
        trace!("worker torn down");
    }
}

/// Runs `f` as a worker on the calling thread.
///
/// Returns 0 when `f` returns, or the code given to [`exit`]. Rust panics
/// that are not worker exits keep unwinding after teardown.
pub fn run(f: impl FnOnce()) -> i32 {
    let _span = debug_span!("worker", thread = ?thread::current().id()).entered();
    let guard = init();

    BOUNDARIES.set(BOUNDARIES.get() + 1);
    let result = panic::catch_unwind(AssertUnwindSafe(f));
    BOUNDARIES.set(BOUNDARIES.get() - 1);

    drop(guard);

    match result {
        Ok(()) => 0,
        Err(payload) => match payload.downcast::<WorkerExit>() {
            Ok(exit) => {
                debug!(code = exit.code, "worker exited");
                exit.code
            }
            Err(payload) => panic::resume_unwind(payload),
        },
    }
}

/// A worker running on its own thread.
#[derive(Debug)]
pub struct Worker {
    handle: JoinHandle<i32>,
}

impl Worker {
    /// Waits for the worker and returns its exit code.
    pub fn join(self) -> thread::Result<i32> {
        self.handle.join()
    }

    pub fn thread(&self) -> &thread::Thread {
        self.handle.thread()
    }
}

/// Starts `f` as a worker on a new thread.
pub fn spawn<F>(f: F) -> io::Result<Worker>
where
    F: FnOnce() + Send + 'static,
{
    let handle = thread::Builder::new()
        .name("catchwind-worker".into())
        .spawn(move || run(f))?;
    Ok(Worker { handle })
}

/// Exits the current worker with `code`.
///
/// Inside a worker boundary this unwinds to it: cleanups run, finally
/// blocks are skipped. Outside one, the remaining cleanups run and then the
/// main worker exits the process, while any other thread unwinds out.
pub fn exit(code: i32) -> ! {
    if BOUNDARIES.get() > 0 {
        debug!(code, "worker exit");
        panic::resume_unwind(Box::new(WorkerExit { code }));
    }

    defer::unwind_all();
    if is_main() {
        warn!(code, "main worker exiting the process");
        process::exit(code);
    }
    panic::resume_unwind(Box::new(WorkerExit { code }))
}
