//! Scope-exit handlers with a panic/recover unwinding protocol.
//!
//! Every worker owns a stack of frames. A frame is pushed when a [`Scope`]
//! guard is created and popped when it is dropped, which runs the cleanups
//! registered with [`defer`] in reverse order of registration. Dropping the
//! guard is also what happens when an unwind crosses the scope, so the same
//! chain is both the scoped-release mechanism and the unwinding protocol.
//!
//! [`signal_error`] looks for a frame armed by [`recover`]. If there is one,
//! control transfers straight to it (every frame in between runs its cleanups
//! on the way). If there is none, every cleanup on the worker runs, the error
//! is reported and the worker exits with the error code.


use core::{fmt, marker::PhantomData};
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};

use crate::error::{fatal, Fatal};
use crate::{errno, report, worker};

/// The maximum number of cleanups a single frame can hold.
pub const DEFER_MAX: usize = 16;

type Cleanup = Box<dyn FnOnce()>;

struct Frame {
    entries: [Option<Cleanup>; DEFER_MAX],
    count: usize,
    /// Set for frames created by [`recover`].
    recoverable: bool,
    /// All cleanups have run.
    completed: bool,
}

impl Frame {
    fn new(recoverable: bool) -> Self {
        Self {
            entries: Default::default(),
            count: 0,
            recoverable,
            completed: false,
        }
    }

    fn register(&mut self, cleanup: Cleanup) -> Result<(), Cleanup> {
        if self.count == DEFER_MAX {
            return Err(cleanup);
        }
        self.entries[self.count] = Some(cleanup);
        self.count += 1;
        Ok(())
    }

    fn take_last(&mut self) -> Option<Cleanup> {
        while self.count > 0 {
            self.count -= 1;
            if let Some(cleanup) = self.entries[self.count].take() {
                return Some(cleanup);
            }
        }
        self.completed = true;
        None
    }
}

/// The worker's frames. Whatever is still registered when the thread exits
/// runs from the thread-local destructor.
struct Chain {
    frames: RefCell<Vec<Frame>>,
}

impl Drop for Chain {
    fn drop(&mut self) {
        let frames = core::mem::take(self.frames.get_mut());
        if frames.is_empty() {
            return;
        }
        trace!(frames = frames.len(), "running cleanups at thread exit");
        for mut frame in frames.into_iter().rev() {
            while let Some(cleanup) = frame.take_last() {
                cleanup();
            }
        }
    }
}

thread_local! {
    static FRAMES: Chain = const {
        Chain {
            frames: RefCell::new(Vec::new()),
        }
    };
}

/// Runs `f` on this worker's frames. `None` once the chain is being torn
/// down at thread exit.
fn with_frames<R>(f: impl FnOnce(&mut Vec<Frame>) -> R) -> Option<R> {
    FRAMES
        .try_with(|chain| f(&mut chain.frames.borrow_mut()))
        .ok()
}

/// Unwind payload carrying a signaled error to its recovery point.
pub(crate) struct PanicUnwind {
    code: i32,
}

enum Step {
    Run(Cleanup),
    Popped,
    Done,
}

/// Pops every frame at index `depth` and above, running cleanups LIFO.
///
/// The chain is never borrowed while a cleanup runs, so cleanups may
/// register cleanups or open scopes of their own.
pub(crate) fn unwind_to(depth: usize) {
    loop {
        let step = with_frames(|frames| {
            if frames.len() <= depth {
                return Step::Done;
            }
            let top = frames.len() - 1;
            match frames[top].take_last() {
                Some(cleanup) => Step::Run(cleanup),
                None => {
                    if let Some(frame) = frames.pop() {
                        trace!(
                            depth = top,
                            recoverable = frame.recoverable,
                            completed = frame.completed,
                            "frame popped"
                        );
                    }
                    Step::Popped
                }
            }
        })
        .unwrap_or(Step::Done);

        match step {
            Step::Run(cleanup) => cleanup(),
            Step::Popped => {}
            Step::Done => break,
        }
    }
}

/// Number of live frames on this worker.
pub(crate) fn depth() -> usize {
    with_frames(|frames| frames.len()).unwrap_or(0)
}

/// A live frame. Dropping it runs the frame's cleanups and pops it.
#[must_use = "the frame is popped as soon as the guard is dropped"]
pub struct Scope {
    depth: usize,
    _not_send: PhantomData<*const ()>,
}

impl Scope {
    /// Pushes a new frame on this worker's chain.
    pub fn enter() -> Self {
        Self::push(false)
    }

    fn push(recoverable: bool) -> Self {
        let depth = with_frames(|frames| {
            frames.push(Frame::new(recoverable));
            frames.len() - 1
        })
        .unwrap_or(0);
        trace!(depth, recoverable, "frame pushed");
        Self {
            depth,
            _not_send: PhantomData,
        }
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        unwind_to(self.depth);
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope").field("depth", &self.depth).finish()
    }
}

/// Runs `f` inside a fresh frame.
pub fn scope<R>(f: impl FnOnce() -> R) -> R {
    let _scope = Scope::enter();
    f()
}

/// Registers `cleanup` to run when the current frame exits.
///
/// A worker without any frame gets a root frame on first use; its cleanups
/// run when the worker finishes, or when the thread exits. Registering more
/// than [`DEFER_MAX`] cleanups in one frame aborts the process.
///
/// A cleanup registered while the thread is already exiting runs at once.
pub fn defer_fn(cleanup: impl FnOnce() + 'static) {
    let mut cleanup: Option<Cleanup> = Some(Box::new(cleanup));
    let registered = with_frames(|frames| {
        if frames.is_empty() {
            trace!("root frame created on first use");
            frames.push(Frame::new(false));
        }
        let top = frames.len() - 1;
        match cleanup.take() {
            Some(cleanup) => frames[top].register(cleanup).is_ok(),
            None => true,
        }
    });

    match registered {
        Some(true) => {}
        Some(false) => fatal(Fatal::FrameOverflow),
        None => {
            if let Some(cleanup) = cleanup {
                cleanup();
            }
        }
    }
}

/// Registers `cleanup(arg)` to run when the current frame exits and hands
/// `arg` back, so acquisition and release can sit on one line.
pub fn defer<A: Clone + 'static>(cleanup: fn(A), arg: A) -> A {
    let owned = arg.clone();
    defer_fn(move || cleanup(owned));
    arg
}

/// Runs `body` in a frame armed as a recovery point.
///
/// Returns `Ok` when `body` completes, or the [`Panic`] raised by a
/// [`signal_error`] anywhere below it. Frames between the signal and this
/// point have run their cleanups by then; cleanups registered directly in
/// the recovering frame run once, when this function returns.
pub fn recover<R>(body: impl FnOnce() -> R) -> Result<R, Panic> {
    let scope = Scope::push(true);
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(value) => Ok(value),
        Err(payload) => match payload.downcast::<PanicUnwind>() {
            Ok(unwind) => {
                debug!(code = unwind.code, depth = scope.depth, "recovered");
                Err(Panic { code: unwind.code })
            }
            Err(payload) => {
                drop(scope);
                panic::resume_unwind(payload)
            }
        },
    }
}

/// Signals a serious error condition. `code` must not be 0.
///
/// Resumes the nearest [`recover`] with `code`. Without one, runs every
/// cleanup on the worker, reports the error and exits the worker with
/// `code`.
pub fn signal_error(code: i32) -> ! {
    if code == 0 {
        fatal(Fatal::ZeroErrorCode);
    }

    let target = with_frames(|frames| frames.iter().rposition(|frame| frame.recoverable)).flatten();
    if let Some(depth) = target {
        debug!(code, depth, "signal_error: unwinding to recovery point");
        panic::resume_unwind(Box::new(PanicUnwind { code }));
    }

    debug!(code, "signal_error: no recovery point");
    unwind_all();
    report::panic(code);
    worker::exit(code)
}

/// Runs every remaining cleanup on this worker, ignoring recovery points.
pub fn unwind_all() {
    unwind_to(0);
}

/// An error code delivered to a recovery point by [`signal_error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("panic with error {}: {}", self.name(), self.description())]
pub struct Panic {
    code: i32,
}

impl Panic {
    pub fn code(&self) -> i32 {
        self.code
    }

    /// Symbolic name of the code, `???` when it is not a known system code.
    pub fn name(&self) -> &'static str {
        errno::name_or_unknown(self.code)
    }

    pub fn description(&self) -> String {
        errno::description(self.code)
    }
}
