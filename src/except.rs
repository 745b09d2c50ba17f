//! try / catch / finally for typed values.
//!
//! A [`Try`] construct links a context onto the worker's chain and moves
//! through four stages:
//!
//! | stage     | runs                                                      |
//! |-----------|-----------------------------------------------------------|
//! | try       | the body; a [`throw`] inside it lands in the catch stage  |
//! | catch     | the first clause whose type matches the in-flight value   |
//! | finally   | always                                                    |
//! | propagate | unlinks the context, re-throws anything still pending     |
//!
//! Catch clauses are tried in declaration order and match on exact type
//! identity. A wildcard clause ([`Try::catch_any`]) ends the clause list;
//! the builder it returns has no `catch` method, so nothing can be declared
//! after it.
//!
//! Throwing from inside a catch or finally body, or from a diagnostic hook,
//! never reaches another clause: it goes straight to the unexpected path,
//! which terminates the worker.

pub(crate) mod context;
mod thrown;


use core::marker::PhantomData;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use self::context::Stage;
pub use self::thrown::{current, Thrown, TypeTag, MAX_THROWABLE_ALIGN, MAX_THROWABLE_SIZE};
use crate::error::{fatal, Fatal};
use crate::hooks;
use crate::worker::WorkerExit;

/// Unwind payload of a thrown exception. The value itself stays in the
/// worker's thrown slot.
pub(crate) struct ExceptionUnwind;

/// Throws `value` to the nearest enclosing try construct.
///
/// `T` has to fit in [`MAX_THROWABLE_SIZE`] bytes; larger types are
/// rejected at compile time. With no enclosing construct the exception is
/// unhandled and the worker exits.
pub fn throw<T: Copy + 'static>(value: T) -> ! {
    let thrown = Thrown::new(value);
    debug!(r#type = thrown.type_name(), "throw");
    thrown::store(thrown);
    raise()
}

/// Re-throws the exception being handled, keeping its value and type.
///
/// Inside a catch handler the construct's finally still runs before the
/// exception moves on to the enclosing construct.
pub fn rethrow() -> ! {
    if thrown::current().is_none() {
        fatal(Fatal::RethrowWithoutException);
    }
    if context::mark_rethrow() {
        debug!("rethrow");
        panic::resume_unwind(Box::new(ExceptionUnwind));
    }
    raise()
}

/// Delivers the in-flight exception to wherever it has to go next.
pub(crate) fn raise() -> ! {
    if hooks::inside_hook(context::depth()) {
        panic::resume_unwind(Box::new(ExceptionUnwind));
    }

    hooks::notify_throw();

    match context::top_stage() {
        Some(Stage::Try) => panic::resume_unwind(Box::new(ExceptionUnwind)),
        Some(stage) => {
            debug!(?stage, "exception raised while handling another");
            hooks::unexpected()
        }
        None => hooks::unhandled(),
    }
}

trait Clause<R> {
    fn matches(&self, tag: TypeTag) -> bool;
    fn handle(self: Box<Self>, thrown: &Thrown) -> R;
}

struct Typed<T, F> {
    handler: F,
    _type: PhantomData<fn(T)>,
}

impl<T, F, R> Clause<R> for Typed<T, F>
where
    T: Copy + 'static,
    F: FnOnce(T) -> R,
{
    fn matches(&self, tag: TypeTag) -> bool {
        tag == TypeTag::of::<T>()
    }

    fn handle(self: Box<Self>, thrown: &Thrown) -> R {
        // SAFETY: Only called after `matches` accepted the tag.
        let value = unsafe { thrown.read_unchecked::<T>() };
        (self.handler)(value)
    }
}

struct Wildcard<F> {
    handler: F,
}

impl<F, R> Clause<R> for Wildcard<F>
where
    F: FnOnce(&Thrown) -> R,
{
    fn matches(&self, _tag: TypeTag) -> bool {
        true
    }

    fn handle(self: Box<Self>, thrown: &Thrown) -> R {
        (self.handler)(thrown)
    }
}

enum Outcome<R> {
    Value(R),
    Exception,
    /// Some other unwind is crossing the construct.
    Unwind(Box<dyn Any + Send>),
    /// The worker is exiting.
    Terminate(Box<dyn Any + Send>),
}

fn classify<R>(result: std::thread::Result<R>) -> Outcome<R> {
    match result {
        Ok(value) => Outcome::Value(value),
        Err(payload) if payload.is::<ExceptionUnwind>() => Outcome::Exception,
        Err(payload) if payload.is::<WorkerExit>() => Outcome::Terminate(payload),
        Err(payload) => Outcome::Unwind(payload),
    }
}

/// A try construct under construction.
#[must_use = "a try construct does nothing until `run` is called"]
pub struct Try<'a, R> {
    body: Box<dyn FnOnce() -> R + 'a>,
    clauses: Vec<Box<dyn Clause<R> + 'a>>,
    finally: Vec<Box<dyn FnOnce() + 'a>>,
}

impl<'a, R: 'a> Try<'a, R> {
    pub fn new(body: impl FnOnce() -> R + 'a) -> Self {
        Self {
            body: Box::new(body),
            clauses: Vec::new(),
            finally: Vec::new(),
        }
    }

    /// Handles exceptions of type `T`.
    pub fn catch<T: Copy + 'static>(mut self, handler: impl FnOnce(T) -> R + 'a) -> Self {
        self.clauses.push(Box::new(Typed {
            handler,
            _type: PhantomData,
        }));
        self
    }

    /// Handles any exception not matched by an earlier clause.
    pub fn catch_any(mut self, handler: impl FnOnce(&Thrown) -> R + 'a) -> TryAny<'a, R> {
        self.clauses.push(Box::new(Wildcard { handler }));
        TryAny(self)
    }

    /// Runs `f` when the construct finishes, whatever the outcome. Several
    /// finally blocks run in declaration order, all of them even when an
    /// earlier one is left by an unwind.
    pub fn finally(mut self, f: impl FnOnce() + 'a) -> Self {
        self.finally.push(Box::new(f));
        self
    }

    /// Runs the construct. Returns the value of the body, or of the catch
    /// handler that handled the exception; anything unhandled propagates.
    pub fn run(self) -> R {
        let Try {
            body,
            clauses,
            finally,
        } = self;

        let context = context::enter();
        let _span = trace_span!("try", depth = context.depth()).entered();

        let mut outcome = classify(panic::catch_unwind(AssertUnwindSafe(body)));

        if let Outcome::Exception = outcome {
            let Some(thrown) = thrown::current() else {
                fatal(Fatal::MissingException);
            };
            if let Some(clause) = clauses.into_iter().find(|clause| clause.matches(thrown.tag())) {
                trace!(r#type = thrown.type_name(), "catch");
                context.set_stage(Stage::Catch);
                outcome = match classify(panic::catch_unwind(AssertUnwindSafe(|| {
                    clause.handle(&thrown)
                }))) {
                    Outcome::Exception if context.take_rethrow() => Outcome::Exception,
                    Outcome::Exception => hooks::unexpected(),
                    other => other,
                };
            }
        }

        if !matches!(outcome, Outcome::Terminate(_)) && !finally.is_empty() {
            context.set_stage(Stage::Finally);
            // The first unwind out of a finally block wins; the remaining
            // blocks still run before it moves on.
            let mut escaped = None;
            for f in finally {
                match classify(panic::catch_unwind(AssertUnwindSafe(f))) {
                    Outcome::Value(()) => {}
                    Outcome::Exception => hooks::unexpected(),
                    Outcome::Unwind(payload) => {
                        escaped.get_or_insert(payload);
                    }
                    Outcome::Terminate(payload) => {
                        drop(context);
                        panic::resume_unwind(payload)
                    }
                }
            }
            if let Some(payload) = escaped {
                drop(context);
                panic::resume_unwind(payload)
            }
        }

        context.set_stage(Stage::Propagate);
        drop(context);

        match outcome {
            Outcome::Value(value) => value,
            Outcome::Exception => {
                trace!("propagate");
                raise()
            }
            Outcome::Unwind(payload) | Outcome::Terminate(payload) => {
                panic::resume_unwind(payload)
            }
        }
    }
}

/// A try construct whose clause list ends in a wildcard.
#[must_use = "a try construct does nothing until `run` is called"]
pub struct TryAny<'a, R>(Try<'a, R>);

impl<'a, R: 'a> TryAny<'a, R> {
    /// See [`Try::finally`].
    pub fn finally(self, f: impl FnOnce() + 'a) -> Self {
        Self(self.0.finally(f))
    }

    /// See [`Try::run`].
    pub fn run(self) -> R {
        self.0.run()
    }
}
