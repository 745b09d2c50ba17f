//! The per-worker chain of active try constructs.

use core::marker::PhantomData;
use std::cell::RefCell;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    Try,
    Catch,
    Finally,
    Propagate,
}

#[derive(Debug, Clone, Copy)]
struct Context {
    stage: Stage,
    rethrow: bool,
}

thread_local! {
    static CONTEXTS: RefCell<Vec<Context>> = const { RefCell::new(Vec::new()) };
}

/// A linked context. Dropping it unlinks the context and everything
/// linked after it.
pub(crate) struct ContextGuard {
    depth: usize,
    _not_send: PhantomData<*const ()>,
}

pub(crate) fn enter() -> ContextGuard {
    let depth = CONTEXTS.with_borrow_mut(|contexts| {
        contexts.push(Context {
            stage: Stage::Try,
            rethrow: false,
        });
        contexts.len() - 1
    });
    trace!(depth, "context linked");
    ContextGuard {
        depth,
        _not_send: PhantomData,
    }
}

impl ContextGuard {
    pub(crate) fn depth(&self) -> usize {
        self.depth
    }

    pub(crate) fn set_stage(&self, stage: Stage) {
        CONTEXTS.with_borrow_mut(|contexts| {
            if let Some(context) = contexts.get_mut(self.depth) {
                context.stage = stage;
            }
        });
    }

    /// Consumes the rethrow request left by [`mark_rethrow`].
    pub(crate) fn take_rethrow(&self) -> bool {
        CONTEXTS.with_borrow_mut(|contexts| match contexts.get_mut(self.depth) {
            Some(context) => core::mem::take(&mut context.rethrow),
            None => false,
        })
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CONTEXTS.with_borrow_mut(|contexts| contexts.truncate(self.depth));
        trace!(depth = self.depth, "context unlinked");
    }
}

/// Number of linked contexts on this worker.
pub(crate) fn depth() -> usize {
    CONTEXTS.with_borrow(Vec::len)
}

/// Stage of the innermost context, `None` when no try construct is active.
pub(crate) fn top_stage() -> Option<Stage> {
    CONTEXTS.with_borrow(|contexts| contexts.last().map(|context| context.stage))
}

/// Asks the innermost context to keep its exception pending. Only valid
/// while that context runs a catch handler.
pub(crate) fn mark_rethrow() -> bool {
    CONTEXTS.with_borrow_mut(|contexts| match contexts.last_mut() {
        Some(context) if context.stage == Stage::Catch => {
            context.rethrow = true;
            true
        }
        _ => false,
    })
}
