use std::io;

use crate::defer::DEFER_MAX;
use crate::stdext::{self, report};

/// Errors returned while setting the runtime up.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("catchwind::init was already called in this process")]
    AlreadyInitialized,
    #[error("could not install the fault handler for signal {signal}: {source}")]
    FaultInstall {
        signal: i32,
        #[source]
        source: io::Error,
    },
}

/// Runtime-internal conditions that are never recoverable.
#[derive(Debug, thiserror::Error)]
pub(crate) enum Fatal {
    #[error("tried to defer more than {} handlers", DEFER_MAX)]
    FrameOverflow,
    #[error("signal_error called with error code 0")]
    ZeroErrorCode,
    #[error("rethrow called without an exception in flight")]
    RethrowWithoutException,
    #[error("exception unwind arrived without an exception in flight")]
    MissingException,
}

/// Reports `fatal` and aborts the whole process.
#[cold]
pub(crate) fn fatal(fatal: Fatal) -> ! {
    error!(%fatal, "fatal runtime error");
    report!("catchwind: fatal runtime error: {fatal}\n");
    stdext::abort();
}
