//! Default diagnostics for the terminal paths.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::sync::atomic::{AtomicU8, Ordering};

use crate::config::Backtraces;
use crate::except::Thrown;
use crate::stdext::report;
use crate::{errno, fault};

static BACKTRACES: AtomicU8 = AtomicU8::new(Backtraces::Env as u8);

pub(crate) fn set_backtraces(backtraces: Backtraces) {
    BACKTRACES.store(backtraces as u8, Ordering::Relaxed);
}

fn capture() -> Option<Backtrace> {
    match Backtraces::from_u8(BACKTRACES.load(Ordering::Relaxed)) {
        Backtraces::Off => None,
        Backtraces::Env => Some(Backtrace::capture()),
        Backtraces::Always => Some(Backtrace::force_capture()),
    }
}

pub(crate) fn panic_message(code: i32) -> String {
    format!(
        "Panic with error {}: {}",
        errno::name_or_unknown(code),
        errno::description(code)
    )
}

/// A signaled error found no recovery point.
pub(crate) fn panic(code: i32) {
    let message = panic_message(code);
    error!(code, "{message}");
    report!("{message}\n");

    match capture() {
        Some(backtrace) if backtrace.status() == BacktraceStatus::Captured => {
            report!("{backtrace}\n");
        }
        Some(_) => report!("Backtrace unavailable (set RUST_BACKTRACE=1 to capture one)\n"),
        None => {}
    }
}

pub(crate) fn unhandled_message(thrown: &Thrown) -> String {
    let mut message = format!("Unhandled exception of type \"{}\"", thrown.type_name());
    if let Some(detail) = fault::describe(thrown) {
        message.push_str(": ");
        message.push_str(&detail);
    }
    message
}

pub(crate) fn unhandled(thrown: &Thrown) {
    report!("{}\n", unhandled_message(thrown));
}

pub(crate) fn unexpected_message(thrown: &Thrown) -> String {
    format!("Unexpected exception of type \"{}\"", thrown.type_name())
}

pub(crate) fn unexpected(thrown: &Thrown) {
    report!("{}\n", unexpected_message(thrown));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::AccessViolation;

    #[test]
    fn panic_message_names_known_codes() {
        assert_eq!(panic_message(libc::EIO), "Panic with error EIO: Input/output error");
    }

    #[test]
    fn panic_message_marks_unknown_codes() {
        let message = panic_message(4242);
        assert!(message.starts_with("Panic with error ???: "), "{message}");
    }

    #[test]
    fn unhandled_message_names_the_type() {
        let thrown = Thrown::new(7i32);
        assert_eq!(unhandled_message(&thrown), "Unhandled exception of type \"i32\"");
        assert_eq!(unexpected_message(&thrown), "Unexpected exception of type \"i32\"");
    }

    #[test]
    fn unhandled_faults_carry_their_message() {
        let thrown = Thrown::new(AccessViolation {
            message: "Access violation.",
            address: 0x10,
        });
        let message = unhandled_message(&thrown);
        assert!(message.contains("AccessViolation"), "{message}");
        assert!(message.contains("Access violation."), "{message}");
    }
}
