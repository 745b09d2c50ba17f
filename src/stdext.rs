//! Output and process primitives that stay usable from a fault handler:
//! no locks, no buffering, straight `write(2)` calls.

use core::fmt::Write;
use core::{ffi, fmt};

pub struct LibCStderrWriter;

impl Write for LibCStderrWriter {
    fn write_str(&mut self, mut s: &str) -> fmt::Result {
        loop {
            let r = unsafe { libc::write(libc::STDERR_FILENO, s.as_ptr().cast(), s.len()) };
            if r < 0 {
                return Err(fmt::Error);
            }
            if r == 0 {
                return Ok(());
            }
            s = &s[(r as usize)..];
        }
    }
}

pub fn eprint(args: fmt::Arguments<'_>) -> fmt::Result {
    write!(LibCStderrWriter, "{}", args)
}

macro_rules! report {
    ($($tt:tt)*) => {
        // We separate out the format_args for rust-analyzer support.
        match format_args!($($tt)*) {
            args => {
                // Nothing sensible is left to do if stderr is gone.
                let _ = $crate::stdext::eprint(args);
            }
        }
    };
}

pub(crate) use report;

pub(crate) fn abort() -> ! {
    // SAFETY: We abort.
    unsafe { libc::abort() };
}

/// Runs `f` with the system description of `code` (`strerror_r`).
pub(crate) fn with_os_error_str<R>(code: i32, f: impl FnOnce(&str) -> R) -> R {
    let mut buf: [u8; 128] = [0; 128];

    // SAFETY: Our buffer length is passed correctly
    let error = unsafe { libc::strerror_r(code, buf.as_mut_ptr().cast(), buf.len()) };
    if error != 0 {
        return f("<strerror_r returned an error>");
    }
    // SAFETY: strerror_r writes a nul-terminated string to buf, and we zero
    // initialized it in case it wrote nothing.
    let cstr = unsafe { ffi::CStr::from_ptr(buf.as_ptr().cast()) };
    f(cstr
        .to_str()
        .unwrap_or("<error message contained invalid utf8>"))
}
