//! Translation of hardware faults into exceptions.
//!
//! While enabled, SIGFPE, SIGILL, SIGSEGV and SIGBUS are delivered to a
//! handler that builds a typed payload and [`throw`]s it from inside the
//! handler. The throw unwinds out of the signal frame, so a try construct
//! around the faulting code catches the fault like any other exception.
//! Uncaught, it takes the unhandled path and the worker exits; execution
//! never resumes at the faulting instruction.
//!
//! The handler runs on whatever the fault interrupted. It only reads the
//! signal info and throws; the throw path is the one piece of the runtime
//! that has to tolerate that.

#[cfg(test)]
mod tests;

use core::ffi::{c_int, c_void, CStr};
use core::{fmt, mem, ptr};
use std::cell::Cell;
use std::io;
use std::sync::{Mutex, PoisonError, TryLockError};

use crate::error::Error;
use crate::except::{throw, Thrown};
use crate::identify::identify;
use crate::stdext;

// si_code values, from asm-generic/siginfo.h.
const FPE_INTDIV: c_int = 1;
const FPE_INTOVF: c_int = 2;
const FPE_FLTDIV: c_int = 3;
const FPE_FLTOVF: c_int = 4;
const FPE_FLTUND: c_int = 5;
const FPE_FLTRES: c_int = 6;
const FPE_FLTINV: c_int = 7;
const FPE_FLTSUB: c_int = 8;
const ILL_BADSTK: c_int = 8;
const BUS_ADRALN: c_int = 1;

const SIGNALS: [c_int; 4] = [libc::SIGFPE, libc::SIGILL, libc::SIGSEGV, libc::SIGBUS];

/// The shape shared by every fault payload.
pub trait Fault: fmt::Display + Copy + 'static {
    fn message(&self) -> &'static str;

    /// The faulting instruction or the faulting data address.
    fn address(&self) -> usize;

    /// The symbol containing [`Fault::address`], when it is code the
    /// dynamic linker knows about.
    fn symbol(&self) -> Option<&'static CStr> {
        identify(self.address())
    }
}

macro_rules! fault_payload {
    ($(#[$meta:meta])* $name:ident, $address:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
        #[error("{message} ({}: {:#x})", stringify!($address), .$address)]
        pub struct $name {
            pub message: &'static str,
            pub $address: usize,
        }

        impl Fault for $name {
            fn message(&self) -> &'static str {
                self.message
            }

            fn address(&self) -> usize {
                self.$address
            }
        }
    };
}

fault_payload! {
    /// SIGFPE: division by zero, overflow and other arithmetic errors.
    /// Usually a bug, but rarely fatal, and safe to catch.
    ArithmeticError, pc
}

fault_payload! {
    /// SIGILL: an illegal, privileged or malformed instruction. Not
    /// something to recover from in general.
    IllegalInstruction, pc
}

fault_payload! {
    /// SIGILL with a corrupted stack.
    StackCorruption, pc
}

fault_payload! {
    /// SIGSEGV, and SIGBUS other than misalignment: memory the program
    /// does not own was accessed.
    AccessViolation, address
}

fault_payload! {
    /// SIGBUS on a misaligned access.
    MisalignedAccess, address
}

fn arithmetic_message(code: c_int) -> &'static str {
    match code {
        FPE_INTDIV => "Integer division by zero.",
        FPE_INTOVF => "Integer overflow.",
        FPE_FLTDIV => "Floating point division by zero.",
        FPE_FLTOVF => "Floating point overflow.",
        FPE_FLTUND => "Floating point underflow.",
        FPE_FLTRES => "Floating point inexact result.",
        FPE_FLTINV => "Invalid floating point operation.",
        FPE_FLTSUB => "Subscript out of range.",
        _ => "Unknown arithmetic exception.",
    }
}

thread_local! {
    static TRANSLATING: Cell<bool> = const { Cell::new(false) };
}

/// Marks the worker as translating a fault until the handler is left,
/// normally or by unwinding.
struct Translating;

impl Translating {
    fn enter() -> Option<Self> {
        if TRANSLATING.replace(true) {
            None
        } else {
            Some(Self)
        }
    }
}

impl Drop for Translating {
    fn drop(&mut self) {
        TRANSLATING.set(false);
    }
}

unsafe extern "C-unwind" fn handle_fault(
    signal: c_int,
    info: *mut libc::siginfo_t,
    _context: *mut c_void,
) {
    let Some(_translating) = Translating::enter() else {
        // Faulted while translating a fault. Hand this one to the default
        // disposition; it fires again as soon as we return.
        abandon(signal);
        return;
    };

    let (code, address) = if info.is_null() {
        (0, 0)
    } else {
        // SAFETY: The kernel hands us a valid siginfo_t for SA_SIGINFO
        // handlers.
        unsafe { ((*info).si_code, (*info).si_addr() as usize) }
    };
    let _span = debug_span!("fault", signal, code, address).entered();

    match signal {
        libc::SIGFPE => throw(ArithmeticError {
            message: arithmetic_message(code),
            pc: address,
        }),
        libc::SIGBUS if code == BUS_ADRALN => throw(MisalignedAccess {
            message: "Invalid address alignment.",
            address,
        }),
        libc::SIGBUS | libc::SIGSEGV => throw(AccessViolation {
            message: "Access violation.",
            address,
        }),
        libc::SIGILL if code == ILL_BADSTK => throw(StackCorruption {
            message: "Internal stack error.",
            pc: address,
        }),
        libc::SIGILL => throw(IllegalInstruction {
            message: "Illegal instruction.",
            pc: address,
        }),
        _ => stdext::abort(),
    }
}

/// Dispositions replaced by [`enable`], in [`SIGNALS`] order.
static PREVIOUS: Mutex<Option<[libc::sigaction; 4]>> = Mutex::new(None);

fn restore(saved: &[libc::sigaction]) {
    for (action, &signal) in saved.iter().zip(SIGNALS.iter()) {
        // SAFETY: `action` was filled in by sigaction for this signal.
        unsafe { libc::sigaction(signal, action, ptr::null_mut()) };
    }
}

/// Gives up translation after a fault inside the handler: `signal` gets the
/// default disposition, the other signals get back what [`enable`] replaced.
fn abandon(signal: c_int) {
    let previous = match PREVIOUS.try_lock() {
        Ok(previous) => Some(previous),
        Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
        // enable or disable holds the lock; leave its state alone.
        Err(TryLockError::WouldBlock) => None,
    };
    if let Some(saved) = previous.and_then(|mut previous| previous.take()) {
        for (action, &other) in saved.iter().zip(SIGNALS.iter()) {
            if other != signal {
                // SAFETY: `action` was filled in by sigaction for `other`.
                unsafe { libc::sigaction(other, action, ptr::null_mut()) };
            }
        }
    }
    // SAFETY: Installing the default disposition is always valid.
    unsafe { libc::signal(signal, libc::SIG_DFL) };
}

/// Starts turning hardware faults into exceptions. Enabling twice is a
/// no-op.
pub fn enable() -> Result<(), Error> {
    let mut previous = PREVIOUS.lock().unwrap_or_else(PoisonError::into_inner);
    if previous.is_some() {
        return Ok(());
    }

    // SAFETY: sigaction is plain old data, all-zero is a valid value.
    let mut saved: [libc::sigaction; 4] = unsafe { mem::zeroed() };
    for (index, &signal) in SIGNALS.iter().enumerate() {
        // SAFETY: sa is fully initialized before use, and the handler has
        // the SA_SIGINFO signature.
        let ret = unsafe {
            let mut sa: libc::sigaction = mem::zeroed();
            // SA_NODEFER keeps the signal mask untouched, since the handler
            // is left by unwinding rather than by sigreturn.
            sa.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER | libc::SA_ONSTACK;
            libc::sigemptyset(&mut sa.sa_mask);
            sa.sa_sigaction = handle_fault
                as unsafe extern "C-unwind" fn(c_int, *mut libc::siginfo_t, *mut c_void)
                as usize;
            libc::sigaction(signal, &sa, &mut saved[index])
        };

        if ret != 0 {
            let source = io::Error::last_os_error();
            restore(&saved[..index]);
            return Err(Error::FaultInstall { signal, source });
        }
    }

    *previous = Some(saved);
    info!("fault translation enabled");
    Ok(())
}

/// Restores the dispositions that were in place before [`enable`].
pub fn disable() {
    let mut previous = PREVIOUS.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(saved) = previous.take() {
        restore(&saved);
        info!("fault translation disabled");
    }
}

/// Whether translation is active. A fault raised while translating another
/// one turns translation off.
pub fn is_enabled() -> bool {
    PREVIOUS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .is_some()
}

/// Human-readable detail for a thrown fault payload.
pub(crate) fn describe(thrown: &Thrown) -> Option<String> {
    fn detail<F: Fault>(fault: F) -> String {
        match fault.symbol() {
            Some(symbol) => format!("{fault} in {}", symbol.to_string_lossy()),
            None => fault.to_string(),
        }
    }

    if let Some(fault) = thrown.downcast::<ArithmeticError>() {
        return Some(detail(fault));
    }
    if let Some(fault) = thrown.downcast::<IllegalInstruction>() {
        return Some(detail(fault));
    }
    if let Some(fault) = thrown.downcast::<StackCorruption>() {
        return Some(detail(fault));
    }
    if let Some(fault) = thrown.downcast::<AccessViolation>() {
        return Some(detail(fault));
    }
    if let Some(fault) = thrown.downcast::<MisalignedAccess>() {
        return Some(detail(fault));
    }
    None
}
