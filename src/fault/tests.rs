use core::ffi::c_int;
use core::mem;
use std::ptr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::*;
use crate::except::Try;
use crate::worker;

extern "C-unwind" {
    fn raise(sig: c_int) -> c_int;
}

/// Dispositions are process-wide, so every test touching them holds this.
static SERIAL: Mutex<()> = Mutex::new(());

struct Translation {
    _serial: MutexGuard<'static, ()>,
}

impl Translation {
    fn start() -> Self {
        let serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        enable().unwrap();
        Self { _serial: serial }
    }
}

impl Drop for Translation {
    fn drop(&mut self) {
        disable();
    }
}

fn current_action(signal: c_int) -> libc::sigaction {
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        assert_eq!(libc::sigaction(signal, ptr::null(), &mut action), 0);
        action
    }
}

fn handler_address() -> usize {
    handle_fault as unsafe extern "C-unwind" fn(c_int, *mut libc::siginfo_t, *mut c_void) as usize
}

#[test]
fn arithmetic_messages() {
    assert_eq!(arithmetic_message(FPE_INTDIV), "Integer division by zero.");
    assert_eq!(arithmetic_message(FPE_FLTINV), "Invalid floating point operation.");
    assert_eq!(arithmetic_message(FPE_FLTSUB), "Subscript out of range.");
    assert_eq!(arithmetic_message(-6), "Unknown arithmetic exception.");
}

#[test]
fn enable_installs_and_disable_restores() {
    let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
    let before: Vec<usize> = SIGNALS.iter().map(|&s| current_action(s).sa_sigaction).collect();

    enable().unwrap();
    assert!(is_enabled());
    enable().unwrap();
    for &signal in &SIGNALS {
        let action = current_action(signal);
        assert_eq!(action.sa_sigaction, handler_address());
        assert_ne!(action.sa_flags & libc::SA_SIGINFO, 0);
        assert_ne!(action.sa_flags & libc::SA_NODEFER, 0);
    }

    disable();
    assert!(!is_enabled());
    let after: Vec<usize> = SIGNALS.iter().map(|&s| current_action(s).sa_sigaction).collect();
    assert_eq!(before, after);

    disable();
}

#[test]
fn arithmetic_fault_is_caught() {
    let _translation = Translation::start();

    let caught = Try::new(|| {
        unsafe { raise(libc::SIGFPE) };
        None
    })
    .catch(|fault: ArithmeticError| Some(fault))
    .run();

    let fault = caught.expect("SIGFPE should land in the catch clause");
    // raise() reports SI_TKILL, not one of the FPE codes.
    assert_eq!(fault.message, "Unknown arithmetic exception.");
}

#[test]
fn access_violation_is_caught_and_finally_runs() {
    let _translation = Translation::start();
    let mut finally_ran = 0;

    let message = Try::new(|| {
        unsafe { raise(libc::SIGSEGV) };
        ""
    })
    .catch(|fault: AccessViolation| fault.message)
    .finally(|| finally_ran += 1)
    .run();

    assert_eq!(message, "Access violation.");
    assert_eq!(finally_ran, 1);
}

#[test]
fn bus_error_without_misalignment_is_an_access_violation() {
    let _translation = Translation::start();

    let caught = Try::new(|| {
        unsafe { raise(libc::SIGBUS) };
        false
    })
    .catch(|_: MisalignedAccess| false)
    .catch(|_: AccessViolation| true)
    .run();

    assert!(caught);
}

#[test]
fn illegal_instruction_is_caught_by_wildcard() {
    let _translation = Translation::start();

    let name = Try::new(|| {
        unsafe { raise(libc::SIGILL) };
        String::new()
    })
    .catch_any(|thrown| thrown.type_name().to_owned())
    .run();

    assert!(name.ends_with("IllegalInstruction"), "{name}");
}

#[test]
fn translation_can_be_used_again_after_a_fault() {
    let _translation = Translation::start();

    for _ in 0..3 {
        let caught = Try::new(|| {
            unsafe { raise(libc::SIGSEGV) };
            false
        })
        .catch(|_: AccessViolation| true)
        .run();
        assert!(caught);
    }
}

#[test]
fn uncaught_fault_exits_the_worker() {
    let _translation = Translation::start();

    let worker = worker::spawn(|| {
        unsafe { raise(libc::SIGSEGV) };
        unreachable!("the fault was not translated");
    })
    .unwrap();

    assert_eq!(worker.join().unwrap(), libc::EXIT_FAILURE);
}

#[test]
fn describe_includes_the_message() {
    let thrown = Thrown::new(ArithmeticError {
        message: "Integer division by zero.",
        pc: 0,
    });
    assert_eq!(
        describe(&thrown).as_deref(),
        Some("Integer division by zero. (pc: 0x0)")
    );
    assert_eq!(describe(&Thrown::new(3u8)), None);
}

#[test]
fn a_fault_while_translating_turns_translation_off() {
    let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
    let before: Vec<usize> = SIGNALS.iter().map(|&s| current_action(s).sa_sigaction).collect();
    let fpe_before = current_action(libc::SIGFPE);

    enable().unwrap();
    TRANSLATING.set(true);
    // Delivered through raise(), so returning from the handler does not
    // fault again.
    unsafe { raise(libc::SIGFPE) };
    TRANSLATING.set(false);

    assert!(!is_enabled());
    assert_eq!(current_action(libc::SIGFPE).sa_sigaction, libc::SIG_DFL);
    for (index, &signal) in SIGNALS.iter().enumerate().skip(1) {
        assert_eq!(current_action(signal).sa_sigaction, before[index]);
    }

    // Nothing left to restore.
    disable();
    assert!(!is_enabled());
    unsafe { libc::sigaction(libc::SIGFPE, &fpe_before, ptr::null_mut()) };
}
