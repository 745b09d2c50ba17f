//! The hooks are process-wide, so these tests live in their own binary and
//! take turns through `SERIAL`. Scenarios run under `worker::run` on the
//! test thread, which lets the hooks record into thread-locals.

use std::cell::RefCell;
use std::sync::{Mutex, MutexGuard, PoisonError};

use catchwind::{hooks, rethrow, throw, worker, Config, Error, Hooks, Thrown, Try};

static SERIAL: Mutex<()> = Mutex::new(());

thread_local! {
    static RECORDED: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

fn record(entry: String) {
    RECORDED.with_borrow_mut(|recorded| recorded.push(entry));
}

fn recorded() -> Vec<String> {
    RECORDED.with_borrow_mut(std::mem::take)
}

struct Installed {
    _serial: MutexGuard<'static, ()>,
}

impl Installed {
    fn new(hooks: Hooks) -> Self {
        let serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        hooks::install(hooks);
        Self { _serial: serial }
    }
}

impl Drop for Installed {
    fn drop(&mut self) {
        hooks::reset();
    }
}

fn describe(slot: &str, thrown: &Thrown) -> String {
    format!("{slot}:{}", thrown.type_name())
}

#[test]
fn on_throw_fires_on_every_hop() {
    let _hooks = Installed::new(Hooks::new().on_throw(|t| record(describe("throw", t))));

    let code = worker::run(|| {
        let value = Try::new(|| -> i32 {
            Try::new(|| -> i32 {
                throw(3i32);
            })
            .catch(|_: u8| 0)
            .run()
        })
        .catch(|e: i32| e)
        .run();
        assert_eq!(value, 3);
    });

    assert_eq!(code, 0);
    assert_eq!(recorded(), ["throw:i32", "throw:i32"]);
}

#[test]
fn rethrow_keeps_the_value_seen_by_on_throw() {
    let _hooks = Installed::new(Hooks::new().on_throw(|t| {
        record(format!("throw:{:?}", t.downcast::<u16>()));
    }));

    let code = worker::run(|| {
        Try::new(|| {
            Try::new(|| {
                throw(8u16);
            })
            .catch(|_: u16| rethrow())
            .run();
        })
        .catch(|_: u16| ())
        .run();
    });

    assert_eq!(code, 0);
    assert_eq!(recorded(), ["throw:Some(8)", "throw:Some(8)"]);
}

#[test]
fn on_unhandled_sees_the_value_and_the_worker_exits() {
    let _hooks = Installed::new(Hooks::new().on_unhandled(|t| {
        record(format!("unhandled:{:?}", t.downcast::<u32>()));
    }));

    let code = worker::run(|| {
        throw(99u32);
    });

    assert_eq!(code, libc::EXIT_FAILURE);
    assert_eq!(recorded(), ["unhandled:Some(99)"]);
}

#[test]
fn on_unexpected_fires_for_a_throw_inside_catch() {
    let _hooks = Installed::new(
        Hooks::new()
            .on_unhandled(|t| record(describe("unhandled", t)))
            .on_unexpected(|t| record(describe("unexpected", t))),
    );

    let code = worker::run(|| {
        Try::new(|| {
            throw(1i32);
        })
        .catch(|_: i32| throw(2u8))
        .run();
    });

    assert_eq!(code, libc::EXIT_FAILURE);
    assert_eq!(recorded(), ["unexpected:u8"]);
}

#[test]
fn a_throwing_hook_goes_to_the_unexpected_path() {
    let _hooks = Installed::new(
        Hooks::new()
            .on_unhandled(|t| {
                record(describe("unhandled", t));
                throw(5i64);
            })
            .on_unexpected(|t| record(describe("unexpected", t))),
    );

    let code = worker::run(|| {
        throw(4i32);
    });

    assert_eq!(code, libc::EXIT_FAILURE);
    assert_eq!(recorded(), ["unhandled:i32", "unexpected:i64"]);
}

#[test]
fn a_panicking_hook_goes_to_the_unexpected_path() {
    let _hooks = Installed::new(
        Hooks::new()
            .on_throw(|_| panic!("hook failure"))
            .on_unexpected(|t| record(describe("unexpected", t))),
    );

    let code = worker::run(|| {
        Try::new(|| {
            throw(6u8);
        })
        .catch(|_: u8| record("caught".into()))
        .run();
    });

    assert_eq!(code, libc::EXIT_FAILURE);
    assert_eq!(recorded(), ["unexpected:u8"]);
}

#[test]
fn a_failing_unexpected_hook_is_replaced_by_the_default() {
    let _hooks = Installed::new(Hooks::new().on_unexpected(|t| {
        record(describe("unexpected", t));
        throw(0u64);
    }));

    let code = worker::run(|| {
        Try::new(|| ()).finally(|| throw(1u32)).run();
    });

    assert_eq!(code, libc::EXIT_FAILURE);
    assert_eq!(recorded(), ["unexpected:u32"]);

    // The failed hook was cleared; the default runs from now on.
    let code = worker::run(|| {
        Try::new(|| ()).finally(|| throw(2u32)).run();
    });
    assert_eq!(code, libc::EXIT_FAILURE);
    assert!(recorded().is_empty());
}

#[test]
fn exceptions_caught_inside_a_hook_stay_inside_it() {
    let _hooks = Installed::new(
        Hooks::new()
            .on_unhandled(|t| {
                let inner = Try::new(|| -> u8 {
                    throw(1u8);
                })
                .catch(|e: u8| e)
                .run();
                record(format!("{}:{inner}", describe("unhandled", t)));
            })
            .on_unexpected(|t| record(describe("unexpected", t))),
    );

    let code = worker::run(|| {
        throw(2i16);
    });

    assert_eq!(code, libc::EXIT_FAILURE);
    assert_eq!(recorded(), ["unhandled:i16:1"]);
}

#[test]
fn init_runs_once() {
    let _hooks = Installed::new(Hooks::new());

    // Not the main thread of the process, but it becomes the main worker.
    catchwind::init(Config::new()).unwrap();
    assert!(worker::is_main());
    assert!(matches!(
        catchwind::init(Config::new()),
        Err(Error::AlreadyInitialized)
    ));
}
