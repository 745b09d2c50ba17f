use std::ffi::c_int;

use catchwind::fault::{AccessViolation, ArithmeticError, Fault};
use catchwind::{defer, defer_fn, recover, rethrow, signal_error, throw, worker, Config, Hooks, Try};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

extern "C-unwind" {
    fn raise(sig: c_int) -> c_int;
}

#[derive(Debug, Clone, Copy)]
struct ParseError {
    line: u32,
    column: u32,
}

fn close(fd: i32) {
    tracing::info!(fd, "closing");
}

fn main() {
    let registry = tracing_subscriber::Registry::default().with(
        EnvFilter::builder()
            .with_default_directive(tracing::Level::DEBUG.into())
            .from_env()
            .unwrap(),
    );

    let tree_layer = tracing_tree::HierarchicalLayer::new(2)
        .with_targets(true)
        .with_bracketed_fields(true);

    registry.with(tree_layer).init();

    catchwind::init(
        Config::new()
            .translate_faults(true)
            .hooks(Hooks::new().on_throw(|thrown| {
                tracing::info!(r#type = thrown.type_name(), "on_throw");
            })),
    )
    .unwrap();

    let code = worker::run(|| {
        let fd = defer(close, 3);
        let result = recover(|| {
            defer_fn(move || tracing::info!(fd, "releasing buffer"));
            signal_error(libc::EIO);
        });
        tracing::info!(?result, "recovered");
    });
    tracing::info!(code, "defer demo finished");

    let code = worker::run(|| {
        let seen = Try::new(|| -> u32 {
            Try::new(|| -> u32 {
                throw(ParseError { line: 7, column: 3 });
            })
            .catch(|e: ParseError| {
                tracing::info!(?e, "inner catch, rethrowing");
                rethrow();
            })
            .finally(|| tracing::info!("inner finally"))
            .run()
        })
        .catch(|e: ParseError| e.line)
        .run();
        tracing::info!(seen, "exception demo finished");
    });
    tracing::info!(code, "exception worker finished");

    let code = worker::run(|| {
        let message = Try::new(|| -> &'static str {
            unsafe { raise(libc::SIGFPE) };
            "no fault"
        })
        .catch(|fault: ArithmeticError| fault.message())
        .catch(|fault: AccessViolation| fault.message())
        .run();
        tracing::info!(message, "fault demo finished");
    });
    tracing::info!(code, "fault worker finished");

    let spawned = worker::spawn(|| throw(42i32)).unwrap();
    let code = spawned.join().unwrap();
    tracing::info!(code, "unhandled exception ended only its worker");
}
