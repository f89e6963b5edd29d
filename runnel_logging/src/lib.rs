//! Logging setup shared by the runnel crates and their tests.
//!
//! The engine logs through the `log` facade under the `runnel` target. The
//! subscriber installed here bridges those records into `tracing` and filters
//! them with `RUST_LOG` (for example `RUST_LOG=runnel=trace`). Without
//! `RUST_LOG`, only warnings and errors are printed.
use std::sync::Once;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::SubscriberBuilder;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "warn";

static PANIC_HOOK: Once = Once::new();

/// Installs the global subscriber plus a panic hook that logs the panic and
/// exits the process, so a panic on a scheduler task cannot go unnoticed.
/// Calling it again is a no-op.
pub fn setup_log() {
    PANIC_HOOK.call_once(|| {
        std::panic::set_hook(Box::new(|info| {
            tracing::error!(target: "runnel", "Panic occurred: {}", info);
            std::process::exit(1);
        }))
    });

    setup_log_no_panic_hook()
}

/// Installs the global subscriber only. Use this where a test expects a panic.
pub fn setup_log_no_panic_hook() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = SubscriberBuilder::default()
        .with_line_number(true)
        .with_file(true)
        .with_target(true)
        .with_span_events(FmtSpan::NONE)
        .with_env_filter(filter)
        .with_test_writer()
        .finish()
        .try_init();
}
