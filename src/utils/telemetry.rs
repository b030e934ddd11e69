//! # Telemetry
//!
//! Store and dataset operations are instrumented with `tracing` spans
//! (`encode`, `decode`, `open`, chunk reads). Nothing is printed unless a
//! subscriber is installed; `init_tracing` installs the default one.

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a global subscriber that logs span close events with elapsed
/// time since startup.
///
/// Returns `false` when a global subscriber was already set (the existing
/// one is kept).
pub fn init_tracing() -> bool {
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_span_events(FmtSpan::CLOSE)
                .with_target(false)
                .with_timer(fmt::time::uptime())
                .with_writer(std::io::stderr),
        )
        .try_init()
        .is_ok()
}
