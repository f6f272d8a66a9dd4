// =============================================================================
// Logging — structured tracing split across per-purpose log files
// =============================================================================
//
// The teacher's `main.rs` wires a single `tracing_subscriber::fmt()` sink with
// an `EnvFilter`. This engine needs the same filter but several sinks: a
// trading-events file, a verbose debug file, a websocket-only file, and one
// file per account. `tracing-appender`'s non-blocking writers give each its
// own layer on a shared `tracing_subscriber::registry()`.
// =============================================================================

use std::fmt::Write as _;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::clock;

/// Guards for the non-blocking writers; dropping these flushes and stops the
/// background flush thread, so `main` must hold them for the process
/// lifetime.
pub struct LoggingGuards {
    _guards: Vec<WorkerGuard>,
}

/// `FormatTime` backed by `clock::now_ist`, so every sink timestamps records
/// in `YYYY-MM-DD HH:mm:ss.SSS` IST rather than the default UTC-ish format.
struct IstTimer;

impl FormatTime for IstTimer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", clock::now_ist())
    }
}

/// Initialize the global subscriber: stdout at the `RUST_LOG`-configured
/// level, plus `trading.log` (info), `debug.log` (debug), `websocket.log`
/// (debug, `feed` module targets only), and one `logs/accounts/<name>.log`
/// (info) per configured account.
pub fn init(log_dir: impl AsRef<Path>, account_names: &[String]) -> anyhow::Result<LoggingGuards> {
    let log_dir = log_dir.as_ref();
    std::fs::create_dir_all(log_dir.join("accounts"))?;

    let env_filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let mut guards = Vec::new();

    let stdout_layer = fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_timer(IstTimer)
        .with_filter(env_filter());

    let (trading_writer, trading_guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, "trading.log"));
    guards.push(trading_guard);
    let trading_layer = fmt::layer()
        .with_writer(trading_writer)
        .with_ansi(false)
        .with_timer(IstTimer)
        .with_filter(EnvFilter::new("info"));

    let (debug_writer, debug_guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, "debug.log"));
    guards.push(debug_guard);
    let debug_layer = fmt::layer()
        .with_writer(debug_writer)
        .with_ansi(false)
        .with_timer(IstTimer)
        .with_filter(EnvFilter::new("debug"));

    let (ws_writer, ws_guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, "websocket.log"));
    guards.push(ws_guard);
    let websocket_layer = fmt::layer()
        .with_writer(ws_writer)
        .with_ansi(false)
        .with_timer(IstTimer)
        .with_filter(EnvFilter::new("momentum_ladder::feed=debug"));

    // Per-account files get every info-level record the engine emits, the
    // same way the teacher's multi-sink setups don't attempt field-level
    // routing — callers grep by the `account` field within the file.
    let mut account_layers = Vec::new();
    for name in account_names {
        let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(
            log_dir.join("accounts"),
            format!("{name}.log"),
        ));
        guards.push(guard);
        account_layers.push(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_timer(IstTimer)
                .with_filter(EnvFilter::new("info")),
        );
    }

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(trading_layer)
        .with(debug_layer)
        .with(websocket_layer)
        .with(account_layers)
        .init();

    Ok(LoggingGuards { _guards: guards })
}
