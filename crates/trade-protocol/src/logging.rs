//! Tracing initialization shared by the daemon and test harnesses
//!
//! Honors LOG_DESTINATION=console|file plus LOG_DIR and LOG_FILE_PREFIX
//! when logging to file.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// `verbose` raises the named crates to debug; otherwise RUST_LOG wins,
/// falling back to info for the named crates and warn for everything else.
pub fn init_logging(verbose: bool, crate_names: &[&str], default_log_prefix: &str) {
    let filter = build_filter(verbose, crate_names);

    let destination = std::env::var("LOG_DESTINATION").unwrap_or_else(|_| "console".to_string());
    if destination.eq_ignore_ascii_case("file") {
        let dir = std::env::var("LOG_DIR").unwrap_or_else(|_| "./logs".to_string());
        let prefix =
            std::env::var("LOG_FILE_PREFIX").unwrap_or_else(|_| default_log_prefix.to_string());
        let appender = tracing_appender::rolling::daily(&dir, &prefix);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        // The guard must outlive the process or buffered lines are lost
        std::mem::forget(guard);
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(writer).with_ansi(false))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

fn build_filter(verbose: bool, crate_names: &[&str]) -> EnvFilter {
    let directives = |level: &str, tail: &str| {
        let per_crate: Vec<String> = crate_names
            .iter()
            .map(|name| format!("{}={}", name, level))
            .collect();
        EnvFilter::new(format!("{},{}", per_crate.join(","), tail))
    };
    if verbose {
        directives("debug", "info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| directives("info", "warn"))
    }
}
