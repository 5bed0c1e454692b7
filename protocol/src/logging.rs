//! # Structured Logging
//!
//! Wires the `tracing` subscriber for binaries and test harnesses that
//! embed the ledger. The library itself only emits events; nothing in here
//! runs unless the host asks for it.
//!
//! Audit events are emitted under the `lct_protocol::audit` target, so
//! they can be routed separately:
//!
//! ```text
//! RUST_LOG=lct_protocol=info,lct_protocol::audit=info
//! ```

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, colored output.
    Pretty,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    /// Accepts "json" or "pretty" (case-insensitive); anything else is `Pretty`.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

/// Install the global subscriber, unless one is already installed.
///
/// `RUST_LOG` wins over `default_level` when set. Returns `false` if a
/// subscriber was already in place (common in tests).
pub fn try_init_logging(default_level: &str, format: LogFormat) -> bool {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let installed = match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()
            .is_ok(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_writer(std::io::stderr).with_target(true))
            .try_init()
            .is_ok(),
    };

    if installed {
        tracing::info!("logging initialized (format={:?})", format);
    }
    installed
}

/// Like [`try_init_logging`], but logs a warning on the existing
/// subscriber when one was already installed.
pub fn init_logging(default_level: &str, format: LogFormat) {
    if !try_init_logging(default_level, format) {
        tracing::warn!("tracing subscriber already installed; keeping it");
    }
}
