// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Telemetry initialization.

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Configuration for telemetry initialization.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Default log level if RUST_LOG is not set.
    pub default_level: Level,
    /// Whether to use ANSI colors in output.
    pub ansi_colors: bool,
    /// Whether to use the compact log format.
    pub compact: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            default_level: Level::INFO,
            ansi_colors: true,
            compact: true,
        }
    }
}

impl TelemetryConfig {
    /// Verbose configuration for development runs.
    pub fn development() -> Self {
        Self {
            default_level: Level::DEBUG,
            ansi_colors: true,
            compact: false,
        }
    }
}

/// Initialize the global tracing subscriber. Logs go to stderr so stdout
/// stays clean for command output. Safe to call more than once; later calls
/// are no-ops.
pub fn init_telemetry(config: &TelemetryConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_level.to_string()));

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(config.ansi_colors);

    if config.compact {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.compact())
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init();
    }
}
