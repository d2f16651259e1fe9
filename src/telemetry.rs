//! Tracing setup
//!
//! Library code only emits `tracing` events. Binaries and embedding services
//! call [`init_tracing`] once at startup.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is not set.
/// Run summaries are visible at info; per-item logs need `RUST_LOG=debug`.
pub const DEFAULT_LOG_FILTER: &str = "warn,docpipe=info";

/// Install a formatting subscriber honouring `RUST_LOG`.
///
/// Loads `.env` first so `RUST_LOG` can live there. Safe to call more than
/// once: later calls are no-ops.
pub fn init_tracing(default_filter: Option<&str>) {
    // Load .env file - try current dir, then parent
    if dotenvy::dotenv().is_err() {
        let _ = dotenvy::from_path("../.env");
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter.unwrap_or(DEFAULT_LOG_FILTER)));

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_err()
    {
        tracing::debug!("Tracing subscriber already installed");
    }
}
