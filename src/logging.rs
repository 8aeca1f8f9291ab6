//! Tracing subscriber installation.
//!
//! Libraries only emit `tracing` events; binaries and tests call [`init`] once
//! to print them. `RUST_LOG` overrides the default filter.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "info,eventweave=info";

/// Installs a formatting subscriber with the default filter.
///
/// Returns `false` if a global subscriber was already installed, which makes
/// it safe to call from every test.
pub fn init() -> bool {
  init_with_filter(DEFAULT_FILTER)
}

/// Installs a formatting subscriber with `filter` unless `RUST_LOG` is set.
pub fn init_with_filter(filter: &str) -> bool {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
    .with_test_writer()
    .try_init()
    .is_ok()
}
