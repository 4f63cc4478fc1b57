//! Tracing setup.
//!
//! # Environment Variables
//!
//! - `ITEMFLOW_LOG`: filter directives, e.g. `itemflow=debug` (takes precedence)
//! - `RUST_LOG`: standard filter directives, used when `ITEMFLOW_LOG` is unset
//!
//! With neither set, `info` and above is logged.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Environment variable holding itemflow's log filter.
pub const LOG_ENV: &str = "ITEMFLOW_LOG";

const DEFAULT_FILTER: &str = "info";

/// Build the log filter from the environment.
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global fmt subscriber.
///
/// Returns false when a global subscriber was already installed (as happens
/// when an embedding application or a previous test set one up).
pub fn init_tracing() -> bool {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_filter(env_filter()),
        )
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_harmless() {
        init_tracing();
        assert!(!init_tracing());
    }
}
