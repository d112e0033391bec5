//! Logging setup and configuration

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn build_filter(default_level: &str) -> crate::Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| crate::Error::Config(format!("Invalid log filter: {}", e)))
}

/// Setup tracing subscriber for the application
///
/// `RUST_LOG` takes precedence over `default_level`. Thread names are printed
/// so output from the USB worker thread can be told apart from callers.
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let filter = build_filter(default_level)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_thread_names(true))
        .try_init()
        .map_err(|e| crate::Error::Config(format!("Logging already initialized: {}", e)))
}

/// Install a test-writer subscriber, ignoring repeated initialization
pub fn setup_test_logging() {
    if let Ok(filter) = build_filter("debug") {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_test_writer().with_thread_names(true))
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_filter_rejected() {
        // Only meaningful when RUST_LOG is unset; otherwise the env filter wins.
        if std::env::var_os("RUST_LOG").is_none() {
            assert!(build_filter("usb=[").is_err());
        }
    }

    #[test]
    fn test_repeated_test_logging_is_harmless() {
        setup_test_logging();
        setup_test_logging();
    }
}
