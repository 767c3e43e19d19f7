//! Tracing subscriber setup for applications embedding propbind

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    })
}

/// Install a fmt subscriber; `RUST_LOG` overrides the verbosity flag
///
/// Returns false when a global subscriber was already installed.
pub fn init(verbose: bool) -> bool {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter(verbose))
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init(false);
        assert!(!init(true));
    }
}
