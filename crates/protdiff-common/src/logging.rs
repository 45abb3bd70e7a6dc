//! Tracing subscriber bootstrap for evaluation drivers.

use tracing_subscriber::EnvFilter;

/// Install a `fmt` subscriber honouring `RUST_LOG`, falling back to `level`.
///
/// Returns `false` when a global subscriber was already installed.
pub fn init_logging(level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_tolerated() {
        let _ = init_logging("info");
        assert!(!init_logging("debug"));
    }
}
