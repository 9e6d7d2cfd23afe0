//! Tracing setup for embedders.
//!
//! Library code only emits `tracing` events; installing a subscriber is the
//! embedder's call. This helper wires the conventional stderr + `EnvFilter`
//! setup and is safe to call more than once.

use tracing_subscriber::EnvFilter;

/// Initializes a stderr subscriber. `filter` overrides the `RUST_LOG`
/// environment variable when given (e.g. `"drover_core=debug"`).
pub fn init(filter: Option<&str>) {
    let filter = match filter {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::from_default_env(),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init(Some("drover_core=debug"));
        init(None);
    }
}
