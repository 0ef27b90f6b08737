//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

/// Default directives when `RUST_LOG` is unset: `info` globally, `debug` for
/// the stocklock crates so reservation retries and strategy decisions show up
/// out of the box. Targets are crate names, so underscores.
const DEFAULT_DIRECTIVES: &str = "info,stocklock_core=debug,stocklock_ledger=debug,\
     stocklock_engine=debug,stocklock_infra=debug";

/// Initialize JSON tracing for the process, filtered via `RUST_LOG`.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}

/// Plain (non-JSON) output for tests and local debugging.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directives_parse_per_crate() {
        let filter = EnvFilter::try_new(DEFAULT_DIRECTIVES).unwrap();
        // Every per-crate directive survived parsing.
        let rendered = filter.to_string().to_lowercase();
        for target in [
            "stocklock_core=debug",
            "stocklock_ledger=debug",
            "stocklock_engine=debug",
            "stocklock_infra=debug",
        ] {
            assert!(rendered.contains(target), "missing directive: {target}");
        }
    }
}
