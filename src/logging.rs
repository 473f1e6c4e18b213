// Logging setup for binaries and tools embedding the engine.
// The library itself only emits through the `log` macros.

use env_logger::{Builder, Env};

/// Install an env_logger backend. `RUST_LOG` wins; otherwise `info`, or
/// `debug` when verbose. Safe to call more than once.
pub fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let _ = Builder::from_env(Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init_logging(false);
        init_logging(true);
        log::info!("logging initialised");
    }
}
