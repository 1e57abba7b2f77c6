use tracing_subscriber::EnvFilter;

pub const LOG_ENV_VAR: &str = "DOCSEEK_LOG";

/// Build the filter used by [`init_tracing`].
///
/// `DOCSEEK_LOG` wins when set; otherwise `quiet` selects `warn` and each
/// `verbose` step raises the level from `info` to `debug` to `trace`.
pub fn env_filter(verbose: u8, quiet: bool) -> EnvFilter {
    if let Ok(env) = std::env::var(LOG_ENV_VAR) {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    }
}

/// Install a stderr fmt subscriber for the host process.
///
/// Returns `false` when a global subscriber was already installed, so
/// embedding applications and tests can call this more than once.
pub fn init_tracing(verbose: u8, quiet: bool) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbose, quiet))
        .with_writer(std::io::stderr)
        .without_time()
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_harmless() {
        init_tracing(0, true);
        assert!(!init_tracing(0, true));
    }
}
