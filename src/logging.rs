//! Diagnostics go to stderr through tracing; stdout is reserved for records.
use tracing::metadata::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `LOG` overrides the level picked by `verbosity`.
pub fn init(verbosity: u8) {
    let filter = EnvFilter::builder()
        .with_default_directive(level_from_verbosity(verbosity).into())
        .with_env_var("LOG")
        .from_env_lossy();

    // a second init (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn level_from_verbosity(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_steps() {
        assert_eq!(level_from_verbosity(0), LevelFilter::INFO);
        assert_eq!(level_from_verbosity(1), LevelFilter::DEBUG);
        assert_eq!(level_from_verbosity(5), LevelFilter::TRACE);
    }

    #[test]
    fn init_twice_is_harmless() {
        init(0);
        init(2);
    }
}
