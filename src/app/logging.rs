use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{reload, EnvFilter, Registry};

/// Lets the level follow the config file once it has been read.
pub struct LogLevelHandle {
    handle: Option<reload::Handle<EnvFilter, Registry>>,
}

impl LogLevelHandle {
    /// No effect when `RUST_LOG` chose the filter or another subscriber was already installed.
    pub fn apply(&self, level: &str) {
        if let Some(handle) = &self.handle {
            let _ = handle.reload(EnvFilter::new(normalize_level(level)));
        }
    }
}

/// Installs the global subscriber. `RUST_LOG` wins over `default_level`.
///
/// Output goes to stderr so that `--json` results on stdout stay machine-readable.
pub fn init_logging(default_level: &str) -> LogLevelHandle {
    let (env_filter, from_env) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, true),
        Err(_) => (EnvFilter::new(normalize_level(default_level)), false),
    };
    let (filter, handle) = reload::Layer::new(env_filter);

    let installed = if cfg!(debug_assertions) {
        Registry::default()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .try_init()
    } else {
        Registry::default()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .try_init()
    };

    LogLevelHandle {
        handle: (installed.is_ok() && !from_env).then_some(handle),
    }
}

fn normalize_level(level: &str) -> String {
    match level.trim().to_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" | "critical" => "error",
        _ => "info",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_config_levels() {
        assert_eq!(normalize_level("INFO"), "info");
        assert_eq!(normalize_level("Warning"), "warn");
        assert_eq!(normalize_level("CRITICAL"), "error");
        assert_eq!(normalize_level("bogus"), "info");
    }

    #[test]
    fn configured_level_applies_after_startup() {
        let logging = init_logging("info");
        logging.apply("debug");
        // Only the first subscriber in a process is installed; later handles are inert.
        let second = init_logging("error");
        assert!(second.handle.is_none());
        second.apply("trace");
    }
}
