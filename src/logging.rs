//! Logger initialization

use std::sync::Once;

/// Logger configuration.
///
/// `env_filter` follows the `env_logger` filter syntax, e.g.
/// `"vrs_demo=debug,naga=warn"`. When unset, `RUST_LOG` is consulted and
/// then the `info` level is used.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub env_filter: Option<String>,
    pub write_style: env_logger::WriteStyle,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            env_filter: None,
            write_style: env_logger::WriteStyle::Auto,
        }
    }
}

static INIT: Once = Once::new();

/// Initialize the global logger. Later calls are ignored.
pub fn init_logging(config: &LoggingConfig) {
    INIT.call_once(|| {
        let mut builder = env_logger::Builder::new();

        match config
            .env_filter
            .clone()
            .or_else(|| std::env::var("RUST_LOG").ok())
        {
            Some(filter) => {
                builder.parse_filters(&filter);
            }
            None => {
                builder.filter_level(log::LevelFilter::Info);
            }
        }

        builder.write_style(config.write_style);

        // try_init: a test harness may already own the global logger
        if builder.try_init().is_err() {
            log::warn!("Logger already installed, keeping the existing one");
        }

        log::debug!("Logging initialized");
    });
}
