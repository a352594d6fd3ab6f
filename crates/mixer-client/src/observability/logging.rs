//! Log setup for applications embedding the client.
//!
//! The client only emits `tracing` events, under the `mixer_client` and
//! `mixer_domain` targets. [`init_logging`] installs a global subscriber that
//! logs those targets at the configured level and everything else at WARN,
//! so turning up client verbosity does not flood the host's output.
//!
//! ```json
//! {"timestamp":"2026-01-15T10:30:00.000Z","level":"WARN","target":"mixer_client::client::check","fields":{"message":"check transport call failed","code":"UNAVAILABLE"}}
//! ```

use tracing::Level;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const CLIENT_TARGETS: [&str; 2] = ["mixer_client", "mixer_domain"];

/// Level and format of the client's log output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Level for the client's own targets.
    pub level: Level,
    /// JSON lines (true) or human-readable text (false).
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json: false,
        }
    }
}

impl LoggingConfig {
    pub fn new(level: Level, json: bool) -> Self {
        Self { level, json }
    }

    /// Filter directives: client targets at `level`, other targets at WARN.
    pub fn directives(&self) -> String {
        let level = self.level.as_str().to_ascii_lowercase();
        let mut directives = String::from("warn");
        for target in CLIENT_TARGETS {
            directives.push_str(&format!(",{target}={level}"));
        }
        directives
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::new(self.directives())
    }
}

/// Installs the global subscriber described by `config`.
///
/// `RUST_LOG`, when set, replaces the configured directives. Returns `false`
/// if a global subscriber was already installed.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| config.filter());
    let installed = if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .try_init()
    };
    installed.is_ok()
}

/// Builds a JSON subscriber writing to `writer` with `config`'s directives
/// and no environment override.
///
/// Useful for scoping client logs with `tracing::subscriber::with_default`.
pub fn json_subscriber<W>(
    config: &LoggingConfig,
    writer: W,
) -> impl tracing::Subscriber + Send + Sync
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    tracing_subscriber::registry()
        .with(config.filter())
        .with(fmt::layer().json().with_writer(writer).with_target(true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directives_scope_level_to_client_targets() {
        let config = LoggingConfig::new(Level::DEBUG, true);

        assert_eq!(
            config.directives(),
            "warn,mixer_client=debug,mixer_domain=debug"
        );
    }

    #[test]
    fn test_default_is_info_text() {
        let config = LoggingConfig::default();

        assert_eq!(config.level, Level::INFO);
        assert!(!config.json);
        assert!(config.directives().ends_with("mixer_domain=info"));
    }
}
