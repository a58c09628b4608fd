//! Tracing initialisation for the orchestrator binaries.
//!
//! Logs always go to stderr so stdout stays free for reports. Call
//! [`init_tracing`] once at program start; later calls are ignored because
//! the global subscriber can only be set once per process.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Map `-q` / `-v` counts to a default level.
pub fn level_from_verbosity(quiet: bool, verbose: u8) -> Level {
    if quiet {
        return Level::WARN;
    }
    match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Initialise the global tracing subscriber.
///
/// `RUST_LOG` wins over `level` when set. With `json`, each event is one
/// JSON object per line.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let layer = fmt::layer().with_target(false).with_writer(std::io::stderr);

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer.json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer)
            .try_init()
            .ok();
    }
}
