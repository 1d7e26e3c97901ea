//! Logging setup.
//!
//! Logging to stdout is always enabled, at least at the "ERROR" level
//! for this crate's targets. Hosts that already install their own
//! subscriber can skip this entirely; every event is emitted with
//! plain `tracing` macros.

use tracing::level_filters::LevelFilter;
use tracing::Subscriber;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::Registry;

use crate::errors::CommitError;
use crate::errors::CommitResult;

/// Environment variable holding an [`EnvFilter`] directive string.
/// Takes precedence over the level passed to [`setup_logging`].
pub const LOG_ENV_VAR: &str = "TABLECOMMIT_LOG";

fn get_log_level(level: Option<String>) -> CommitResult<LevelFilter> {
    if let Some(level) = level {
        match level.to_lowercase().as_str() {
            "trace" => Ok(LevelFilter::TRACE),
            "debug" => Ok(LevelFilter::DEBUG),
            "info" => Ok(LevelFilter::INFO),
            "warn" => Ok(LevelFilter::WARN),
            "error" => Ok(LevelFilter::ERROR),
            level => Err(CommitError::Config(format!("Wrong log level: {level}"))),
        }
    } else {
        Ok(LevelFilter::ERROR)
    }
}

/// Install a global subscriber printing this crate's events.
///
/// `log_level` is one of "trace", "debug", "info", "warn", "error";
/// defaults to "error".
pub fn setup_logging(log_level: Option<String>) -> CommitResult<()> {
    let log_level = get_log_level(log_level)?;

    // Prepare the log layer
    let logs = tracing_subscriber::fmt::Layer::default()
        .compact()
        // Show source file
        .with_file(true)
        // Display source code line numbers
        .with_line_number(true)
        // Display the thread ID an event was recorded on
        .with_thread_ids(true);

    match std::env::var(LOG_ENV_VAR) {
        Ok(directives) => {
            let filter = EnvFilter::try_new(&directives).map_err(|err| {
                CommitError::Config(format!("invalid {LOG_ENV_VAR} {directives:?}: {err}"))
            })?;
            set_global_subscriber(Registry::default().with(logs.with_filter(filter)));
        }
        Err(_) => {
            let filter = Targets::new().with_target("tablecommit", log_level);
            set_global_subscriber(Registry::default().with(logs.with_filter(filter)));
        }
    }
    Ok(())
}

// Utility function used to try to set a global default subscriber,
// logging the error without panicking if it was already set
fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    // This can fail if logging was already initialized, e.g. by the
    // host or by an earlier test in the same process.
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        tracing::warn!("{err}");
    }
}

#[test]
fn log_levels_parse() {
    assert_eq!(get_log_level(None).unwrap(), LevelFilter::ERROR);
    assert_eq!(
        get_log_level(Some(String::from("DEBUG"))).unwrap(),
        LevelFilter::DEBUG
    );
    assert!(matches!(
        get_log_level(Some(String::from("loud"))),
        Err(CommitError::Config(_))
    ));
}
