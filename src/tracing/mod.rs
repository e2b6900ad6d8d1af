//! Logging setup.
//!
//! Logs go to stdout through a compact `fmt` layer filtered to this
//! crate's target. Without an explicit level only errors are shown.

use tracing::level_filters::LevelFilter;
use tracing::Subscriber;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Layer;
use tracing_subscriber::Registry;

use crate::errors::EngineError;
use crate::errors::EngineResult;

pub(crate) fn get_log_level(level: Option<&str>) -> EngineResult<LevelFilter> {
    if let Some(level) = level {
        match level.to_lowercase().as_str() {
            "trace" => Ok(LevelFilter::TRACE),
            "debug" => Ok(LevelFilter::DEBUG),
            "info" => Ok(LevelFilter::INFO),
            "warn" => Ok(LevelFilter::WARN),
            "error" => Ok(LevelFilter::ERROR),
            level => Err(EngineError::Config(format!("Wrong log level: {level}"))),
        }
    } else {
        Ok(LevelFilter::ERROR)
    }
}

/// Install the global log subscriber.
///
/// Calling this again is harmless: the second subscriber is dropped
/// with a warning.
pub fn setup_tracing(log_level: Option<&str>) -> EngineResult<()> {
    let log_level = get_log_level(log_level)?;

    let logs = tracing_subscriber::fmt::Layer::default()
        .compact()
        // Show source file
        .with_file(true)
        // Display source code line numbers
        .with_line_number(true)
        // Display the thread ID an event was recorded on
        .with_thread_ids(true)
        .with_filter(Targets::new().with_target("rxqe", log_level));

    set_global_subscriber(Registry::default().with(logs));
    Ok(())
}

// Tests and embedders may initialize more than once in a process.
fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        tracing::warn!("{err}");
    }
}

#[test]
fn log_levels_parse() {
    assert_eq!(get_log_level(None).unwrap(), LevelFilter::ERROR);
    assert_eq!(get_log_level(Some("DEBUG")).unwrap(), LevelFilter::DEBUG);
    assert!(matches!(
        get_log_level(Some("loud")),
        Err(EngineError::Config(_))
    ));
}

#[test]
fn setup_twice_is_harmless() {
    setup_tracing(Some("info")).unwrap();
    setup_tracing(None).unwrap();
}
