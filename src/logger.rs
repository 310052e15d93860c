use crate::parse::LoggingConfig;
use tracing::subscriber::SetGlobalDefaultError;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::SubscriberBuilder;



/*
    @@@
    @logs_tracing();
    . Creates a daily-rotating log file (<directory>/<file>) and wraps it in a non-blocking writer.
    . Configures a tracing subscriber at the configured level (with targets, no ANSI) writing to it.
    . An unknown level falls back to INFO; keeps the appender alive by returning the guard.
*/
pub fn logs_tracing(cfg: &LoggingConfig) -> Result<WorkerGuard, SetGlobalDefaultError> {
    let file_appender = RollingFileAppender::new(Rotation::DAILY, &cfg.directory, &cfg.file);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let subscriber = SubscriberBuilder::default()
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(true)
        .with_writer(non_blocking)
        .with_max_level(parse_level(&cfg.level))
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(guard)
}

pub fn parse_level(level: &str) -> Level {
    level.parse().unwrap_or(Level::INFO)
}
