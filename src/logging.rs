use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// Install the global tracing subscriber.
///
/// The filter comes from TASKDASH_LOG, then `log.level`, then "info". With
/// `log.file` set, output goes to a daily rolling file under the data
/// directory; keep the returned guard alive until exit so it gets flushed.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_env("TASKDASH_LOG")
    .or_else(|_| EnvFilter::try_new(config.level.as_deref().unwrap_or("info")))
    .map_err(|e| eyre!("Invalid log filter: {}", e))?;

  if !config.file {
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(std::io::stderr)
      .try_init()
      .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;
    return Ok(None);
  }

  let log_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("taskdash")
    .join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&log_dir, "taskdash.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(Some(guard))
}
