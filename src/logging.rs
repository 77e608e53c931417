//! Logging setup: stderr plus a daily-rolling file.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const LOG_FILE_PREFIX: &str = "ogw.log";

/// Install the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise the level is `info`, or `debug` with
/// `verbose`. With a `log_dir`, output is also written to a daily-rolling
/// file there. Keep the returned guard alive until exit so buffered lines
/// get flushed.
pub fn init(verbose: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
  let default_level = if verbose { "debug" } else { "info" };
  let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

  let stderr_layer = tracing_subscriber::fmt::layer()
    .with_writer(std::io::stderr)
    .with_target(false)
    .with_filter(filter());

  let (file_layer, guard) = match log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
      let (non_blocking, guard) = tracing_appender::non_blocking(appender);
      let layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(filter());
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  // A second init (e.g. from tests) is harmless
  let _ = tracing_subscriber::registry()
    .with(stderr_layer)
    .with(file_layer)
    .try_init();

  guard
}
