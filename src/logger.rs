use std::path::Path;
use std::sync::{Once, OnceLock};

use pipeline_plugin::LogLevel;
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

pub const LOG_FILE: &str = "flowise-pipeline.log";

static LOG_INIT: Once = Once::new();
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber: stdout always, plus a daily rolling file
/// when `log_dir` is given. `RUST_LOG` wins over `log_level` when set.
/// Only the first call has any effect; later and concurrent calls return
/// `Ok(())`, as does a process that already has a subscriber.
pub fn init_tracing(log_level: LogLevel, log_dir: Option<&Path>) -> anyhow::Result<()> {
    let mut result = Ok(());
    LOG_INIT.call_once(|| {
        result = install(log_level, log_dir);
    });
    result
}

fn install(log_level: LogLevel, log_dir: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str()));

    let stdout_layer = fmt::layer().with_target(false);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let (writer, guard) = tracing_appender::non_blocking(daily(dir, LOG_FILE));
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
    {
        // someone else owns the global subscriber, log through theirs
        debug!("tracing subscriber already installed: {}", e);
        return Ok(());
    }

    if let Some(guard) = guard {
        // keep the writer alive for the whole process
        let _ = FILE_GUARD.set(guard);
    }
    if let Some(dir) = log_dir {
        info!("logging to {}", dir.join(LOG_FILE).display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent_and_thread_safe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let path = path.clone();
                std::thread::spawn(move || init_tracing(LogLevel::Debug, Some(&path)).is_ok())
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert!(init_tracing(LogLevel::Info, None).is_ok());
    }

    #[test]
    fn test_install_tolerates_existing_subscriber() {
        // whichever of these wins, the other must not fail
        let _ = tracing_subscriber::fmt().try_init();
        assert!(install(LogLevel::Warn, None).is_ok());
    }
}
