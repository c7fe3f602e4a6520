use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;
use crate::message::Location;

/// Installs the global tracing subscriber from the log config. Returns
/// the appender guard when logging to a file; dropping it flushes the
/// writer, so the caller holds it for the process lifetime.
pub fn init_tracing(
    log: &LogConfig,
    log_path: Option<&str>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log.level.clone()));
    match (log.output.as_str(), log_path) {
        ("file", Some(path)) => {
            let path = Path::new(path);
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let file_name = path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_else(|| "geofs.log".to_string());
            let appender = tracing_appender::rolling::never(
                dir.unwrap_or_else(|| Path::new(".")),
                file_name,
            );
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

/// Mint a chunk id from the file path, the chunk index and the creation
/// time. The timestamp (nanosecond resolution) keeps ids unique across
/// retried uploads of the same chunk.
pub fn mint_chunk_id(file_path: &str, chunk_index: usize) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let digest = md5::compute(format!("{}:{}:{}", file_path, chunk_index, now));
    format!("{:x}", digest)
}

pub fn euclidean_distance(a: Location, b: Location) -> f64 {
    let dx = a.0 - b.0;
    let dy = a.1 - b.1;
    (dx * dx + dy * dy).sqrt()
}

/// Seconds since the unix epoch, used for heartbeat bookkeeping.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_ids_differ_across_mints() {
        let a = mint_chunk_id("/r/a.txt", 0);
        let b = mint_chunk_id("/r/a.txt", 0);
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn distance_is_euclidean() {
        assert_eq!(euclidean_distance((0.0, 0.0), (3.0, 4.0)), 5.0);
        assert_eq!(euclidean_distance((1.0, 1.0), (1.0, 1.0)), 0.0);
    }
}
