//! Logging setup
//!
//! Diagnostics always go to stderr, filtered by `RUST_LOG` (default `info`,
//! `debug` with `--verbose`). An operation on an interface additionally
//! appends to that interface's log sink, `<dir>/<name>.log`, in plain or
//! JSON lines at the sink's level.

use crate::error::{BrgError, Result};
use crate::model::{LogLevel, LogSink};
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Check the sink directory and open `<dir>/<name>.log` for appending.
/// Returns `None` for a silent sink.
pub fn open_sink(sink: &LogSink, interface: &str) -> Result<Option<(PathBuf, File)>> {
    if sink.level == LogLevel::Silent {
        return Ok(None);
    }

    if !sink.dir.is_dir() {
        return Err(BrgError::InvalidArgument(format!(
            "Log directory {:?} does not exist",
            sink.dir
        )));
    }

    let path = sink.file_for(interface);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| {
            BrgError::InvalidArgument(format!("Failed to create logfile {:?}: {}", path, e))
        })?;
    Ok(Some((path, file)))
}

fn sink_filter(level: LogLevel) -> EnvFilter {
    let directive = match level {
        LogLevel::Silent => "off",
        LogLevel::Error => "brgnet=error",
        LogLevel::Debug => "brgnet=debug",
    };
    EnvFilter::new(directive)
}

fn sink_layer(sink: &LogSink, interface: &str) -> Result<Option<BoxedLayer>> {
    let Some((_, file)) = open_sink(sink, interface)? else {
        return Ok(None);
    };

    let writer = Mutex::new(file);
    let layer = if sink.json {
        fmt::layer()
            .json()
            .with_writer(writer)
            .with_filter(sink_filter(sink.level))
            .boxed()
    } else {
        fmt::layer()
            .with_ansi(false)
            .with_writer(writer)
            .with_filter(sink_filter(sink.level))
            .boxed()
    };
    Ok(Some(layer))
}

/// Install the global subscriber: stderr, plus the interface's sink if given
pub fn init_logging(verbose: bool, sink: Option<(&LogSink, &str)>) -> Result<()> {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let mut layers: Vec<BoxedLayer> = vec![fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter)
        .boxed()];

    if let Some((sink, interface)) = sink {
        if let Some(layer) = sink_layer(sink, interface)? {
            layers.push(layer);
        }
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .map_err(|e| BrgError::Internal(format!("Failed to install logger: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sink(dir: PathBuf, level: LogLevel) -> LogSink {
        LogSink {
            dir,
            level,
            json: false,
        }
    }

    #[test]
    fn test_open_sink_creates_named_file() {
        let dir = TempDir::new().unwrap();
        let (path, _file) = open_sink(&sink(dir.path().to_path_buf(), LogLevel::Debug), "wg0")
            .unwrap()
            .unwrap();
        assert_eq!(path, dir.path().join("wg0.log"));
        assert!(path.exists());
    }

    #[test]
    fn test_silent_sink_opens_nothing() {
        let dir = TempDir::new().unwrap();
        assert!(open_sink(&sink(dir.path().to_path_buf(), LogLevel::Silent), "wg0")
            .unwrap()
            .is_none());
        assert!(!dir.path().join("wg0.log").exists());
    }

    #[test]
    fn test_missing_directory_is_invalid_argument() {
        let err = open_sink(
            &sink(PathBuf::from("/nonexistent/brgnet-logs"), LogLevel::Error),
            "wg0",
        )
        .unwrap_err();
        assert!(matches!(err, BrgError::InvalidArgument(_)));
    }

    #[test]
    fn test_sink_layer_builds_for_both_formats() {
        let dir = TempDir::new().unwrap();
        let mut s = sink(dir.path().to_path_buf(), LogLevel::Error);
        assert!(sink_layer(&s, "wg0").unwrap().is_some());
        s.json = true;
        assert!(sink_layer(&s, "wg0").unwrap().is_some());
    }
}
