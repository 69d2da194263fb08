use crate::error::CliError;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_FILTER: &str = "loadbench=info,loadbench_cli=info";

/// Install the global subscriber: human-readable logs on stderr, plus a plain-text copy in
/// `log_dir` when given. `RUST_LOG` overrides the default filter. Returns the log file path.
pub fn init(log_dir: Option<&Path>, stamp: &str) -> Result<Option<PathBuf>, CliError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let (file_layer, path) = match log_dir {
        Some(dir) => {
            let path = dir.join(format!("loadbench-{stamp}.log"));
            let file = File::create(&path).map_err(|source| CliError::Io {
                path: path.clone(),
                source,
            })?;
            let layer = fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file));
            (Some(layer), Some(path))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .map_err(|err| CliError::Logging(err.to_string()))?;

    Ok(path)
}
