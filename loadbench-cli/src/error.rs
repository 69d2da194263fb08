use loadbench::client::ClientBuildError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Unable to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unable to set up logging: {0}")]
    Logging(String),

    #[error("Unable to start the Prometheus exporter: {0}")]
    Metrics(String),

    #[error("Unable to build the endpoint client: {0}")]
    Client(#[from] ClientBuildError),
}
