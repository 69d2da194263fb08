//! The `loadbench` command: flags, logging and output wiring around [`loadbench::RunController`].
pub mod args;
pub mod error;
pub mod logging;
pub mod output;
pub mod runner;

pub use args::Args;
pub use error::CliError;
