use clap::Parser;
use loadbench_cli::{logging, runner, Args, CliError};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let stamp = time::OffsetDateTime::now_utc().unix_timestamp().to_string();

    if let Some(dir) = &args.log_save_dir {
        std::fs::create_dir_all(dir).map_err(|source| CliError::Io {
            path: dir.clone(),
            source,
        })?;
    }
    if let Some(path) = logging::init(args.log_save_dir.as_deref(), &stamp)? {
        tracing::info!("Logging to {}", path.display());
    }

    let summary = runner::run(&args, &stamp).await?;
    if summary.successes == 0 && summary.total_requests > 0 {
        anyhow::bail!("no request succeeded ({} failed)", summary.failures);
    }
    Ok(())
}
