use crate::args::Args;
use crate::error::CliError;
use crate::output::CliSink;
use loadbench::{OpenAiClient, RunController};
use loadbench_core::RunSummary;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::fs::File;
use std::sync::Arc;
#[allow(unused)]
use tracing::{debug, error, info, warn};

/// Run a load test as described by `args`. `stamp` names the files written to the log
/// directory.
pub async fn run(args: &Args, stamp: &str) -> anyhow::Result<RunSummary> {
    let config = args.to_config();
    config.validate()?;
    info!("Configuration: {}", serde_json::to_string(&config)?);

    let api_key = std::env::var(&args.api_key_env).ok();
    if api_key.is_none() {
        warn!(
            "${} is not set, sending requests without an API key",
            args.api_key_env
        );
    }
    let client = OpenAiClient::from_config(&config, api_key).map_err(CliError::from)?;
    debug!("Sending requests to {}", client.url());

    let archive = match &args.log_save_dir {
        Some(dir) => {
            let path = dir.join(format!("loadbench-{stamp}.jsonl"));
            info!("Saving output to {}", path.display());
            Some(File::create(&path).map_err(|source| CliError::Io { path, source })?)
        }
        None => None,
    };

    if let Some(addr) = args.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|err| CliError::Metrics(err.to_string()))?;
        info!("Serving Prometheus metrics on http://{addr}/metrics");
    }

    let sink = CliSink::new(config.output_format, archive);
    let controller = RunController::new(config, Arc::new(client), sink)?;

    let handle = controller.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, draining in-flight requests");
            handle.stop();
        }
    });

    Ok(controller.run().await?)
}
