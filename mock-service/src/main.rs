use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use mock_service::MockConfig;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], env_or("MOCK_METRICS_PORT", 8002)?))
        .install()
        .context("installing the Prometheus exporter")?;

    let config = MockConfig {
        ttft: Duration::from_millis(env_or("MOCK_TTFT_MS", 200)?),
        token_interval: Duration::from_millis(env_or("MOCK_TOKEN_INTERVAL_MS", 10)?),
        jitter_ms: env_or("MOCK_JITTER_MS", 0.)?,
        max_rps: NonZeroU32::new(env_or("MOCK_MAX_RPS", 0)?),
        retry_after: Duration::from_millis(env_or("MOCK_RETRY_AFTER_MS", 1000)?),
        fail_first: env_or("MOCK_FAIL_FIRST", 0)?,
        failure_rate: env_or("MOCK_FAILURE_RATE", 0.)?,
        utilization: env_or("MOCK_UTILIZATION", 35.)?,
        model: env_or("MOCK_MODEL", "gpt-4o-2024-08-06".to_string())?,
    };

    let addr = std::env::var("MOCK_ADDR").unwrap_or_else(|_| "0.0.0.0:3002".to_string());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!("Mock service listening on {addr} with {config:?}");

    mock_service::run(listener, config).await?;
    Ok(())
}

fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(value) => value.parse().with_context(|| format!("parsing {key}={value}")),
        Err(_) => Ok(default),
    }
}
