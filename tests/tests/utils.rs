use loadbench::OpenAiClient;
use loadbench_core::{RunConfig, ShapeProfile};
use mock_service::{MockConfig, MockServer};
use std::io::{self, Write};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[allow(unused)]
pub fn init() {
    static ONCE_LOCK: OnceLock<()> = OnceLock::new();

    ONCE_LOCK.get_or_init(|| {
        let default_panic = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            default_panic(info);
            error!("Panic occurred: {info:?}");
        }));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new("loadbench=debug,mock_service=info"))
            .with_test_writer()
            .try_init();
    });
}

/// Start a mock endpoint and a run configuration pointed at it.
#[allow(unused)]
pub async fn mock(config: MockConfig, rate: f64, duration: Duration) -> (MockServer, RunConfig) {
    init();
    serve(config, rate, duration).await
}

/// [`mock`] without installing the fmt subscriber, for tests that capture logs themselves.
#[allow(unused)]
pub async fn serve(config: MockConfig, rate: f64, duration: Duration) -> (MockServer, RunConfig) {
    let server = MockServer::start(config).await.unwrap();
    let config = RunConfig::new(&server.url(), "mock-deployment")
        .rate(rate)
        .duration(duration)
        .shape_profile(ShapeProfile::Custom)
        .context_tokens(40)
        .max_tokens(8)
        .stats_interval(Duration::from_millis(500));
    (server, config)
}

#[allow(unused)]
pub fn client(config: &RunConfig) -> Arc<OpenAiClient> {
    Arc::new(OpenAiClient::from_config(config, Some("test-key".to_string())).unwrap())
}

/// A `Write` whose bytes stay readable after the sink owning it is gone.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

#[allow(unused)]
impl SharedBuffer {
    pub fn lines(&self) -> Vec<serde_json::Value> {
        let bytes = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&bytes)
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
