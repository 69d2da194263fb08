mod utils;
#[allow(unused)]
use utils::*;

use loadbench::prelude::*;
use mock_service::MockConfig;
use ntest::timeout;
use std::time::Duration;
use tracing_test::traced_test;

#[traced_test]
#[tokio::test(flavor = "multi_thread")]
#[timeout(20_000)]
async fn ping_and_model_land_in_the_summary() {
    let (_server, config) = serve(MockConfig::default(), 5., Duration::from_secs(1)).await;
    let config = config.ping_samples(3);
    let sink = MemorySink::new();
    let summary = RunController::new(config.clone(), client(&config), sink.clone())
        .unwrap()
        .run()
        .await
        .unwrap();

    let adjustment = summary.latency_adjustment.unwrap();
    assert!(adjustment > Duration::ZERO);
    assert!(adjustment < Duration::from_secs(1));
    assert_eq!(summary.model.as_deref(), Some("gpt-4o-2024-08-06"));
    assert!(sink
        .records()
        .iter()
        .all(|r| r.model.as_deref() == Some("gpt-4o-2024-08-06")));

    let (e2e, adjusted) = (summary.e2e.unwrap(), summary.e2e_adjusted.unwrap());
    assert_eq!(adjusted.count, e2e.count);
    assert!(adjusted.avg < e2e.avg);
    assert!(summary.ttft_adjusted.unwrap().p50 <= summary.ttft.unwrap().p50);

    assert!(logs_contain("Average ping to endpoint:"));
    assert!(logs_contain("Model detected: gpt-4o-2024-08-06"));
}

#[traced_test]
#[tokio::test(flavor = "multi_thread")]
#[timeout(20_000)]
async fn usage_is_requested_and_reported() {
    let (_server, config) = serve(MockConfig::default(), 5., Duration::from_secs(1)).await;
    // The mock streams one chunk per token but bills `n` completions in its usage chunk.
    let config = config.sampling(SamplingParams {
        completions: Some(2),
        ..Default::default()
    });
    let sink = MemorySink::new();
    let summary = RunController::new(config.clone(), client(&config), sink.clone())
        .unwrap()
        .run()
        .await
        .unwrap();

    let records = sink.records();
    assert!(!records.is_empty());
    for record in &records {
        assert!(record.outcome.is_success(), "{record:?}");
        assert_eq!(record.generated_tokens, 16);
        assert_eq!(record.context_tokens, 40);
    }
    assert_eq!(summary.generated_tokens, 16 * records.len() as u64);
    assert!(logs_contain("Run finished"));
}
