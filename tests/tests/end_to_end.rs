mod utils;
#[allow(unused)]
use utils::*;

use loadbench::prelude::*;
use mock_service::MockConfig;
use ntest::timeout;
use std::collections::HashSet;
use std::num::NonZeroU32;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread")]
#[timeout(20_000)]
async fn streams_at_target_rate() {
    let (server, config) = mock(MockConfig::default(), 10., Duration::from_secs(3)).await;
    let sink = MemorySink::new();
    let summary = RunController::new(config.clone(), client(&config), sink.clone())
        .unwrap()
        .run()
        .await
        .unwrap();

    let records = sink.records();
    assert!((28..=31).contains(&records.len()), "{} records", records.len());
    assert_eq!(
        records.iter().map(|r| r.request_id).collect::<HashSet<_>>().len(),
        records.len()
    );
    for record in &records {
        assert!(record.outcome.is_success(), "{record:?}");
        assert_eq!(record.status_code, Some(200));
        assert_eq!(record.generated_tokens, 8);
        assert!(record.context_tokens > 0);
        assert!(record.ttft.unwrap() >= Duration::from_millis(15));
        assert!(record.latency.unwrap() >= record.ttft.unwrap());
        assert_eq!(record.utilization, Some(35.));
    }

    assert_eq!(server.stats.requests(), records.len() as u64);
    assert_eq!(summary.total_requests, records.len() as u64);
    assert_eq!(summary.generated_tokens, 8 * records.len() as u64);
    assert_eq!(summary.e2e.unwrap().count, records.len() as u64);
    assert_eq!(summary.utilization.unwrap().p50, 35.);
    assert!(summary.throughput.requests_per_sec > 8.);
}

#[tokio::test(flavor = "multi_thread")]
#[timeout(20_000)]
async fn throttled_attempts_are_reported() {
    let mock_config = MockConfig {
        max_rps: NonZeroU32::new(2),
        retry_after: Duration::from_millis(50),
        ..Default::default()
    };
    let (server, config) = mock(mock_config, 10., Duration::from_secs(2)).await;
    let sink = MemorySink::new();
    let summary = RunController::new(config.clone(), client(&config), sink.clone())
        .unwrap()
        .run()
        .await
        .unwrap();

    let throttled = summary.failures_of(ErrorKind::Throttled);
    assert!(throttled >= 5, "{summary:?}");
    assert!(summary.successes >= 2);
    assert_eq!(throttled, server.stats.throttled());
    assert_eq!(summary.throttled_attempts, throttled);
    assert!(sink.records().iter().all(|r| match &r.outcome {
        Outcome::Success => r.throttled_attempts == 0,
        Outcome::Failure {
            retries_exhausted, ..
        } => r.status_code == Some(429) && *retries_exhausted,
    }));
}

#[tokio::test(flavor = "multi_thread")]
#[timeout(20_000)]
async fn retries_through_an_outage() {
    let mock_config = MockConfig {
        fail_first: 3,
        ..Default::default()
    };
    let (server, config) = mock(mock_config, 5., Duration::from_secs(10)).await;
    let config = config
        .max_requests(3)
        .max_retries(5)
        .retry_delays(Duration::from_millis(10), Duration::from_millis(50));
    let sink = MemorySink::new();
    let summary = RunController::new(config.clone(), client(&config), sink.clone())
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(summary.total_requests, 3);
    assert_eq!(summary.successes, 3);
    assert_eq!(summary.retries, 3);
    assert_eq!(server.stats.failed(), 3);
    assert_eq!(server.stats.requests(), 6);
    assert!(!summary.early_terminated);
}

#[tokio::test(flavor = "multi_thread")]
#[timeout(20_000)]
async fn slow_requests_hit_the_drain_timeout() {
    let mock_config = MockConfig {
        ttft: Duration::from_secs(10),
        ..Default::default()
    };
    let (_server, config) = mock(mock_config, 5., Duration::from_secs(1)).await;
    let config = config.drain_timeout(Duration::from_millis(300));
    let sink = MemorySink::new();
    let summary = RunController::new(config.clone(), client(&config), sink.clone())
        .unwrap()
        .run()
        .await
        .unwrap();

    let records = sink.records();
    assert!(records.len() >= 3, "{} records", records.len());
    assert!(records
        .iter()
        .all(|r| r.outcome.error() == Some(ErrorKind::DrainTimeout)));
    assert_eq!(summary.failures_of(ErrorKind::DrainTimeout), records.len() as u64);
    assert!(summary.e2e.is_none());
}

#[tokio::test(flavor = "multi_thread")]
#[timeout(20_000)]
async fn json_lines_output() {
    let (_server, config) = mock(MockConfig::default(), 5., Duration::from_secs(2)).await;
    let buffer = SharedBuffer::default();
    let summary = RunController::new(
        config.clone(),
        client(&config),
        JsonLinesSink::new(buffer.clone()),
    )
    .unwrap()
    .run()
    .await
    .unwrap();

    let lines = buffer.lines();
    let of_type = |t: &str| lines.iter().filter(|l| l["type"] == t).count();
    assert_eq!(of_type("record") as u64, summary.total_requests);
    assert!(of_type("stats") >= 2);
    assert_eq!(of_type("summary"), 1);

    let last = lines.last().unwrap();
    assert_eq!(last["type"], "summary");
    assert_eq!(last["final"], true);
    assert_eq!(last["total_requests"], summary.total_requests);

    let record = lines.iter().find(|l| l["type"] == "record").unwrap();
    assert_eq!(record["status"], "success");
    assert_eq!(record["shape"]["max_tokens"], 8);
    assert!(record["ttft"].as_f64().unwrap() > 0.);
}
