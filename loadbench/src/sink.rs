//! Where records and summaries go.
use loadbench_core::{Outcome, RequestRecord, RunSummary};
use serde::Serialize;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Destination of a run's output stream.
///
/// Writes happen on the collector task, one call per record, per periodic snapshot and one for
/// the final summary.
pub trait OutputSink: Send + 'static {
    fn record(&mut self, record: &RequestRecord) -> io::Result<()>;

    fn stats(&mut self, snapshot: &RunSummary) -> io::Result<()>;

    fn summary(&mut self, summary: &RunSummary) -> io::Result<()>;
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Line<'a> {
    Record(&'a RequestRecord),
    Stats(&'a RunSummary),
    Summary(&'a RunSummary),
}

/// One JSON object per line, tagged with `"type": "record" | "stats" | "summary"`.
pub struct JsonLinesSink<W> {
    writer: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn line(&mut self, line: Line<'_>) -> io::Result<()> {
        serde_json::to_writer(&mut self.writer, &line)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}

impl<W: Write + Send + 'static> OutputSink for JsonLinesSink<W> {
    fn record(&mut self, record: &RequestRecord) -> io::Result<()> {
        self.line(Line::Record(record))
    }

    fn stats(&mut self, snapshot: &RunSummary) -> io::Result<()> {
        self.line(Line::Stats(snapshot))
    }

    fn summary(&mut self, summary: &RunSummary) -> io::Result<()> {
        self.line(Line::Summary(summary))
    }
}

/// Single-line plain text rendering of the same values.
pub struct HumanSink<W> {
    writer: W,
}

impl<W: Write> HumanSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send + 'static> OutputSink for HumanSink<W> {
    fn record(&mut self, record: &RequestRecord) -> io::Result<()> {
        let status = match &record.outcome {
            Outcome::Success => "ok".to_string(),
            Outcome::Failure {
                error,
                retries_exhausted: true,
                ..
            } => format!("{error} (retries exhausted)"),
            Outcome::Failure { error, .. } => error.to_string(),
        };
        writeln!(
            self.writer,
            "{} {status} e2e={} ttft={} ctx={} gen={} retries={}",
            record.request_id,
            millis(record.latency),
            millis(record.ttft),
            record.context_tokens,
            record.generated_tokens,
            record.retries,
        )
    }

    fn stats(&mut self, snapshot: &RunSummary) -> io::Result<()> {
        writeln!(self.writer, "stats {snapshot}")
    }

    fn summary(&mut self, summary: &RunSummary) -> io::Result<()> {
        writeln!(self.writer, "final {summary}")?;
        self.writer.flush()
    }
}

fn millis(duration: Option<Duration>) -> String {
    match duration {
        Some(d) => format!("{:.0}ms", d.as_secs_f64() * 1000.),
        None => "-".to_string(),
    }
}

/// Keeps everything in memory. Clones share the same buffers.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<MemoryOutput>>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryOutput {
    pub records: Vec<RequestRecord>,
    pub stats: Vec<RunSummary>,
    pub summary: Option<RunSummary>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<RequestRecord> {
        self.lock().records.clone()
    }

    pub fn stats(&self) -> Vec<RunSummary> {
        self.lock().stats.clone()
    }

    pub fn summary(&self) -> Option<RunSummary> {
        self.lock().summary.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryOutput> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl OutputSink for MemorySink {
    fn record(&mut self, record: &RequestRecord) -> io::Result<()> {
        self.lock().records.push(record.clone());
        Ok(())
    }

    fn stats(&mut self, snapshot: &RunSummary) -> io::Result<()> {
        self.lock().stats.push(snapshot.clone());
        Ok(())
    }

    fn summary(&mut self, summary: &RunSummary) -> io::Result<()> {
        self.lock().summary = Some(summary.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::MetricsAggregator;
    use loadbench_core::{ErrorKind, RequestId, ShapeParams};
    use time::OffsetDateTime;

    fn record(outcome: Outcome) -> RequestRecord {
        RequestRecord {
            request_id: RequestId(3),
            shape: ShapeParams {
                context_tokens: 500,
                max_tokens: 500,
            },
            dispatched_at: OffsetDateTime::UNIX_EPOCH,
            completed_at: OffsetDateTime::UNIX_EPOCH,
            retries: 1,
            throttled_attempts: 1,
            outcome,
            status_code: Some(200),
            latency: Some(Duration::from_millis(1500)),
            ttft: Some(Duration::from_millis(300)),
            context_tokens: 500,
            generated_tokens: 120,
            utilization: None,
            model: None,
        }
    }

    #[test]
    fn test_json_lines() {
        let mut sink = JsonLinesSink::new(vec![]);
        sink.record(&record(Outcome::Success)).unwrap();
        let aggregator = MetricsAggregator::new();
        aggregator.submit(&record(Outcome::Success));
        sink.stats(&aggregator.snapshot(Duration::from_secs(1)))
            .unwrap();
        sink.summary(&aggregator.finalize(Duration::from_secs(2), false))
            .unwrap();

        let out = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<serde_json::Value> = out
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["type"], "record");
        assert_eq!(lines[0]["request_id"], 3);
        assert_eq!(lines[0]["status"], "success");
        assert_eq!(lines[0]["latency"], 1.5);
        assert_eq!(lines[1]["type"], "stats");
        assert_eq!(lines[1]["final"], false);
        assert_eq!(lines[2]["type"], "summary");
        assert_eq!(lines[2]["final"], true);
        assert_eq!(lines[2]["total_requests"], 1);
    }

    #[test]
    fn test_human_record_line() {
        let mut sink = HumanSink::new(vec![]);
        sink.record(&record(Outcome::Failure {
            error: ErrorKind::Throttled,
            message: "HTTP 429".to_string(),
            retries_exhausted: true,
        }))
        .unwrap();

        let out = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(
            out,
            "req-3 throttled (retries exhausted) e2e=1500ms ttft=300ms ctx=500 gen=120 retries=1\n"
        );
    }

    #[test]
    fn test_memory_sink_shares_buffers() {
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        writer.record(&record(Outcome::Success)).unwrap();
        assert_eq!(sink.records().len(), 1);
        assert!(sink.summary().is_none());
    }
}
