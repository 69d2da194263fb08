use loadbench::{HumanSink, JsonLinesSink, OutputSink};
use loadbench_core::{OutputFormat, RequestRecord, RunSummary};
use std::fs::File;
use std::io::{self, BufWriter, Stdout};

/// Stdout in the chosen format, optionally mirrored as JSON lines into a file.
pub struct CliSink {
    stdout: Box<dyn OutputSink>,
    archive: Option<JsonLinesSink<BufWriter<File>>>,
}

impl CliSink {
    pub fn new(format: OutputFormat, archive: Option<File>) -> Self {
        let stdout: Box<dyn OutputSink> = match format {
            OutputFormat::Jsonl => Box::new(JsonLinesSink::<Stdout>::new(io::stdout())),
            OutputFormat::Human => Box::new(HumanSink::<Stdout>::new(io::stdout())),
        };
        Self {
            stdout,
            archive: archive.map(|file| JsonLinesSink::new(BufWriter::new(file))),
        }
    }
}

impl OutputSink for CliSink {
    fn record(&mut self, record: &RequestRecord) -> io::Result<()> {
        let primary = self.stdout.record(record);
        if let Some(archive) = &mut self.archive {
            archive.record(record)?;
        }
        primary
    }

    fn stats(&mut self, snapshot: &RunSummary) -> io::Result<()> {
        let primary = self.stdout.stats(snapshot);
        if let Some(archive) = &mut self.archive {
            archive.stats(snapshot)?;
        }
        primary
    }

    fn summary(&mut self, summary: &RunSummary) -> io::Result<()> {
        let primary = self.stdout.summary(summary);
        if let Some(archive) = &mut self.archive {
            archive.summary(summary)?;
        }
        primary
    }
}
