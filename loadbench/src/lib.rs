#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

pub mod aggregator;
pub mod client;
pub mod controller;
pub mod retry;
pub mod scheduler;
pub mod shape;
pub mod sink;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use aggregator::MetricsAggregator;
pub use client::{EndpointClient, OpenAiClient};
pub use controller::{RunController, RunError, RunHandle, RunState};
pub use sink::{HumanSink, JsonLinesSink, MemorySink, OutputSink};

pub mod prelude {
    pub use crate::client::{CompletionRequest, CompletionResponse, EndpointClient, OpenAiClient};
    pub use crate::controller::{RunController, RunError, RunHandle, RunState};
    pub use crate::sink::{HumanSink, JsonLinesSink, MemorySink, OutputSink};
    pub use loadbench_core::{
        ErrorKind, Outcome, OutputFormat, RequestRecord, RunConfig, RunSummary, SamplingParams,
        ShapeProfile,
    };
}
