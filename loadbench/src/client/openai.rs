use super::{CompletionRequest, CompletionResponse, EndpointClient, TransportError};
use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures_util::{Stream, StreamExt};
use loadbench_core::{ErrorKind, RunConfig, PING_TIMEOUT};
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
#[allow(unused)]
use tracing::{debug, error, info, trace, warn};
use url::Url;

const UTILIZATION_HEADER: &str = "azure-openai-deployment-utilization";
const RETRY_AFTER_MS_HEADER: &str = "retry-after-ms";
const RETRY_AFTER_HEADER: &str = "retry-after";

#[derive(Debug, Error)]
pub enum ClientBuildError {
    #[error("Invalid endpoint URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Unable to build the HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Which URL layout and auth header the endpoint expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFlavor {
    /// `/openai/deployments/{deployment}/chat/completions?api-version=..`, `api-key` header.
    Azure,
    /// `/v1/chat/completions` with the deployment as `model`, bearer auth.
    OpenAi,
}

impl ApiFlavor {
    pub fn detect(endpoint: &Url) -> Self {
        match endpoint.host_str() {
            Some(host) if host == "openai.com" || host.ends_with(".openai.com") => ApiFlavor::OpenAi,
            _ => ApiFlavor::Azure,
        }
    }
}

/// Streaming chat-completions client for Azure OpenAI and OpenAI-compatible servers.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    url: Url,
    flavor: ApiFlavor,
    deployment: String,
    api_key: Option<String>,
}

impl OpenAiClient {
    pub fn new(
        endpoint: &str,
        deployment: &str,
        api_version: &str,
        api_key: Option<String>,
        timeout: Duration,
        pool_size: usize,
    ) -> Result<Self, ClientBuildError> {
        let mut base = Url::parse(endpoint)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let flavor = ApiFlavor::detect(&base);
        let url = match flavor {
            ApiFlavor::Azure => {
                let mut url = base.join(&format!("openai/deployments/{deployment}/chat/completions"))?;
                url.query_pairs_mut().append_pair("api-version", api_version);
                url
            }
            ApiFlavor::OpenAi if base.path().ends_with("/v1/") => base.join("chat/completions")?,
            ApiFlavor::OpenAi => base.join("v1/chat/completions")?,
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(pool_size)
            .build()?;

        Ok(Self {
            http,
            url,
            flavor,
            deployment: deployment.to_string(),
            api_key,
        })
    }

    pub fn from_config(config: &RunConfig, api_key: Option<String>) -> Result<Self, ClientBuildError> {
        Self::new(
            &config.endpoint,
            &config.deployment,
            &config.api_version,
            api_key,
            config.request_timeout,
            config.concurrency,
        )
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn flavor(&self) -> ApiFlavor {
        self.flavor
    }

    fn request(&self, body: &CompletionRequest) -> Result<reqwest::RequestBuilder, TransportError> {
        let mut json = serde_json::to_value(body)
            .map_err(|err| TransportError::new(ErrorKind::ClientError, err.to_string()))?;

        let builder = self.http.post(self.url.clone());
        let builder = match (self.flavor, &self.api_key) {
            (ApiFlavor::Azure, Some(key)) => builder.header("api-key", key),
            (ApiFlavor::OpenAi, Some(key)) => builder.bearer_auth(key),
            (_, None) => builder,
        };

        if self.flavor == ApiFlavor::OpenAi {
            json["model"] = serde_json::Value::String(self.deployment.clone());
        }

        Ok(builder.json(&json))
    }
}

impl EndpointClient for OpenAiClient {
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, TransportError> {
        let builder = self.request(request)?;

        let start = Instant::now();
        let response = builder.send().await.map_err(transport_error)?;

        let status = response.status().as_u16();
        let retry_after = retry_after(response.headers());
        let utilization = utilization(response.headers());

        if !response.status().is_success() {
            let body = response.text().await.ok();
            trace!("Endpoint answered {status}: {body:?}");
            return Ok(CompletionResponse {
                status,
                latency: start.elapsed(),
                retry_after,
                utilization,
                body,
                ..Default::default()
            });
        }

        let streaming = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("text/event-stream"));

        let streamed = if streaming {
            read_events(response.bytes_stream().eventsource(), start, transport_error).await?
        } else {
            let body: CompletionBody = response.json().await.map_err(transport_error)?;
            Streamed {
                usage: body.usage,
                model: body.model,
                ..Default::default()
            }
        };

        Ok(CompletionResponse {
            status,
            latency: start.elapsed(),
            ttft: streamed.ttft,
            generated_tokens: streamed
                .usage
                .map(|u| u.completion_tokens)
                .unwrap_or(streamed.chunks),
            prompt_tokens: streamed.usage.map(|u| u.prompt_tokens),
            retry_after,
            utilization,
            model: streamed.model,
            body: None,
        })
    }

    async fn ping(&self) -> Result<Duration, TransportError> {
        let start = Instant::now();
        // Any status counts; only the round trip matters.
        self.http
            .head(self.url.clone())
            .timeout(PING_TIMEOUT)
            .send()
            .await
            .map_err(transport_error)?;
        Ok(start.elapsed())
    }
}

/// What a successful body carried.
#[derive(Debug, Default)]
struct Streamed {
    ttft: Option<Duration>,
    chunks: u32,
    usage: Option<Usage>,
    model: Option<String>,
}

/// Consume chat-completion chunks until `[DONE]` or the end of the body.
async fn read_events<S, E>(
    events: S,
    start: Instant,
    transport: impl Fn(E) -> TransportError,
) -> Result<Streamed, TransportError>
where
    S: Stream<Item = Result<Event, EventStreamError<E>>>,
    E: fmt::Display,
{
    let mut events = std::pin::pin!(events);
    let mut out = Streamed::default();

    while let Some(event) = events.next().await {
        let data = match event {
            Ok(event) => event.data,
            Err(EventStreamError::Transport(err)) => return Err(transport(err)),
            Err(err) => {
                return Err(TransportError::new(ErrorKind::InvalidResponse, err.to_string()))
            }
        };

        let data = data.trim();
        if data == "[DONE]" {
            break;
        }
        if data.is_empty() {
            continue;
        }

        let chunk: StreamChunk = serde_json::from_str(data)
            .map_err(|err| TransportError::new(ErrorKind::InvalidResponse, err.to_string()))?;
        if chunk.has_content() {
            out.ttft.get_or_insert_with(|| start.elapsed());
            out.chunks += 1;
        }
        if chunk.usage.is_some() {
            out.usage = chunk.usage;
        }
        if out.model.is_none() {
            out.model = chunk.model.filter(|m| !m.is_empty());
        }
    }

    Ok(out)
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<Usage>,
    model: Option<String>,
}

impl StreamChunk {
    fn has_content(&self) -> bool {
        self.choices.iter().any(|c| {
            c.delta
                .as_ref()
                .and_then(|d| d.content.as_deref())
                .is_some_and(|s| !s.is_empty())
        })
    }
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<Delta>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionBody {
    usage: Option<Usage>,
    model: Option<String>,
}

fn transport_error(err: reqwest::Error) -> TransportError {
    let kind = if err.is_timeout() {
        ErrorKind::Timeout
    } else if err.is_decode() {
        ErrorKind::InvalidResponse
    } else if err.is_builder() {
        ErrorKind::ClientError
    } else {
        ErrorKind::Connection
    };
    TransportError::new(kind, err.to_string())
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    // Out-of-range values are dropped; the retry policy caps whatever survives.
    let ms = header(RETRY_AFTER_MS_HEADER)
        .and_then(|v| v.trim().parse::<f64>().ok())
        .and_then(|ms| Duration::try_from_secs_f64(ms / 1000.).ok());
    if ms.is_some() {
        return ms;
    }

    header(RETRY_AFTER_HEADER)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn utilization(headers: &HeaderMap) -> Option<f64> {
    headers
        .get(UTILIZATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().trim_end_matches('%').parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use reqwest::header::HeaderValue;
    use std::convert::Infallible;

    fn body(parts: &[&'static str]) -> impl Stream<Item = Result<&'static [u8], Infallible>> {
        stream::iter(parts.iter().map(|p| Ok(p.as_bytes())).collect::<Vec<_>>())
    }

    async fn read(parts: &[&'static str]) -> Result<Streamed, TransportError> {
        read_events(body(parts).eventsource(), Instant::now(), |never: Infallible| {
            match never {}
        })
        .await
    }

    #[test]
    fn test_azure_url() {
        let client = OpenAiClient::new(
            "https://my-resource.openai.azure.com",
            "gpt-4o",
            "2024-02-01",
            None,
            Duration::from_secs(5),
            4,
        )
        .unwrap();
        assert_eq!(client.flavor(), ApiFlavor::Azure);
        assert_eq!(
            client.url().as_str(),
            "https://my-resource.openai.azure.com/openai/deployments/gpt-4o/chat/completions?api-version=2024-02-01"
        );
    }

    #[test]
    fn test_azure_url_keeps_path_prefix() {
        let client = OpenAiClient::new(
            "http://127.0.0.1:3002/proxy",
            "dep",
            "2024-02-01",
            None,
            Duration::from_secs(5),
            4,
        )
        .unwrap();
        assert_eq!(
            client.url().path(),
            "/proxy/openai/deployments/dep/chat/completions"
        );
    }

    #[test]
    fn test_openai_url() {
        for endpoint in ["https://api.openai.com", "https://api.openai.com/v1"] {
            let client =
                OpenAiClient::new(endpoint, "gpt-4o", "", None, Duration::from_secs(5), 4).unwrap();
            assert_eq!(client.flavor(), ApiFlavor::OpenAi);
            assert_eq!(
                client.url().as_str(),
                "https://api.openai.com/v1/chat/completions"
            );
        }
    }

    #[test]
    fn test_retry_after_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);

        headers.insert(RETRY_AFTER_HEADER, HeaderValue::from_static("2"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(2)));

        headers.insert(RETRY_AFTER_MS_HEADER, HeaderValue::from_static("150"));
        assert_eq!(retry_after(&headers), Some(Duration::from_millis(150)));
    }

    #[test]
    fn test_unrepresentable_retry_after_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER_HEADER, HeaderValue::from_static("3"));
        for bogus in ["1e30", "-5", "NaN", "inf"] {
            headers.insert(RETRY_AFTER_MS_HEADER, HeaderValue::from_static(bogus));
            assert_eq!(retry_after(&headers), Some(Duration::from_secs(3)), "{bogus}");
        }
        headers.remove(RETRY_AFTER_HEADER);
        headers.insert(RETRY_AFTER_MS_HEADER, HeaderValue::from_static("1e30"));
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn test_utilization_header() {
        let mut headers = HeaderMap::new();
        headers.insert(UTILIZATION_HEADER, HeaderValue::from_static("42.5%"));
        assert_eq!(utilization(&headers), Some(42.5));

        headers.insert(UTILIZATION_HEADER, HeaderValue::from_static("n/a"));
        assert_eq!(utilization(&headers), None);
    }

    #[test]
    fn test_stream_chunk_content() {
        let chunk: StreamChunk =
            serde_json::from_str(r#"{"choices":[{"delta":{"content":"hi"}}]}"#).unwrap();
        assert!(chunk.has_content());

        let chunk: StreamChunk =
            serde_json::from_str(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap();
        assert!(!chunk.has_content());

        let chunk: StreamChunk = serde_json::from_str(
            r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":3,"total_tokens":13}}"#,
        )
        .unwrap();
        assert_eq!(chunk.usage.map(|u| u.completion_tokens), Some(3));
    }

    #[tokio::test]
    async fn test_events_split_across_reads() {
        let streamed = read(&[
            "data: {\"model\":\"gpt-4o-2024-08-06\",\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"he",
            "llo\"}}]}\r\n\r\ndata: {\"choices\":[{\"delta\":{\"content\":\" there\"}}]}\n",
            "\n: keep-alive\n\ndata: {\"choices\":[],\"usage\":{\"prompt_tokens\":9,\"completion_tokens\":2}}\n\n",
            "data: [DONE]\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n\n",
        ])
        .await
        .unwrap();

        assert_eq!(streamed.chunks, 2);
        assert!(streamed.ttft.is_some());
        assert_eq!(streamed.usage.map(|u| u.prompt_tokens), Some(9));
        assert_eq!(streamed.model.as_deref(), Some("gpt-4o-2024-08-06"));
    }

    #[tokio::test]
    async fn test_stream_without_usage_or_done() {
        let streamed = read(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n\n",
        ])
        .await
        .unwrap();
        assert_eq!(streamed.chunks, 2);
        assert!(streamed.usage.is_none());
        assert!(streamed.model.is_none());
    }

    #[tokio::test]
    async fn test_malformed_chunk_is_invalid_response() {
        let err = read(&["data: {not json}\n\n"]).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidResponse);
    }
}
