//! CLI command implementations.

use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, USER_AGENT};
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use pktscope_observer::{
    ObserveLayer, ObservedBody, ObserverConfig, ObserverError, ObservingReader, ReqwestTransport,
    RequestIdLayer, Tag, TraceEvent, TraceSink,
};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tower::util::BoxCloneService;
use tower::{ServiceBuilder, ServiceExt};

/// CLI errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Observer error: {0}")]
    Observer(#[from] ObserverError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Remote answered {0}")]
    Status(StatusCode),
}

pub type Result<T> = std::result::Result<T, CliError>;

/// Observed HTTP stack used by the network commands.
pub type Transport =
    BoxCloneService<Request<Full<Bytes>>, Response<ObservedBody<reqwest::Body>>, reqwest::Error>;

const USER_AGENT_VALUE: &str = concat!("pktscope/", env!("CARGO_PKG_VERSION"));

/// Builds the reqwest-backed transport wrapped in the observer layers.
pub fn build_transport(config: &ObserverConfig) -> Result<Transport> {
    let client = reqwest::Client::builder().build()?;
    let observed = ServiceBuilder::new()
        .layer(ObserveLayer::from_config(config)?)
        .service(ReqwestTransport::new(client));

    let transport = match RequestIdLayer::from_config(config)? {
        Some(layer) => BoxCloneService::new(ServiceBuilder::new().layer(layer).service(observed)),
        None => BoxCloneService::new(observed),
    };
    Ok(transport)
}

/// What a network command moved over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exchange {
    pub status: StatusCode,
    pub response_bytes: u64,
}

/// Fetch the ref advertisement of a smart-HTTP remote.
pub async fn probe(
    transport: Transport,
    url: &str,
    service: &str,
    protocol_v2: bool,
) -> Result<Exchange> {
    let target = info_refs_url(url, service);
    tracing::info!(url = %target, "Probing remote");

    let mut builder = Request::get(target.as_str()).header(USER_AGENT, USER_AGENT_VALUE);
    if protocol_v2 {
        builder = builder.header("git-protocol", "version=2");
    }
    let request = builder
        .body(Full::new(Bytes::new()))
        .map_err(|e| CliError::InvalidRequest(e.to_string()))?;

    exchange(transport, request).await
}

/// POST a captured request body to a service endpoint.
pub async fn replay(
    transport: Transport,
    url: &str,
    service: &str,
    request_path: &Path,
) -> Result<Exchange> {
    let body = std::fs::read(request_path)?;
    let target = service_url(url, service);
    tracing::info!(url = %target, bytes = body.len(), "Replaying request");

    let request = Request::post(target.as_str())
        .header(USER_AGENT, USER_AGENT_VALUE)
        .header(CONTENT_TYPE, format!("application/x-{service}-request"))
        .header(ACCEPT, format!("application/x-{service}-result"))
        .header(CONTENT_LENGTH, body.len())
        .body(Full::new(Bytes::from(body)))
        .map_err(|e| CliError::InvalidRequest(e.to_string()))?;

    exchange(transport, request).await
}

async fn exchange(transport: Transport, request: Request<Full<Bytes>>) -> Result<Exchange> {
    let response = transport.oneshot(request).await?;
    let status = response.status();

    // Dropping the body at the end of this call flushes its decoder.
    let mut body = response.into_body();
    let mut response_bytes = 0u64;
    while let Some(frame) = body.frame().await {
        if let Some(data) = frame?.data_ref() {
            response_bytes += data.len() as u64;
        }
    }
    drop(body);

    if !status.is_success() {
        return Err(CliError::Status(status));
    }
    Ok(Exchange {
        status,
        response_bytes,
    })
}

fn info_refs_url(url: &str, service: &str) -> String {
    format!("{}/info/refs?service={}", url.trim_end_matches('/'), service)
}

fn service_url(url: &str, service: &str) -> String {
    format!("{}/{}", url.trim_end_matches('/'), service)
}

/// Sink that prints each event as a line on a writer.
pub struct PrintSink<W> {
    out: parking_lot::Mutex<W>,
    payload_preview: Option<usize>,
}

impl<W: Write> PrintSink<W> {
    pub fn new(out: W, payload_preview: Option<usize>) -> Self {
        Self {
            out: parking_lot::Mutex::new(out),
            payload_preview,
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

impl<W: Write + Send> TraceSink for PrintSink<W> {
    fn emit(&self, tag: &Tag, event: &TraceEvent) {
        // Output is best-effort; a closed pipe must not abort decoding.
        let _ = writeln!(
            self.out.lock(),
            "[{}] {}",
            tag,
            event.render(self.payload_preview)
        );
    }
}

/// Decode a captured pkt-line stream offline, printing every event.
pub fn decode<R: Read, W: Write + Send + 'static>(
    input: R,
    sink: Arc<PrintSink<W>>,
    tag: &str,
) -> Result<u64> {
    let mut reader = ObservingReader::new(input, Tag::new(tag), sink);
    let decoded = io::copy(&mut reader, &mut io::sink())?;
    reader.close();
    Ok(decoded)
}

/// Opens `path`, or stdin when it is `None` or `-`.
pub fn open_input(path: Option<&Path>) -> Result<Box<dyn Read>> {
    match path {
        Some(p) if p != Path::new("-") => Ok(Box::new(File::open(p)?)),
        _ => Ok(Box::new(io::stdin().lock())),
    }
}
