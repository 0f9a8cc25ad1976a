//! Tower middleware that traces the pkt-line traffic of every request.
//!
//! [`ObserveLayer`] wraps any HTTP client service. Each request gets a fresh
//! numeric tag, its head is logged, and both bodies are wrapped in
//! [`ObservedBody`] so frames are decoded lazily as the bodies stream.

use futures_util::future::BoxFuture;
use http::{HeaderMap, Request, Response};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

use crate::body::ObservedBody;
use crate::config::ObserverConfig;
use crate::sink::{TraceEvent, TraceSink, TracingSink};
use crate::tag::RequestCounter;
use crate::Result;

/// Renders request and response heads for the trace.
#[derive(Debug, Clone)]
pub struct HeadRenderer {
    dump_headers: bool,
    redact: Vec<http::HeaderName>,
}

impl HeadRenderer {
    /// Builds a renderer from a validated configuration.
    pub fn from_config(config: &ObserverConfig) -> Result<Self> {
        Ok(Self {
            dump_headers: config.dump_headers,
            redact: config.redacted_header_names()?,
        })
    }

    /// Request line followed by headers, or `None` if heads are not dumped.
    pub fn request<B>(&self, request: &Request<B>) -> Option<String> {
        if !self.dump_headers {
            return None;
        }
        let target = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let mut out = format!("{} {} {:?}", request.method(), target, request.version());
        if let Some(host) = request.uri().host() {
            if !request.headers().contains_key(http::header::HOST) {
                out.push_str(&format!("\nhost: {host}"));
            }
        }
        self.push_headers(&mut out, request.headers());
        Some(out)
    }

    /// Status line followed by headers, or `None` if heads are not dumped.
    pub fn response<B>(&self, response: &Response<B>) -> Option<String> {
        if !self.dump_headers {
            return None;
        }
        let mut out = format!("{:?} {}", response.version(), response.status());
        self.push_headers(&mut out, response.headers());
        Some(out)
    }

    fn push_headers(&self, out: &mut String, headers: &HeaderMap) {
        for (name, value) in headers {
            let value = if self.redact.contains(name) {
                Cow::Borrowed("<redacted>")
            } else {
                String::from_utf8_lossy(value.as_bytes())
            };
            out.push('\n');
            out.push_str(name.as_str());
            out.push_str(": ");
            out.push_str(&value);
        }
    }
}

impl Default for HeadRenderer {
    fn default() -> Self {
        Self {
            dump_headers: true,
            redact: Vec::new(),
        }
    }
}

/// Layer that adds pkt-line tracing to an HTTP client service.
#[derive(Clone)]
pub struct ObserveLayer {
    shared: Arc<Shared>,
}

struct Shared {
    counter: RequestCounter,
    sink: Arc<dyn TraceSink>,
    heads: HeadRenderer,
}

impl ObserveLayer {
    /// Creates a layer that reports to `sink` and dumps full heads.
    pub fn new(sink: Arc<dyn TraceSink>) -> Self {
        Self::with_renderer(sink, HeadRenderer::default())
    }

    /// Creates a layer that renders heads with `heads`.
    pub fn with_renderer(sink: Arc<dyn TraceSink>, heads: HeadRenderer) -> Self {
        Self {
            shared: Arc::new(Shared {
                counter: RequestCounter::new(),
                sink,
                heads,
            }),
        }
    }

    /// Creates a layer that logs through `tracing` according to `config`.
    pub fn from_config(config: &ObserverConfig) -> Result<Self> {
        let sink = TracingSink::new().with_payload_preview(config.payload_preview);
        Ok(Self::with_renderer(
            Arc::new(sink),
            HeadRenderer::from_config(config)?,
        ))
    }

    /// Number of requests observed so far.
    pub fn requests_observed(&self) -> u64 {
        self.shared.counter.issued()
    }
}

impl fmt::Debug for ObserveLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserveLayer")
            .field("requests_observed", &self.requests_observed())
            .finish_non_exhaustive()
    }
}

impl<S> Layer<S> for ObserveLayer {
    type Service = Observe<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Observe {
            inner,
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Service produced by [`ObserveLayer`].
#[derive(Clone)]
pub struct Observe<S> {
    inner: S,
    shared: Arc<Shared>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for Observe<S>
where
    S: Service<Request<ObservedBody<ReqBody>>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: fmt::Display + Send + 'static,
    ResBody: Send + 'static,
{
    type Response = Response<ObservedBody<ResBody>>;
    type Error = S::Error;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let shared = Arc::clone(&self.shared);
        let tag = shared.counter.next_tag();
        let uri = request.uri().to_string();

        shared.sink.emit(
            &tag,
            &TraceEvent::RequestSent {
                uri: uri.clone(),
                head: shared.heads.request(&request),
            },
        );

        // The transport reads the request body through the observer, so
        // request frames are logged as they are sent.
        let request = request.map(|body| {
            ObservedBody::new(body, tag.request(), Arc::clone(&shared.sink))
        });
        let future = self.inner.call(request);

        Box::pin(async move {
            let response = match future.await {
                Ok(response) => response,
                Err(err) => {
                    shared.sink.emit(
                        &tag,
                        &TraceEvent::TransportError {
                            message: err.to_string(),
                        },
                    );
                    return Err(err);
                }
            };

            shared.sink.emit(
                &tag,
                &TraceEvent::ResponseReceived {
                    status: response.status().as_u16(),
                    uri,
                    head: shared.heads.response(&response),
                },
            );

            Ok(response.map(|body| ObservedBody::new(body, tag.response(), shared.sink.clone())))
        })
    }
}

impl<S: fmt::Debug> fmt::Debug for Observe<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observe")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}
