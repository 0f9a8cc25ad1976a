//! One-line summaries of completed requests, keyed by upstream request id.
//!
//! Hosting providers stamp each response with an id that their support
//! staff can look up. [`RequestIdLayer`] logs that id next to the status,
//! method and URL so a trace can be matched against the server side.

use futures_util::future::BoxFuture;
use http::{HeaderName, Request, Response};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

use crate::config::{ObserverConfig, DEFAULT_REQUEST_ID_HEADER};
use crate::Result;

/// Tracing target for request summaries.
pub const SUMMARY_TARGET: &str = "pktscope::http";

/// Layer that logs `[http] {id} <status> <method> <url>` for each response.
#[derive(Debug, Clone)]
pub struct RequestIdLayer {
    header: Arc<HeaderName>,
}

impl RequestIdLayer {
    /// Reports the value of `header` from each response.
    pub fn new(header: HeaderName) -> Self {
        Self {
            header: Arc::new(header),
        }
    }

    /// Builds the layer from configuration. Returns `None` when disabled.
    pub fn from_config(config: &ObserverConfig) -> Result<Option<Self>> {
        Ok(config.request_id_header_name()?.map(Self::new))
    }

    /// Header whose value is reported.
    pub fn header(&self) -> &HeaderName {
        &self.header
    }
}

impl Default for RequestIdLayer {
    fn default() -> Self {
        Self::new(HeaderName::from_static(DEFAULT_REQUEST_ID_HEADER))
    }
}

impl<S> Layer<S> for RequestIdLayer {
    type Service = RequestIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestIdService {
            inner,
            header: Arc::clone(&self.header),
        }
    }
}

/// Service produced by [`RequestIdLayer`].
#[derive(Debug, Clone)]
pub struct RequestIdService<S> {
    inner: S,
    header: Arc<HeaderName>,
}

/// Formats the summary line for a completed request.
pub fn summarize<B>(
    header: &HeaderName,
    method: &http::Method,
    uri: &http::Uri,
    response: &Response<B>,
) -> String {
    let id = response
        .headers()
        .get(header)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .unwrap_or_default();
    format!(
        "[http] {{{}}} {} {} {}",
        id,
        response.status().as_u16(),
        method,
        uri
    )
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for RequestIdService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let method = request.method().clone();
        let uri = request.uri().clone();
        let header = Arc::clone(&self.header);
        let future = self.inner.call(request);

        Box::pin(async move {
            let response = future.await?;
            let line = summarize(&header, &method, &uri, &response);
            tracing::info!(target: SUMMARY_TARGET, status = response.status().as_u16(), "{line}");
            Ok(response)
        })
    }
}
