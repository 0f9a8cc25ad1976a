//! HTTP transport backed by `reqwest`.
//!
//! Adapts a [`reqwest::Client`] to the tower `Service` shape expected by
//! [`ObserveLayer`](crate::ObserveLayer), so the observed stack can talk
//! to real smart-HTTP remotes over TLS.

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{Request, Response};
use http_body::Body;
use http_body_util::BodyExt;
use std::task::{Context, Poll};
use tower::Service;

/// Boxed error accepted from request bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Tower service that sends requests with a [`reqwest::Client`].
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Wraps an existing client.
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl<B> Service<Request<B>> for ReqwestTransport
where
    B: Body + Send + Sync + 'static,
    Bytes: From<B::Data>,
    B::Error: Into<BoxError>,
{
    type Response = Response<reqwest::Body>;
    type Error = reqwest::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        let client = self.client.clone();
        let request = request.map(|body| reqwest::Body::wrap_stream(body.into_data_stream()));

        Box::pin(async move {
            let request = reqwest::Request::try_from(request)?;
            let response = client.execute(request).await?;
            Ok(Response::from(response))
        })
    }
}
