use crate::accept::AcceptedEncodings;
use crate::body::CompressionBody;
use crate::config::Config;
use crate::future::{Negotiation, ResponseFuture};
use crate::negotiate::negotiate;
use http::{Method, Request};
use http_body::Body;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;

/// A Tower service that compresses HTTP response bodies.
#[derive(Debug, Clone)]
pub struct CompressionService<S> {
    inner: S,
    config: Arc<Config>,
}

impl<S> CompressionService<S> {
    pub(crate) fn new(inner: S, config: Arc<Config>) -> Self {
        Self { inner, config }
    }

    /// Returns a reference to the inner service.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Returns a mutable reference to the inner service.
    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Consumes this service, returning the inner service.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for CompressionService<S>
where
    S: Service<Request<ReqBody>, Response = http::Response<ResBody>>,
    ResBody: Body + Unpin,
    ResBody::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Response = http::Response<CompressionBody<ResBody>>;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future, ResBody>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let accepted = AcceptedEncodings::from_headers(req.headers());
        let common = negotiate(&accepted, &self.config.registry);
        let chosen = common.select(self.config.preference);
        let is_head_request = req.method() == Method::HEAD;

        tracing::debug!(
            accept_encoding = %accepted,
            chosen = chosen
                .and_then(|i| self.config.registry.entry(i))
                .map(|r| r.token()),
            "negotiated response encoding"
        );

        let negotiation = chosen.map(|chosen| Negotiation {
            config: Arc::clone(&self.config),
            chosen,
            is_head_request,
        });
        ResponseFuture::new(self.inner.call(req), negotiation)
    }
}
