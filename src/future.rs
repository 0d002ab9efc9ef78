use crate::body::CompressionBody;
use crate::config::Config;
use crate::filter::SkipReason;
use crate::writer::{Phase, ResponseWriter, add_vary_accept_encoding};
use bytes::{Buf, Bytes};
use http::response::Parts;
use http::{HeaderMap, Response};
use http_body::Body;
use pin_project_lite::pin_project;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

/// What the request negotiated, carried until the response arrives.
#[derive(Debug)]
pub(crate) struct Negotiation {
    pub(crate) config: Arc<Config>,
    pub(crate) chosen: usize,
    pub(crate) is_head_request: bool,
}

pin_project! {
    /// Future for compression service responses.
    ///
    /// Resolves once the compress-or-not decision has been made, which may
    /// require reading the first bytes of the response body.
    pub struct ResponseFuture<F, B> {
        #[pin]
        inner: F,
        negotiation: Option<Negotiation>,
        buffering: Option<Buffering<B>>,
    }
}

impl<F, B> ResponseFuture<F, B> {
    pub(crate) fn new(inner: F, negotiation: Option<Negotiation>) -> Self {
        Self {
            inner,
            negotiation,
            buffering: None,
        }
    }
}

impl<F, B, E> Future for ResponseFuture<F, B>
where
    F: Future<Output = Result<Response<B>, E>>,
    B: Body + Unpin,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Output = Result<Response<CompressionBody<B>>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();

        loop {
            if let Some(buffering) = this.buffering.as_mut() {
                ready!(buffering.poll_decision(cx));
                if let Some(buffering) = this.buffering.take() {
                    return Poll::Ready(Ok(buffering.into_response()));
                }
            }

            let response = ready!(this.inner.as_mut().poll(cx))?;
            let (mut parts, body) = response.into_parts();
            add_vary_accept_encoding(&mut parts.headers);

            match this.negotiation.take() {
                None => {
                    return Poll::Ready(Ok(Response::from_parts(
                        parts,
                        CompressionBody::passthrough(body),
                    )));
                }
                Some(negotiation) => {
                    let writer = ResponseWriter::new(
                        negotiation.config,
                        Some(negotiation.chosen),
                        negotiation.is_head_request,
                    );
                    *this.buffering = Some(Buffering::new(parts, body, writer));
                }
            }
        }
    }
}

/// A response whose head is held back until the writer decides.
///
/// At most the writer's [`room`](ResponseWriter::room) is copied out of a
/// frame; the rest of that frame is `held` and handed to the body untouched.
struct Buffering<B> {
    parts: Parts,
    body: B,
    writer: ResponseWriter,
    held: Option<Bytes>,
    trailers: Option<HeaderMap>,
    inner_done: bool,
    error: Option<io::Error>,
}

impl<B> Buffering<B>
where
    B: Body + Unpin,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    fn new(parts: Parts, body: B, writer: ResponseWriter) -> Self {
        let inner_done = body.is_end_stream();
        Self {
            parts,
            body,
            writer,
            held: None,
            trailers: None,
            inner_done,
            error: None,
        }
    }

    /// Reads body frames into the writer until it leaves [`Phase::Buffering`].
    fn poll_decision(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        loop {
            let end_of_stream = self.inner_done && self.held.is_none();
            match self.writer.decide(&mut self.parts, end_of_stream) {
                Ok(Phase::Buffering) if end_of_stream => {
                    self.writer.pass_through(SkipReason::TooSmall);
                    return Poll::Ready(());
                }
                Ok(Phase::Buffering) => {}
                Ok(_) => return Poll::Ready(()),
                Err(err) => {
                    self.error = Some(err);
                    return Poll::Ready(());
                }
            }

            if let Some(mut chunk) = self.held.take() {
                let take = self.writer.room().max(1).min(chunk.len());
                self.writer.buffer(&chunk.split_to(take));
                if !chunk.is_empty() {
                    self.held = Some(chunk);
                }
                continue;
            }

            match ready!(Pin::new(&mut self.body).poll_frame(cx)) {
                None => self.inner_done = true,
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(mut data) => {
                        let chunk = data.copy_to_bytes(data.remaining());
                        if !chunk.is_empty() {
                            self.held = Some(chunk);
                        }
                        self.inner_done = self.body.is_end_stream();
                    }
                    Err(frame) => {
                        if let Ok(trailers) = frame.into_trailers() {
                            self.trailers = Some(trailers);
                            self.inner_done = true;
                        }
                    }
                },
                Some(Err(err)) => {
                    // send what was buffered, then the error
                    self.error = Some(io::Error::other(err.into()));
                    self.writer.pass_through(SkipReason::BodyError);
                    return Poll::Ready(());
                }
            }
        }
    }

    fn into_response(self) -> Response<CompressionBody<B>> {
        let body = CompressionBody::from_writer(
            self.body,
            self.writer,
            self.held,
            self.trailers,
            self.inner_done,
            self.error,
        );
        Response::from_parts(self.parts, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::CompressionLayerBuilder;
    use http::header;
    use http_body_util::{BodyExt, Full};
    use std::convert::Infallible;

    const TEXT: &str = "a response body that is comfortably longer than the minimum size";

    fn make_response(body: &'static str) -> Response<Full<Bytes>> {
        Response::new(Full::new(Bytes::from_static(body.as_bytes())))
    }

    fn make_response_with_headers<I>(body: &'static str, headers: I) -> Response<Full<Bytes>>
    where
        I: IntoIterator<Item = (&'static str, &'static str)>,
    {
        let mut response = make_response(body);
        for (name, value) in headers {
            response
                .headers_mut()
                .append(name, header::HeaderValue::from_static(value));
        }
        response
    }

    async fn wrap_response<B>(
        response: Response<B>,
        encoding: Option<&str>,
        min_size: usize,
    ) -> Response<CompressionBody<B>>
    where
        B: Body + Unpin,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let layer = CompressionLayerBuilder::with_defaults()
            .min_size(min_size)
            .build()
            .unwrap();
        let config = Arc::clone(layer.config());
        let negotiation = encoding.map(|token| Negotiation {
            chosen: config
                .registry
                .iter()
                .position(|r| r.token() == token)
                .unwrap(),
            config: Arc::clone(&config),
            is_head_request: false,
        });
        let ready = std::future::ready(Ok::<_, Infallible>(response));
        ResponseFuture::new(ready, negotiation).await.unwrap()
    }

    #[tokio::test]
    #[cfg(feature = "gzip")]
    async fn test_compress_when_negotiated() {
        let wrapped = wrap_response(make_response(TEXT), Some("gzip"), 0).await;
        assert_eq!(wrapped.headers()[header::CONTENT_ENCODING], "gzip");
        assert_eq!(wrapped.headers()[header::VARY], "accept-encoding");
    }

    #[tokio::test]
    async fn test_no_compress_without_negotiation() {
        let wrapped = wrap_response(make_response(TEXT), None, 0).await;
        assert!(wrapped.headers().get(header::CONTENT_ENCODING).is_none());
        assert_eq!(wrapped.headers()[header::VARY], "accept-encoding");
        let body = wrapped.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, TEXT.as_bytes());
    }

    #[tokio::test]
    #[cfg(feature = "gzip")]
    async fn test_no_compress_when_content_encoding_present() {
        let response = make_response_with_headers(TEXT, [("content-encoding", "identity")]);
        let wrapped = wrap_response(response, Some("gzip"), 0).await;
        assert_eq!(wrapped.headers()[header::CONTENT_ENCODING], "identity");
    }

    #[tokio::test]
    #[cfg(feature = "gzip")]
    async fn test_no_compress_below_min_size() {
        let response = make_response_with_headers("small", [("content-length", "5")]);
        let wrapped = wrap_response(response, Some("gzip"), 100).await;
        assert!(wrapped.headers().get(header::CONTENT_ENCODING).is_none());
        assert_eq!(wrapped.headers()[header::CONTENT_LENGTH], "5");
    }

    #[tokio::test]
    #[cfg(feature = "gzip")]
    async fn test_unknown_size_below_min_size_is_measured() {
        let wrapped = wrap_response(make_response("small"), Some("gzip"), 100).await;
        assert!(wrapped.headers().get(header::CONTENT_ENCODING).is_none());
        let body = wrapped.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "small");
    }

    #[tokio::test]
    #[cfg(feature = "gzip")]
    async fn test_compress_above_min_size() {
        let response = make_response_with_headers(TEXT, [("content-length", "64")]);
        let wrapped = wrap_response(response, Some("gzip"), 32).await;
        assert_eq!(wrapped.headers()[header::CONTENT_ENCODING], "gzip");
        assert!(wrapped.headers().get(header::CONTENT_LENGTH).is_none());
    }

    #[tokio::test]
    #[cfg(feature = "gzip")]
    async fn test_no_compress_range_response() {
        let response = make_response_with_headers(TEXT, [("content-range", "bytes 0-63/200")]);
        let wrapped = wrap_response(response, Some("gzip"), 0).await;
        assert!(wrapped.headers().get(header::CONTENT_ENCODING).is_none());
    }

    #[tokio::test]
    #[cfg(feature = "brotli")]
    async fn test_brotli_content_encoding() {
        let wrapped = wrap_response(make_response(TEXT), Some("br"), 0).await;
        assert_eq!(wrapped.headers()[header::CONTENT_ENCODING], "br");
    }

    #[tokio::test]
    #[cfg(feature = "zstd")]
    async fn test_zstd_content_encoding() {
        let wrapped = wrap_response(make_response(TEXT), Some("zstd"), 0).await;
        assert_eq!(wrapped.headers()[header::CONTENT_ENCODING], "zstd");
    }

    #[tokio::test]
    #[cfg(feature = "gzip")]
    async fn test_vary_header_appended() {
        let response = make_response_with_headers(TEXT, [("vary", "origin")]);
        let wrapped = wrap_response(response, Some("gzip"), 0).await;
        let vary_values: Vec<_> = wrapped
            .headers()
            .get_all(header::VARY)
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(vary_values, vec!["origin", "accept-encoding"]);
    }

    #[tokio::test]
    #[cfg(feature = "gzip")]
    async fn test_vary_header_star_not_modified() {
        let response = make_response_with_headers(TEXT, [("vary", "*")]);
        let wrapped = wrap_response(response, Some("gzip"), 0).await;
        let vary_values: Vec<_> = wrapped.headers().get_all(header::VARY).iter().collect();
        assert_eq!(vary_values, ["*"]);
    }

    #[tokio::test]
    #[cfg(feature = "gzip")]
    async fn test_accept_ranges_removed() {
        let response = make_response_with_headers(TEXT, [("accept-ranges", "bytes")]);
        let wrapped = wrap_response(response, Some("gzip"), 0).await;
        assert!(wrapped.headers().get(header::ACCEPT_RANGES).is_none());
    }

    #[tokio::test]
    async fn test_accept_ranges_kept_when_not_compressing() {
        let response = make_response_with_headers(TEXT, [("accept-ranges", "bytes")]);
        let wrapped = wrap_response(response, None, 0).await;
        assert_eq!(wrapped.headers()[header::ACCEPT_RANGES], "bytes");
    }

    #[tokio::test]
    #[cfg(feature = "gzip")]
    async fn test_sniffed_content_type_is_set() {
        let layer = CompressionLayerBuilder::new()
            .codec(crate::codec::Codec::Gzip)
            .content_types(["text/html"], crate::filter::FilterMode::Allow)
            .build()
            .unwrap();
        let negotiation = Negotiation {
            config: Arc::clone(layer.config()),
            chosen: 0,
            is_head_request: false,
        };
        let response = make_response("<!DOCTYPE html><html></html>");
        let ready = std::future::ready(Ok::<_, Infallible>(response));
        let wrapped = ResponseFuture::new(ready, Some(negotiation)).await.unwrap();

        assert_eq!(wrapped.headers()[header::CONTENT_TYPE], "text/html; charset=utf-8");
        assert_eq!(wrapped.headers()[header::CONTENT_ENCODING], "gzip");
    }

    #[tokio::test]
    #[cfg(feature = "gzip")]
    async fn test_no_compress_application_grpc() {
        let response = make_response_with_headers(TEXT, [("content-type", "application/grpc")]);
        let wrapped = wrap_response(response, Some("gzip"), 0).await;
        assert!(wrapped.headers().get(header::CONTENT_ENCODING).is_none());
        assert!(!wrapped.body().is_compressed());

        let response =
            make_response_with_headers(TEXT, [("content-type", "application/grpc-web")]);
        let wrapped = wrap_response(response, Some("gzip"), 0).await;
        assert_eq!(wrapped.headers()[header::CONTENT_ENCODING], "gzip");
    }

    #[tokio::test]
    #[cfg(feature = "gzip")]
    async fn test_large_frame_is_not_copied_into_the_buffer() {
        use std::io::Read;

        let layer = CompressionLayerBuilder::new()
            .codec(crate::codec::Codec::Gzip)
            .min_size(20)
            .build()
            .unwrap();
        let config = Arc::clone(layer.config());
        let negotiation = Negotiation {
            config: Arc::clone(&config),
            chosen: 0,
            is_head_request: false,
        };
        let payload = Bytes::from(vec![b'a'; 8 * 1024 * 1024]);
        let response = Response::new(Full::new(payload.clone()));
        let ready = std::future::ready(Ok::<_, Infallible>(response));
        let wrapped = ResponseFuture::new(ready, Some(negotiation)).await.unwrap();
        assert_eq!(wrapped.headers()[header::CONTENT_ENCODING], "gzip");

        let body = wrapped.into_body().collect().await.unwrap().to_bytes();
        let mut decoded = Vec::new();
        flate2::read::GzDecoder::new(&body[..])
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded.len(), payload.len());
        assert!(decoded.iter().all(|&b| b == b'a'));

        assert_eq!(config.buffers.idle(), 1);
        assert!(config.buffers.acquire().capacity() < 1024);
    }

    #[tokio::test]
    #[cfg(feature = "gzip")]
    async fn test_remainder_follows_buffered_prefix_when_skipped() {
        let layer = CompressionLayerBuilder::new()
            .codec(crate::codec::Codec::Gzip)
            .min_size(8)
            .content_types(["text/*"], crate::filter::FilterMode::Allow)
            .build()
            .unwrap();
        let negotiation = Negotiation {
            config: Arc::clone(layer.config()),
            chosen: 0,
            is_head_request: false,
        };
        let png: &[u8] = b"\x89PNG\r\n\x1a\n and a long tail of image data after the signature";
        let response = Response::new(Full::new(Bytes::from_static(png)));
        let ready = std::future::ready(Ok::<_, Infallible>(response));
        let wrapped = ResponseFuture::new(ready, Some(negotiation)).await.unwrap();
        assert!(wrapped.headers().get(header::CONTENT_ENCODING).is_none());
        assert_eq!(wrapped.headers()[header::CONTENT_TYPE], "image/png");

        let body = wrapped.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, png);
    }

    /// Yields `partial`, then fails.
    struct FailsMidway {
        sent: bool,
    }

    impl Body for FailsMidway {
        type Data = Bytes;
        type Error = io::Error;

        fn poll_frame(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<http_body::Frame<Bytes>, io::Error>>> {
            if std::mem::replace(&mut self.sent, true) {
                let err = io::Error::new(io::ErrorKind::ConnectionReset, "handler failed");
                return Poll::Ready(Some(Err(err)));
            }
            Poll::Ready(Some(Ok(http_body::Frame::data(Bytes::from_static(b"partial")))))
        }
    }

    #[tokio::test]
    #[cfg(feature = "gzip")]
    async fn test_body_error_while_buffering_passes_through() {
        let response = Response::new(FailsMidway { sent: false });
        let wrapped = wrap_response(response, Some("gzip"), 64).await;
        assert!(wrapped.headers().get(header::CONTENT_ENCODING).is_none());

        let mut body = wrapped.into_body();
        let first = body.frame().await.unwrap().unwrap();
        assert_eq!(first.into_data().unwrap(), "partial");
        let err = body.frame().await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "handler failed");
        assert!(body.frame().await.is_none());
    }

    #[tokio::test]
    async fn test_inner_error_is_forwarded() {
        let failed = std::future::ready(Err::<Response<Full<Bytes>>, _>("boom"));
        let result = ResponseFuture::new(failed, None).await;
        assert_eq!(result.unwrap_err(), "boom");
    }
}
