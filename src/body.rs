use crate::writer::{Phase, ResponseWriter};
use bytes::{Buf, Bytes};
use http::HeaderMap;
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

pin_project! {
    /// A response body that may be compressed.
    ///
    /// Replays whatever was buffered while the compression decision was
    /// pending, then forwards the rest of the inner body either unchanged or
    /// through the negotiated encoder. Trailers are sent after the encoder
    /// has been finished.
    pub struct CompressionBody<B> {
        #[pin]
        inner: B,
        writer: Option<ResponseWriter>,
        queued: Option<Bytes>,
        held: Option<Bytes>,
        trailers: Option<HeaderMap>,
        error: Option<io::Error>,
        inner_done: bool,
        done: bool,
    }
}

impl<B> CompressionBody<B> {
    /// Creates a passthrough body without compression.
    pub fn passthrough(inner: B) -> Self {
        Self {
            inner,
            writer: None,
            queued: None,
            held: None,
            trailers: None,
            error: None,
            inner_done: false,
            done: false,
        }
    }

    /// Continues a response whose head has been committed by `writer`.
    ///
    /// `held` is the part of the last frame read while buffering that did not
    /// fit in the buffer; it goes through the writer before the inner body is
    /// polled again.
    pub(crate) fn from_writer(
        inner: B,
        mut writer: ResponseWriter,
        held: Option<Bytes>,
        trailers: Option<HeaderMap>,
        inner_done: bool,
        error: Option<io::Error>,
    ) -> Self {
        Self {
            inner,
            queued: writer.take_pending(),
            writer: Some(writer),
            held,
            trailers,
            error,
            inner_done,
            done: false,
        }
    }

    /// Returns `true` if the body is being compressed.
    pub fn is_compressed(&self) -> bool {
        self.writer
            .as_ref()
            .is_some_and(|w| w.phase() == Phase::Compressing)
    }
}

impl<B> Body for CompressionBody<B>
where
    B: Body,
    B::Data: Buf,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut this = self.project();

        loop {
            if *this.done {
                return Poll::Ready(None);
            }

            if let Some(data) = this.queued.take() {
                if !data.is_empty() {
                    return Poll::Ready(Some(Ok(Frame::data(data))));
                }
            }

            if let Some(err) = this.error.take() {
                if let Some(writer) = this.writer.as_mut() {
                    writer.fail(&err);
                }
                *this.done = true;
                return Poll::Ready(Some(Err(err)));
            }

            if let Some(chunk) = this.held.take() {
                let Some(writer) = this.writer.as_mut() else {
                    return Poll::Ready(Some(Ok(Frame::data(chunk))));
                };
                match writer.write(chunk) {
                    Ok(output) => *this.queued = Some(output),
                    Err(err) => *this.error = Some(err),
                }
                continue;
            }

            if *this.inner_done {
                // finish the encoder before any trailers go out
                if let Some(mut writer) = this.writer.take() {
                    match writer.close() {
                        Ok(tail) => {
                            *this.queued = Some(tail);
                            continue;
                        }
                        Err(err) => {
                            *this.done = true;
                            return Poll::Ready(Some(Err(err)));
                        }
                    }
                }
                *this.done = true;
                return Poll::Ready(this.trailers.take().map(|t| Ok(Frame::trailers(t))));
            }

            match ready!(this.inner.as_mut().poll_frame(cx)) {
                None => *this.inner_done = true,
                Some(Err(e)) => *this.error = Some(io::Error::other(e.into())),
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(mut data) => {
                        let bytes = data.copy_to_bytes(data.remaining());
                        let Some(writer) = this.writer.as_mut() else {
                            return Poll::Ready(Some(Ok(Frame::data(bytes))));
                        };
                        match writer.write(bytes) {
                            Ok(output) => *this.queued = Some(output),
                            Err(err) => *this.error = Some(err),
                        }
                    }
                    Err(frame) => {
                        if let Ok(trailers) = frame.into_trailers() {
                            *this.trailers = Some(trailers);
                            *this.inner_done = true;
                        }
                    }
                },
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        if self.done {
            return true;
        }
        self.writer.is_none()
            && self.queued.is_none()
            && self.held.is_none()
            && self.error.is_none()
            && self.trailers.is_none()
            && (self.inner_done || self.inner.is_end_stream())
    }

    fn size_hint(&self) -> SizeHint {
        if self.done {
            return SizeHint::with_exact(0);
        }
        if self.is_compressed() {
            // Compressed size is unknown
            return SizeHint::default();
        }
        let queued = [&self.queued, &self.held]
            .into_iter()
            .flatten()
            .map(|b| b.len() as u64)
            .sum::<u64>();
        if self.inner_done {
            return SizeHint::with_exact(queued);
        }
        let inner = self.inner.size_hint();
        let mut hint = SizeHint::new();
        hint.set_lower(inner.lower() + queued);
        if let Some(upper) = inner.upper() {
            hint.set_upper(upper + queued);
        }
        hint
    }
}

impl<B> fmt::Debug for CompressionBody<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompressionBody")
            .field("phase", &self.writer.as_ref().map(|w| w.phase()))
            .field(
                "committed",
                &self.writer.as_ref().is_none_or(|w| w.is_committed()),
            )
            .field("inner_done", &self.inner_done)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}
