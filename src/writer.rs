//! The per-response decision state machine.
//!
//! A [`ResponseWriter`] starts out [`Phase::Buffering`]: body bytes are held
//! in a pooled buffer while the eligibility filter is re-evaluated. The first
//! conclusive evaluation commits the response head and moves the writer to
//! either [`Phase::PassThrough`] or [`Phase::Compressing`], where it stays
//! until [`Phase::Closed`]. It never returns to buffering.
//!
//! The writer does no I/O of its own; the response future and body feed it.

use crate::codec::Encoder;
use crate::config::Config;
use crate::filter::{self, SkipReason, Verdict};
use crate::pool::Pooled;
use bytes::{Bytes, BytesMut};
use http::response::Parts;
use http::{HeaderMap, HeaderValue, header};
use std::io;
use std::sync::Arc;
use tracing::{debug, warn};

/// Lifecycle of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Holding bytes until the compress-or-not decision can be made.
    Buffering,
    /// Forwarding the body unmodified.
    PassThrough,
    /// Forwarding the body through an encoder.
    Compressing,
    /// Finished, successfully or not.
    Closed,
}

pub(crate) struct ResponseWriter {
    phase: Phase,
    config: Arc<Config>,
    chosen: Option<usize>,
    is_head_request: bool,
    buffer: Option<Pooled<BytesMut>>,
    encoder: Option<Pooled<Box<dyn Encoder>>>,
    pending: Option<Bytes>,
    always_flush: bool,
    committed: bool,
    error: Option<(io::ErrorKind, String)>,
}

impl ResponseWriter {
    /// Creates a writer for one response; `chosen` is the negotiated registry index.
    pub(crate) fn new(config: Arc<Config>, chosen: Option<usize>, is_head_request: bool) -> Self {
        Self {
            phase: Phase::Buffering,
            config,
            chosen,
            is_head_request,
            buffer: None,
            encoder: None,
            pending: None,
            always_flush: false,
            committed: false,
            error: None,
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    /// Whether the response head has been finalized.
    pub(crate) fn is_committed(&self) -> bool {
        self.committed
    }

    pub(crate) fn buffered_len(&self) -> usize {
        self.buffer.as_ref().map_or(0, |b| b.len())
    }

    /// How many more bytes can be held before the decision is forced.
    pub(crate) fn room(&self) -> usize {
        self.config.buffer_limit.saturating_sub(self.buffered_len())
    }

    /// Holds `data` until the decision is made.
    pub(crate) fn buffer(&mut self, data: &[u8]) {
        debug_assert_eq!(self.phase, Phase::Buffering, "buffering after the decision");
        if self.phase != Phase::Buffering || data.is_empty() {
            return;
        }
        let config = &self.config;
        self.buffer
            .get_or_insert_with(|| config.buffers.acquire())
            .extend_from_slice(data);
    }

    /// Re-evaluates the filter and, when it is conclusive, commits `head`.
    ///
    /// Returns the phase after the evaluation. An error means the buffered
    /// bytes could not be encoded; the head is committed and the writer is closed.
    pub(crate) fn decide(&mut self, head: &mut Parts, end_of_stream: bool) -> io::Result<Phase> {
        if self.phase != Phase::Buffering {
            return Ok(self.phase);
        }

        let Some(index) = self.chosen else {
            self.start_plain(SkipReason::NotNegotiated);
            return Ok(self.phase);
        };

        let buffered = self.buffer.as_deref().map_or(&[][..], |b| &b[..]);
        let eval = filter::evaluate(
            &self.config.rules,
            head,
            self.is_head_request,
            buffered,
            end_of_stream,
        );
        if let Some(content_type) = eval.sniffed {
            head.headers
                .entry(header::CONTENT_TYPE)
                .or_insert(HeaderValue::from_static(content_type));
        }

        match eval.verdict {
            Verdict::Wait if !end_of_stream => {}
            Verdict::Wait => self.start_plain(SkipReason::TooSmall),
            Verdict::Skip(reason) => self.start_plain(reason),
            Verdict::Compress => self.start_compress(head, index)?,
        }
        Ok(self.phase)
    }

    /// Commits to pass-through regardless of the filter, e.g. after the
    /// handler's body failed while buffering.
    pub(crate) fn pass_through(&mut self, reason: SkipReason) {
        if self.phase == Phase::Buffering {
            self.start_plain(reason);
        }
    }

    fn start_plain(&mut self, reason: SkipReason) {
        debug!(?reason, buffered = self.buffered_len(), "serving response uncompressed");
        if let Some(buffer) = self.buffer.take() {
            // copy out so the allocation goes back to the pool
            self.pending = Some(Bytes::copy_from_slice(&buffer));
        }
        self.phase = Phase::PassThrough;
        self.committed = true;
    }

    fn start_compress(&mut self, head: &mut Parts, index: usize) -> io::Result<()> {
        let config = Arc::clone(&self.config);
        let Some(registration) = config.registry.entry(index) else {
            self.start_plain(SkipReason::NotNegotiated);
            return Ok(());
        };
        debug!(
            encoding = registration.token(),
            buffered = self.buffered_len(),
            "compressing response"
        );

        let headers = &mut head.headers;
        headers.remove(header::CONTENT_LENGTH);
        headers.remove(header::ACCEPT_RANGES);
        headers.insert(header::CONTENT_ENCODING, registration.header_value().clone());
        add_vary_accept_encoding(headers);
        self.always_flush = is_streaming(headers);
        self.phase = Phase::Compressing;
        self.committed = true;

        let mut encoder = registration.acquire_encoder();
        let buffer = self.buffer.take();
        let mut output = BytesMut::new();
        let result = buffer
            .as_deref()
            .map_or(Ok(()), |data| encoder.encode(data, &mut output))
            .and_then(|()| {
                if self.always_flush {
                    encoder.flush(&mut output)
                } else {
                    Ok(())
                }
            });
        self.encoder = Some(encoder);
        match result {
            Ok(()) => {
                self.pending = Some(output.freeze());
                Ok(())
            }
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }

    /// Bytes produced by the decision: the replayed buffer or its compressed form.
    pub(crate) fn take_pending(&mut self) -> Option<Bytes> {
        self.pending.take()
    }

    /// Forwards one chunk along the committed path.
    pub(crate) fn write(&mut self, chunk: Bytes) -> io::Result<Bytes> {
        match self.phase {
            Phase::PassThrough => Ok(chunk),
            Phase::Compressing => {
                let mut output = BytesMut::new();
                let result = match self.encoder.as_mut() {
                    Some(encoder) => encoder.encode(&chunk, &mut output).and_then(|()| {
                        if self.always_flush {
                            encoder.flush(&mut output)
                        } else {
                            Ok(())
                        }
                    }),
                    None => Err(io::Error::other("compressing without an encoder")),
                };
                match result {
                    Ok(()) => Ok(output.freeze()),
                    Err(err) => {
                        self.fail(&err);
                        Err(err)
                    }
                }
            }
            Phase::Buffering => Err(io::Error::other("write before the response was committed")),
            Phase::Closed => Err(self.closed_error()),
        }
    }

    /// Finishes the response: writes the encoder trailer and releases pooled
    /// objects. Reports the first error recorded by an earlier write.
    pub(crate) fn close(&mut self) -> io::Result<Bytes> {
        match self.phase {
            Phase::Compressing => {
                let mut output = BytesMut::new();
                let result = match self.encoder.as_mut() {
                    Some(encoder) => encoder.finish(&mut output),
                    None => Ok(()),
                };
                if let Err(err) = result {
                    self.fail(&err);
                    return Err(err);
                }
                self.release();
                Ok(output.freeze())
            }
            Phase::Buffering | Phase::PassThrough => {
                self.release();
                Ok(Bytes::new())
            }
            Phase::Closed => match &self.error {
                Some(_) => Err(self.closed_error()),
                None => Ok(Bytes::new()),
            },
        }
    }

    /// Records `err` (the first one wins), releases pooled objects and closes.
    pub(crate) fn fail(&mut self, err: &io::Error) {
        if self.error.is_none() {
            warn!(error = %err, phase = ?self.phase, "response compression failed");
            self.error = Some((err.kind(), err.to_string()));
        }
        self.release();
    }

    fn release(&mut self) {
        self.buffer = None;
        self.encoder = None;
        self.pending = None;
        self.phase = Phase::Closed;
    }

    fn closed_error(&self) -> io::Error {
        match &self.error {
            Some((kind, message)) => io::Error::new(*kind, message.clone()),
            None => io::Error::other("response already closed"),
        }
    }
}

/// Adds Accept-Encoding to the Vary header if not already present.
pub(crate) fn add_vary_accept_encoding(headers: &mut HeaderMap) {
    let covered = headers
        .get_all(header::VARY)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .any(|v| v == "*" || v.eq_ignore_ascii_case("accept-encoding"));
    if !covered {
        headers.append(header::VARY, HeaderValue::from_static("accept-encoding"));
    }
}

/// Streaming responses are flushed after every chunk.
fn is_streaming(headers: &HeaderMap) -> bool {
    let no_buffering = headers
        .get("x-accel-buffering")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("no"));
    no_buffering
        || headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| {
                ct.starts_with("text/event-stream") || ct.starts_with("application/grpc-web")
            })
}
