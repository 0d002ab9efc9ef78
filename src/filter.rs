//! Decides whether a response should be compressed at all.

use crate::error::ConfigError;
use http::{HeaderMap, StatusCode, header, response::Parts};
use mime::Mime;

/// Polarity of a [`ContentTypeFilter`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FilterMode {
    /// Only listed content types are compressed.
    #[default]
    Allow,
    /// Listed content types are never compressed.
    Deny,
}

/// A list of media type patterns such as `text/html`, `text/*` or
/// `application/json; charset=utf-8`.
///
/// A pattern matches when its type and subtype match (`*` matches anything)
/// and every parameter it names has the same value on the response.
#[derive(Debug, Clone)]
pub struct ContentTypeFilter {
    patterns: Vec<Mime>,
    mode: FilterMode,
}

impl ContentTypeFilter {
    /// Parses `patterns`; fails on the first one that is not a media type.
    pub fn new<I, S>(patterns: I, mode: FilterMode) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| {
                let pattern = p.as_ref().trim();
                pattern
                    .parse::<Mime>()
                    .map_err(|source| ConfigError::InvalidContentType {
                        pattern: pattern.to_owned(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns, mode })
    }

    /// The filter polarity.
    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    /// Returns `true` if a response with this `Content-Type` may be compressed.
    ///
    /// An unparseable content type never matches a pattern.
    pub fn allows(&self, content_type: &str) -> bool {
        let listed = content_type
            .parse::<Mime>()
            .is_ok_and(|ct| self.patterns.iter().any(|p| matches(p, &ct)));
        match self.mode {
            FilterMode::Allow => listed,
            FilterMode::Deny => !listed,
        }
    }
}

fn matches(pattern: &Mime, ct: &Mime) -> bool {
    let type_ok = pattern.type_() == mime::STAR || pattern.type_() == ct.type_();
    let subtype_ok = pattern.subtype() == mime::STAR || pattern.subtype() == ct.subtype();
    type_ok
        && subtype_ok
        && pattern.params().all(|(name, value)| {
            ct.get_param(name.as_str())
                .is_some_and(|v| v.as_str().eq_ignore_ascii_case(value.as_str()))
        })
}

/// Settings the filter evaluates a response against.
#[derive(Debug, Clone, Default)]
pub(crate) struct Rules {
    pub(crate) min_size: usize,
    pub(crate) content_types: Option<ContentTypeFilter>,
}

/// Why a response is served uncompressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SkipReason {
    /// The handler chose a `Content-Encoding` itself.
    AlreadyEncoded,
    /// A partial (`Content-Range`) response.
    Range,
    /// The response cannot carry a body.
    NoBody,
    /// Fewer than `min_size` bytes.
    TooSmall,
    /// Rejected by the content-type filter.
    ContentType,
    /// The client accepts none of the registered codings.
    NotNegotiated,
    /// The handler's body failed before the decision was made.
    BodyError,
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Compress,
    Skip(SkipReason),
    /// Not enough bytes observed yet.
    Wait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Evaluation {
    pub(crate) verdict: Verdict,
    /// Content type inferred from the body, to be set on the response.
    pub(crate) sniffed: Option<&'static str>,
}

impl From<Verdict> for Evaluation {
    fn from(verdict: Verdict) -> Self {
        Self {
            verdict,
            sniffed: None,
        }
    }
}

/// Evaluates the response against `rules` given what has been buffered so far.
///
/// Called again every time more bytes arrive; `end_of_stream` is set once the
/// handler has produced its whole body.
pub(crate) fn evaluate(
    rules: &Rules,
    head: &Parts,
    is_head_request: bool,
    buffered: &[u8],
    end_of_stream: bool,
) -> Evaluation {
    let headers = &head.headers;

    if headers.contains_key(header::CONTENT_ENCODING) {
        return Verdict::Skip(SkipReason::AlreadyEncoded).into();
    }
    if headers.contains_key(header::CONTENT_RANGE) {
        return Verdict::Skip(SkipReason::Range).into();
    }
    if is_head_request || !status_has_body(head.status) {
        return Verdict::Skip(SkipReason::NoBody).into();
    }

    let declared = declared_length(headers);
    if declared.is_some_and(|len| len < rules.min_size) {
        return Verdict::Skip(SkipReason::TooSmall).into();
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    if content_type.is_some_and(is_grpc) {
        return Verdict::Skip(SkipReason::ContentType).into();
    }
    if let (Some(filter), Some(ct)) = (&rules.content_types, content_type) {
        if !filter.allows(ct) {
            return Verdict::Skip(SkipReason::ContentType).into();
        }
    }

    if buffered.len() < rules.min_size {
        if end_of_stream {
            return Verdict::Skip(SkipReason::TooSmall).into();
        }
        // a declared length is a hint that lets the decision happen early
        if declared.is_none() || buffered.is_empty() {
            return Verdict::Wait.into();
        }
    }

    let mut sniffed = None;
    if let (Some(filter), None) = (&rules.content_types, content_type) {
        if buffered.is_empty() && !end_of_stream {
            return Verdict::Wait.into();
        }
        let ct = sniff(buffered);
        sniffed = Some(ct);
        if !filter.allows(ct) {
            return Evaluation {
                verdict: Verdict::Skip(SkipReason::ContentType),
                sniffed,
            };
        }
    }

    Evaluation {
        verdict: Verdict::Compress,
        sniffed,
    }
}

/// gRPC frames its own messages; only grpc-web is safe to compress.
fn is_grpc(content_type: &str) -> bool {
    let has_prefix = |prefix: &str| {
        content_type
            .get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
    };
    has_prefix("application/grpc") && !has_prefix("application/grpc-web")
}

fn status_has_body(status: StatusCode) -> bool {
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<usize>().ok())
}

const SNIFF_LEN: usize = 512;

const HTML_TAGS: &[&[u8]] = &[
    b"<!DOCTYPE HTML",
    b"<HTML",
    b"<HEAD",
    b"<SCRIPT",
    b"<IFRAME",
    b"<H1",
    b"<DIV",
    b"<FONT",
    b"<TABLE",
    b"<A",
    b"<STYLE",
    b"<TITLE",
    b"<B",
    b"<BODY",
    b"<BR",
    b"<P",
    b"<!--",
];

const SIGNATURES: &[(&[u8], &str)] = &[
    (b"\xFE\xFF", "text/plain; charset=utf-16be"),
    (b"\xFF\xFE", "text/plain; charset=utf-16le"),
    (b"\xEF\xBB\xBF", "text/plain; charset=utf-8"),
    (b"%PDF-", "application/pdf"),
    (b"%!PS-Adobe-", "application/postscript"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"\x89PNG\r\n\x1A\n", "image/png"),
    (b"\xFF\xD8\xFF", "image/jpeg"),
    (b"BM", "image/bmp"),
    (b"wOFF", "font/woff"),
    (b"wOF2", "font/woff2"),
    (b"\x1F\x8B\x08", "application/x-gzip"),
    (b"PK\x03\x04", "application/zip"),
    (b"Rar!\x1A\x07\x00", "application/x-rar-compressed"),
    (b"\x00asm", "application/wasm"),
];

/// Infers a content type from the first bytes of a body, following the
/// WHATWG MIME sniffing rules for the common cases.
pub(crate) fn sniff(data: &[u8]) -> &'static str {
    let data = &data[..data.len().min(SNIFF_LEN)];

    let text = data.trim_ascii_start();
    for tag in HTML_TAGS {
        if text.len() > tag.len()
            && text[..tag.len()].eq_ignore_ascii_case(tag)
            && matches!(text[tag.len()], b' ' | b'>')
        {
            return "text/html; charset=utf-8";
        }
    }
    if text.starts_with(b"<?xml") {
        return "text/xml; charset=utf-8";
    }

    for (signature, content_type) in SIGNATURES {
        if data.starts_with(signature) {
            return content_type;
        }
    }
    if data.len() >= 14 && data.starts_with(b"RIFF") && &data[8..14] == b"WEBPVP" {
        return "image/webp";
    }

    let binary = data
        .iter()
        .any(|&b| matches!(b, 0x00..=0x08 | 0x0B | 0x0E..=0x1A | 0x1C..=0x1F));
    if binary {
        "application/octet-stream"
    } else {
        "text/plain; charset=utf-8"
    }
}
