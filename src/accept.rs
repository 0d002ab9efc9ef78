use http::{HeaderMap, header};
use std::fmt;

/// The client's acceptable content codings, as declared by `Accept-Encoding`.
///
/// Tokens are lowercased and unique; when a token is listed more than once the
/// last quality wins. Parsing is permissive and never fails: malformed quality
/// values fall back to `1.0` and out-of-range ones are clamped into `[0, 1]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AcceptedEncodings {
    entries: Vec<(String, f32)>,
}

impl AcceptedEncodings {
    /// Wildcard token matching every coding not listed explicitly.
    pub const WILDCARD: &'static str = "*";
    /// Token for "no transformation".
    pub const IDENTITY: &'static str = "identity";

    /// Parses a single `Accept-Encoding` value, e.g. `"gzip, br;q=0.8, *;q=0"`.
    pub fn parse(header: &str) -> Self {
        let mut accepted = Self::default();
        accepted.extend_from(header);
        accepted
    }

    /// Collects every `Accept-Encoding` field of a request.
    ///
    /// Field values that are not visible ASCII are ignored.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut accepted = Self::default();
        for value in headers.get_all(header::ACCEPT_ENCODING) {
            if let Ok(value) = value.to_str() {
                accepted.extend_from(value);
            }
        }
        accepted
    }

    /// Returns the quality declared for `token`, without applying the wildcard.
    pub fn get(&self, token: &str) -> Option<f32> {
        self.entries
            .iter()
            .find(|(t, _)| t.eq_ignore_ascii_case(token))
            .map(|(_, q)| *q)
    }

    /// Returns the quality of the `*` entry, if present.
    pub fn wildcard(&self) -> Option<f32> {
        self.get(Self::WILDCARD)
    }

    /// Adds or replaces `token` with the given quality (clamped into `[0, 1]`).
    ///
    /// Tokens that are empty or contain characters outside the HTTP `token`
    /// grammar are ignored, so the mapping always serializes to a header value
    /// that parses back to itself.
    pub fn insert(&mut self, token: &str, quality: f32) {
        let token = token.trim().to_ascii_lowercase();
        if !is_token(&token) {
            return;
        }
        let quality = clamp_quality(quality);
        match self.entries.iter_mut().find(|(t, _)| *t == token) {
            Some(entry) => entry.1 = quality,
            None => self.entries.push((token, quality)),
        }
    }

    /// Iterates over `(token, quality)` pairs in the order they were first declared.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> {
        self.entries.iter().map(|(t, q)| (t.as_str(), *q))
    }

    /// Returns `true` when the client declared nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of distinct tokens.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn extend_from(&mut self, header: &str) {
        for part in header.split(',') {
            let mut params = part.split(';');
            let token = params.next().unwrap_or("").trim();
            if token.is_empty() {
                continue;
            }
            let quality = params.find_map(parse_quality).unwrap_or(1.0);
            self.insert(token, quality);
        }
    }
}

/// Returns `true` if `s` is a non-empty HTTP `token` (RFC 9110 `tchar`s only).
pub(crate) fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric()
                || matches!(
                    b,
                    b'!' | b'#'
                        | b'$'
                        | b'%'
                        | b'&'
                        | b'\''
                        | b'*'
                        | b'+'
                        | b'-'
                        | b'.'
                        | b'^'
                        | b'_'
                        | b'`'
                        | b'|'
                        | b'~'
                )
        })
}

/// Parses a `q=<value>` parameter. Returns `None` for other parameters and
/// `Some(1.0)` for a malformed value.
fn parse_quality(param: &str) -> Option<f32> {
    let (name, value) = param.split_once('=')?;
    if !name.trim().eq_ignore_ascii_case("q") {
        return None;
    }
    match value.trim().parse::<f32>() {
        Ok(q) if !q.is_nan() => Some(q),
        _ => Some(1.0),
    }
}

fn clamp_quality(quality: f32) -> f32 {
    if quality.is_nan() {
        1.0
    } else {
        quality.clamp(0.0, 1.0)
    }
}

impl fmt::Display for AcceptedEncodings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (token, quality)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{token};q={quality}")?;
        }
        Ok(())
    }
}

impl<'a> FromIterator<(&'a str, f32)> for AcceptedEncodings {
    fn from_iter<I: IntoIterator<Item = (&'a str, f32)>>(iter: I) -> Self {
        let mut accepted = Self::default();
        for (token, quality) in iter {
            accepted.insert(token, quality);
        }
        accepted
    }
}
