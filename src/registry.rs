use crate::accept::is_token;
use crate::codec::{CodecProvider, Encoder, EncoderProvider};
use crate::error::ConfigError;
use crate::pool::{Pool, Pooled};
use http::HeaderValue;
use std::fmt;
use std::sync::Arc;

/// A content coding the server is able to produce.
pub struct Registration {
    token: HeaderValue,
    priority: i32,
    provider: Arc<dyn EncoderProvider>,
    encoders: Arc<Pool<Box<dyn Encoder>>>,
}

impl Registration {
    /// The `Content-Encoding` token, lowercase.
    pub fn token(&self) -> &str {
        // validated as visible ASCII on registration
        self.token.to_str().unwrap_or_default()
    }

    /// The token as a header value.
    pub fn header_value(&self) -> &HeaderValue {
        &self.token
    }

    /// Server-side priority; higher is preferred.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Checks an encoder out of this codec's pool.
    pub(crate) fn acquire_encoder(&self) -> Pooled<Box<dyn Encoder>> {
        self.encoders.acquire()
    }

    #[cfg(test)]
    pub(crate) fn encoder_pool(&self) -> &Arc<Pool<Box<dyn Encoder>>> {
        &self.encoders
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("token", &self.token)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Content codings the server can produce, in registration order.
#[derive(Debug, Default)]
pub struct CodecRegistry {
    entries: Vec<Registration>,
}

impl CodecRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `provider` under `token`.
    ///
    /// Registering a token twice replaces its provider and priority while
    /// keeping its original position for tie-breaking.
    pub fn register(
        &mut self,
        token: &str,
        priority: i32,
        provider: Arc<dyn EncoderProvider>,
        pool_capacity: Option<usize>,
    ) -> Result<(), ConfigError> {
        let token = validate_token(token)?;
        self.insert(token, priority, provider, pool_capacity);
        Ok(())
    }

    /// Registers a built-in codec under its own content coding.
    pub fn register_codec(
        &mut self,
        provider: CodecProvider,
        priority: i32,
        pool_capacity: Option<usize>,
    ) {
        let token = HeaderValue::from_static(provider.codec().content_encoding());
        self.insert(token, priority, Arc::new(provider), pool_capacity);
    }

    fn insert(
        &mut self,
        token: HeaderValue,
        priority: i32,
        provider: Arc<dyn EncoderProvider>,
        pool_capacity: Option<usize>,
    ) {
        let factory = Arc::clone(&provider);
        let encoders = Arc::new(
            Pool::new(move || factory.encoder()).with_capacity_limit(pool_capacity),
        );
        let registration = Registration {
            token,
            priority,
            provider,
            encoders,
        };

        match self
            .entries
            .iter_mut()
            .find(|r| r.token == registration.token)
        {
            Some(existing) => *existing = registration,
            None => self.entries.push(registration),
        }
    }

    /// Looks up a registration by token (case-insensitive).
    pub fn get(&self, token: &str) -> Option<&Registration> {
        self.entries
            .iter()
            .find(|r| r.token().eq_ignore_ascii_case(token))
    }

    /// Registration at `index`, as returned by negotiation.
    pub fn entry(&self, index: usize) -> Option<&Registration> {
        self.entries.get(index)
    }

    /// Iterates in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Registration> {
        self.entries.iter()
    }

    /// Number of registered codings.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Provider registered under `token`.
    pub fn provider(&self, token: &str) -> Option<&Arc<dyn EncoderProvider>> {
        self.get(token).map(|r| &r.provider)
    }
}

fn validate_token(token: &str) -> Result<HeaderValue, ConfigError> {
    let invalid = |reason| ConfigError::InvalidToken {
        token: token.to_owned(),
        reason,
    };

    let normalized = token.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        return Err(invalid("token is empty"));
    }
    if normalized == "identity" {
        return Err(invalid("identity means no compression"));
    }
    if normalized == "*" {
        return Err(invalid("the wildcard cannot be produced"));
    }
    if !is_token(&normalized) {
        return Err(invalid("token contains a delimiter or non-visible character"));
    }
    HeaderValue::from_str(&normalized).map_err(|_| invalid("not a valid header value"))
}
