use crate::codec::{Codec, EncoderProvider};
use crate::config::{Config, DEFAULT_MIN_SIZE, MAX_MIN_SIZE};
use crate::error::ConfigError;
use crate::filter::{ContentTypeFilter, FilterMode, Rules};
use crate::negotiate::Preference;
use crate::registry::CodecRegistry;
use crate::service::CompressionService;
use std::sync::Arc;
use tower::Layer;

/// A Tower layer that compresses HTTP response bodies.
///
/// This layer wraps services and compresses response bodies with the coding
/// negotiated from the client's `Accept-Encoding` header.
#[derive(Debug, Clone)]
pub struct CompressionLayer {
    config: Arc<Config>,
}

impl CompressionLayer {
    /// Creates a new compression layer with default settings: every
    /// compiled-in codec, a minimum size of [`DEFAULT_MIN_SIZE`] bytes, server
    /// preference and no content-type filter.
    pub fn new() -> Self {
        Self {
            config: Arc::new(Config::defaults()),
        }
    }

    /// Starts an empty configuration with no codecs registered.
    pub fn builder() -> CompressionLayerBuilder {
        CompressionLayerBuilder::new()
    }

    #[cfg(test)]
    pub(crate) fn config(&self) -> &Arc<Config> {
        &self.config
    }
}

impl Default for CompressionLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Layer<S> for CompressionLayer {
    type Service = CompressionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CompressionService::new(inner, Arc::clone(&self.config))
    }
}

enum PendingCodec {
    Builtin {
        provider: crate::codec::CodecProvider,
        priority: i32,
    },
    Custom {
        token: String,
        priority: i32,
        provider: Arc<dyn EncoderProvider>,
    },
}

/// Configures a [`CompressionLayer`].
///
/// Invalid options are remembered and reported by [`build`](Self::build), so a
/// misconfigured layer can never serve a request.
pub struct CompressionLayerBuilder {
    min_size: usize,
    content_types: Option<ContentTypeFilter>,
    preference: Preference,
    codecs: Vec<PendingCodec>,
    pool_capacity: Option<usize>,
    error: Option<ConfigError>,
}

impl CompressionLayerBuilder {
    /// An empty configuration: no codecs, minimum size 0, server preference.
    pub fn new() -> Self {
        Self {
            min_size: 0,
            content_types: None,
            preference: Preference::Server,
            codecs: Vec::new(),
            pool_capacity: None,
            error: None,
        }
    }

    /// The configuration of [`CompressionLayer::new`], to be adjusted further.
    pub fn with_defaults() -> Self {
        let mut builder = Self::new().min_size(DEFAULT_MIN_SIZE);
        for codec in Codec::ALL {
            builder = builder.codec(*codec);
        }
        builder
    }

    /// Sets the minimum body size required for compression.
    ///
    /// Up to this many bytes are buffered before deciding; shorter responses
    /// are sent uncompressed.
    pub fn min_size(mut self, size: usize) -> Self {
        if size > MAX_MIN_SIZE {
            self.record(ConfigError::MinSizeTooLarge {
                size,
                max: MAX_MIN_SIZE,
            });
        }
        self.min_size = size;
        self
    }

    /// Only compresses (`FilterMode::Allow`) or never compresses
    /// (`FilterMode::Deny`) the listed content types.
    pub fn content_types<I, S>(mut self, patterns: I, mode: FilterMode) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        match ContentTypeFilter::new(patterns, mode) {
            Ok(filter) => self.content_types = Some(filter),
            Err(err) => self.record(err),
        }
        self
    }

    /// Chooses whose ranking wins when several codings are acceptable.
    pub fn prefer(mut self, preference: Preference) -> Self {
        self.preference = preference;
        self
    }

    /// Registers a custom encoder for `token` with a server-side priority.
    ///
    /// Registering an existing token replaces it.
    pub fn compressor<P>(mut self, token: &str, priority: i32, provider: P) -> Self
    where
        P: EncoderProvider,
    {
        self.codecs.push(PendingCodec::Custom {
            token: token.to_owned(),
            priority,
            provider: Arc::new(provider),
        });
        self
    }

    /// Registers a built-in codec at its default level and priority.
    pub fn codec(mut self, codec: Codec) -> Self {
        self.codecs.push(PendingCodec::Builtin {
            provider: codec.provider(),
            priority: codec.default_priority(),
        });
        self
    }

    /// Registers a built-in codec at a specific level, with its default priority.
    pub fn codec_level(mut self, codec: Codec, level: i32) -> Self {
        match codec.with_level(level) {
            Ok(provider) => self.codecs.push(PendingCodec::Builtin {
                provider,
                priority: codec.default_priority(),
            }),
            Err(err) => self.record(err),
        }
        self
    }

    /// Registers gzip at the given level (0–9).
    #[cfg(feature = "gzip")]
    pub fn gzip_level(self, level: i32) -> Self {
        self.codec_level(Codec::Gzip, level)
    }

    /// Registers deflate at the given level (0–9).
    #[cfg(feature = "deflate")]
    pub fn deflate_level(self, level: i32) -> Self {
        self.codec_level(Codec::Deflate, level)
    }

    /// Registers brotli at the given quality (0–11).
    #[cfg(feature = "brotli")]
    pub fn brotli_level(self, level: i32) -> Self {
        self.codec_level(Codec::Brotli, level)
    }

    /// Registers zstd at the given level (1–22).
    #[cfg(feature = "zstd")]
    pub fn zstd_level(self, level: i32) -> Self {
        self.codec_level(Codec::Zstd, level)
    }

    /// Caps the number of idle buffers and encoders kept for reuse.
    pub fn pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = Some(capacity);
        self
    }

    /// Validates the configuration and builds the layer.
    pub fn build(self) -> Result<CompressionLayer, ConfigError> {
        if let Some(err) = self.error {
            return Err(err);
        }

        let mut registry = CodecRegistry::new();
        for codec in self.codecs {
            match codec {
                PendingCodec::Builtin { provider, priority } => {
                    registry.register_codec(provider, priority, self.pool_capacity);
                }
                PendingCodec::Custom {
                    token,
                    priority,
                    provider,
                } => registry.register(&token, priority, provider, self.pool_capacity)?,
            }
        }

        tracing::debug!(
            min_size = self.min_size,
            preference = ?self.preference,
            codecs = ?registry.iter().map(|r| r.token()).collect::<Vec<_>>(),
            "compression layer configured"
        );

        let rules = Rules {
            min_size: self.min_size,
            content_types: self.content_types,
        };
        Ok(CompressionLayer {
            config: Arc::new(Config::new(
                rules,
                self.preference,
                registry,
                self.pool_capacity,
            )),
        })
    }

    fn record(&mut self, err: ConfigError) {
        self.error.get_or_insert(err);
    }
}

impl Default for CompressionLayerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CompressionLayerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressionLayerBuilder")
            .field("min_size", &self.min_size)
            .field("content_types", &self.content_types)
            .field("preference", &self.preference)
            .field("codecs", &self.codecs.len())
            .field("pool_capacity", &self.pool_capacity)
            .field("error", &self.error)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_register_every_codec() {
        let layer = CompressionLayer::new();
        let config = layer.config();
        assert_eq!(config.registry.len(), Codec::ALL.len());
        assert_eq!(config.rules.min_size, DEFAULT_MIN_SIZE);
        assert_eq!(config.preference, Preference::Server);
        assert!(config.rules.content_types.is_none());
    }

    #[test]
    fn test_builder_with_defaults_matches_new() {
        let built = CompressionLayerBuilder::with_defaults().build().unwrap();
        let tokens = |layer: &CompressionLayer| {
            layer
                .config()
                .registry
                .iter()
                .map(|r| (r.token().to_owned(), r.priority()))
                .collect::<Vec<_>>()
        };
        assert_eq!(tokens(&built), tokens(&CompressionLayer::new()));
    }

    #[test]
    fn test_first_error_wins() {
        let err = CompressionLayer::builder()
            .content_types(["not-a-type"], FilterMode::Allow)
            .min_size(MAX_MIN_SIZE + 1)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidContentType { .. }));
    }

    #[test]
    fn test_min_size_ceiling() {
        let err = CompressionLayer::builder()
            .min_size(MAX_MIN_SIZE + 1)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::MinSizeTooLarge { .. }));
        assert!(CompressionLayer::builder().min_size(MAX_MIN_SIZE).build().is_ok());
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_invalid_level_fails_build() {
        let err = CompressionLayerBuilder::with_defaults()
            .gzip_level(42)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidLevel { codec: "gzip", .. }));
    }

    #[test]
    fn test_invalid_custom_token_fails_build() {
        use crate::codec::Encoder;

        let err = CompressionLayer::builder()
            .compressor("identity", 0, || -> Box<dyn Encoder> { unreachable!() })
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidToken { .. }));
    }

    #[test]
    #[cfg(all(feature = "gzip", feature = "brotli"))]
    fn test_level_override_keeps_position() {
        let layer = CompressionLayerBuilder::with_defaults()
            .gzip_level(9)
            .build()
            .unwrap();
        let registry = &layer.config().registry;
        let position = registry.iter().position(|r| r.token() == "gzip");
        let expected = Codec::ALL.iter().position(|c| *c == Codec::Gzip);
        assert_eq!(position, expected);
    }
}
