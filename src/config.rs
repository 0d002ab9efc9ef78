use crate::codec::Codec;
use crate::filter::Rules;
use crate::negotiate::Preference;
use crate::pool::Pool;
use crate::registry::CodecRegistry;
use bytes::BytesMut;
use std::sync::Arc;

/// Default minimum body size for compression.
///
/// Deliberately small: below this the codec framing outweighs any saving.
/// Measure whether a larger value suits your workload.
pub const DEFAULT_MIN_SIZE: usize = 20;

/// Largest accepted minimum size; the whole prefix is held in memory.
pub const MAX_MIN_SIZE: usize = 16 * 1024 * 1024;

/// Immutable configuration shared by every service built from one layer.
#[derive(Debug)]
pub(crate) struct Config {
    pub(crate) rules: Rules,
    pub(crate) preference: Preference,
    pub(crate) registry: CodecRegistry,
    /// Most bytes held back before the decision; the filter never waits past it.
    pub(crate) buffer_limit: usize,
    pub(crate) buffers: Arc<Pool<BytesMut>>,
}

impl Config {
    pub(crate) fn new(
        rules: Rules,
        preference: Preference,
        registry: CodecRegistry,
        pool_capacity: Option<usize>,
    ) -> Self {
        // an empty buffer still waits for one byte when sniffing
        let buffer_limit = rules.min_size.max(1);
        Self {
            rules,
            preference,
            registry,
            buffer_limit,
            buffers: Arc::new(
                Pool::new(move || BytesMut::with_capacity(buffer_limit))
                    .with_capacity_limit(pool_capacity),
            ),
        }
    }

    /// Every compiled-in codec at its default level, [`DEFAULT_MIN_SIZE`],
    /// server preference and no content-type filter.
    pub(crate) fn defaults() -> Self {
        let mut registry = CodecRegistry::new();
        for codec in Codec::ALL {
            registry.register_codec(codec.provider(), codec.default_priority(), None);
        }
        let rules = Rules {
            min_size: DEFAULT_MIN_SIZE,
            content_types: None,
        };
        Self::new(rules, Preference::Server, registry, None)
    }
}
