use thiserror::Error;

/// Errors reported while building a [`CompressionLayer`](crate::CompressionLayer).
///
/// Every option is validated up front, so a layer that was built successfully
/// never fails a request because of its configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The encoding token cannot be registered.
    #[error("invalid content coding {token:?}: {reason}")]
    InvalidToken {
        /// The rejected token.
        token: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A built-in codec was configured with a level it does not support.
    #[error("{codec} level {level} is outside the supported range {min}..={max}")]
    InvalidLevel {
        /// Content coding of the codec.
        codec: &'static str,
        /// The rejected level.
        level: i32,
        /// Lowest accepted level.
        min: i32,
        /// Highest accepted level.
        max: i32,
    },

    /// A content-type filter pattern could not be parsed as a media type.
    #[error("invalid content type pattern {pattern:?}")]
    InvalidContentType {
        /// The rejected pattern.
        pattern: String,
        /// Parser error.
        #[source]
        source: mime::FromStrError,
    },

    /// The minimum size would require buffering more than the allowed ceiling.
    #[error("minimum size {size} exceeds the maximum of {max} bytes")]
    MinSizeTooLarge {
        /// The rejected size.
        size: usize,
        /// Upper bound.
        max: usize,
    },
}
