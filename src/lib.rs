//! Content-negotiated HTTP response compression middleware for Tower.
//!
//! This crate provides a Tower layer that picks a content coding from the
//! client's `Accept-Encoding` header and the codings the server has
//! registered, then compresses the response body with it. Whether to compress
//! is decided lazily: the first bytes of the body are buffered until the
//! response is known to be large enough and of an eligible content type.
//!
//! # Example
//!
//! ```ignore
//! use negotiated_compression::{CompressionLayer, FilterMode, Preference};
//! use tower::ServiceBuilder;
//!
//! let compression = CompressionLayer::builder()
//!     .gzip_level(6)
//!     .brotli_level(4)
//!     .min_size(256)
//!     .content_types(["text/*", "application/json"], FilterMode::Allow)
//!     .prefer(Preference::Client)
//!     .build()?;
//!
//! let service = ServiceBuilder::new()
//!     .layer(compression)
//!     .service(my_service);
//! ```
//!
//! # Negotiation
//!
//! A coding is acceptable when the client lists it with a non-zero quality,
//! or lists `*` with a non-zero quality and does not name it explicitly.
//! With [`Preference::Server`] the acceptable coding with the highest
//! registered priority wins; with [`Preference::Client`] the highest quality
//! wins and priority breaks ties. Remaining ties go to the coding registered
//! first.
//!
//! # Compression Rules
//!
//! The middleware will **not** compress responses when:
//! - The client accepts none of the registered codings
//! - The request method is `HEAD` or the status never carries a body
//! - `Content-Encoding` header is already set
//! - `Content-Range` header is present (range responses)
//! - `Content-Type` is `application/grpc` (except `application/grpc-web`)
//! - The body (or a declared `Content-Length`) is below the minimum size
//! - The content type is rejected by the configured filter; without a
//!   `Content-Type` header the type is sniffed from the buffered bytes
//!
//! The middleware will **always flush** after each chunk when:
//! - `X-Accel-Buffering: no` header is present
//! - `Content-Type` is `text/event-stream`
//! - `Content-Type` starts with `application/grpc-web`
//!
//! # Response Modifications
//!
//! `Vary: Accept-Encoding` is added to every response that does not already
//! vary on it. When compression is applied:
//! - `Content-Encoding` header is set to the negotiated coding
//! - `Content-Length` header is removed (compressed size is unknown)
//! - `Accept-Ranges` header is removed

#![deny(missing_docs)]

mod accept;
mod body;
mod codec;
mod config;
mod error;
mod filter;
mod future;
mod layer;
mod negotiate;
mod pool;
mod registry;
mod service;
mod writer;

pub use accept::AcceptedEncodings;
pub use body::CompressionBody;
pub use codec::{Codec, CodecProvider, Encoder, EncoderProvider};
pub use config::{DEFAULT_MIN_SIZE, MAX_MIN_SIZE};
pub use error::ConfigError;
pub use filter::{ContentTypeFilter, FilterMode};
pub use future::ResponseFuture;
pub use layer::{CompressionLayer, CompressionLayerBuilder};
pub use negotiate::{Common, CommonEncodings, Preference, negotiate};
pub use pool::{Pool, Pooled, Recycle};
pub use registry::{CodecRegistry, Registration};
pub use service::CompressionService;
