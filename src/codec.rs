use crate::error::ConfigError;
use bytes::BytesMut;
use compression_codecs::EncodeV2;
#[cfg(feature = "brotli")]
use compression_codecs::brotli::{BrotliEncoder, params::EncoderParams as BrotliParams};
#[cfg(feature = "deflate")]
use compression_codecs::zlib::ZlibEncoder;
#[cfg(feature = "gzip")]
use compression_codecs::gzip::GzipEncoder;
#[cfg(feature = "zstd")]
use compression_codecs::zstd::ZstdEncoder;
use compression_core::Level;
use compression_core::util::{PartialBuffer, WriteBuffer};
use std::fmt;
use std::io;

const OUTPUT_BUFFER_SIZE: usize = 8 * 1024; // 8KB scratch per encoder

/// A streaming compressor for one content coding.
///
/// Raw bytes go in through [`encode`](Encoder::encode), compressed bytes are
/// appended to `output` as the codec produces them, and
/// [`finish`](Encoder::finish) writes the trailer that terminates the stream.
/// Encoders are pooled and reused across responses: [`reset`](Encoder::reset)
/// must discard every trace of the previous stream.
pub trait Encoder: Send {
    /// Compresses `input`, appending whatever output is ready.
    fn encode(&mut self, input: &[u8], output: &mut BytesMut) -> io::Result<()>;

    /// Emits all pending output so the receiver can decode what was written so far.
    fn flush(&mut self, output: &mut BytesMut) -> io::Result<()>;

    /// Terminates the stream, appending the codec's trailer.
    fn finish(&mut self, output: &mut BytesMut) -> io::Result<()>;

    /// Prepares the encoder for a new, unrelated stream.
    fn reset(&mut self);
}

/// Builds fresh encoders for a registered content coding.
pub trait EncoderProvider: Send + Sync + 'static {
    /// Returns a new encoder at the start of a stream.
    fn encoder(&self) -> Box<dyn Encoder>;
}

impl<F> EncoderProvider for F
where
    F: Fn() -> Box<dyn Encoder> + Send + Sync + 'static,
{
    fn encoder(&self) -> Box<dyn Encoder> {
        self()
    }
}

/// Built-in compression codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// Zstd compression.
    #[cfg(feature = "zstd")]
    Zstd,
    /// Brotli compression.
    #[cfg(feature = "brotli")]
    Brotli,
    /// Gzip compression.
    #[cfg(feature = "gzip")]
    Gzip,
    /// Deflate compression.
    #[cfg(feature = "deflate")]
    Deflate,
}

impl Codec {
    /// Every codec enabled at compile time.
    pub const ALL: &'static [Codec] = &[
        #[cfg(feature = "zstd")]
        Codec::Zstd,
        #[cfg(feature = "brotli")]
        Codec::Brotli,
        #[cfg(feature = "gzip")]
        Codec::Gzip,
        #[cfg(feature = "deflate")]
        Codec::Deflate,
    ];

    /// Returns the Content-Encoding header value for this codec.
    pub fn content_encoding(&self) -> &'static str {
        match *self {
            #[cfg(feature = "zstd")]
            Codec::Zstd => "zstd",
            #[cfg(feature = "brotli")]
            Codec::Brotli => "br",
            #[cfg(feature = "gzip")]
            Codec::Gzip => "gzip",
            #[cfg(feature = "deflate")]
            Codec::Deflate => "deflate",
        }
    }

    /// Server-side priority used when the codec is registered with defaults.
    pub fn default_priority(&self) -> i32 {
        match *self {
            #[cfg(feature = "zstd")]
            Codec::Zstd => 3,
            #[cfg(feature = "brotli")]
            Codec::Brotli => 2,
            #[cfg(feature = "gzip")]
            Codec::Gzip => 1,
            #[cfg(feature = "deflate")]
            Codec::Deflate => 0,
        }
    }

    /// Inclusive range of compression levels accepted by [`Codec::with_level`].
    pub fn level_range(&self) -> (i32, i32) {
        match *self {
            #[cfg(feature = "zstd")]
            Codec::Zstd => (1, 22),
            #[cfg(feature = "brotli")]
            Codec::Brotli => (0, 11),
            #[cfg(feature = "gzip")]
            Codec::Gzip => (0, 9),
            #[cfg(feature = "deflate")]
            Codec::Deflate => (0, 9),
        }
    }

    /// Returns a provider for this codec at its default level.
    pub fn provider(self) -> CodecProvider {
        CodecProvider {
            codec: self,
            level: None,
        }
    }

    /// Returns a provider for this codec at a specific level.
    ///
    /// Fails if the level is outside [`Codec::level_range`].
    pub fn with_level(self, level: i32) -> Result<CodecProvider, ConfigError> {
        let (min, max) = self.level_range();
        if !(min..=max).contains(&level) {
            return Err(ConfigError::InvalidLevel {
                codec: self.content_encoding(),
                level,
                min,
                max,
            });
        }
        Ok(CodecProvider {
            codec: self,
            level: Some(level),
        })
    }

    /// Creates a raw codec state machine.
    fn raw_encoder(&self, level: Option<i32>) -> Box<dyn EncodeV2 + Send> {
        let quality = level.map_or(Level::Default, Level::Precise);
        match *self {
            #[cfg(feature = "zstd")]
            Codec::Zstd => Box::new(ZstdEncoder::new(level.unwrap_or(3))), // level 3 is a good default
            #[cfg(feature = "brotli")]
            Codec::Brotli => Box::new(BrotliEncoder::new(BrotliParams::default().quality(quality))),
            #[cfg(feature = "gzip")]
            Codec::Gzip => Box::new(GzipEncoder::new(quality.into())),
            #[cfg(feature = "deflate")]
            // HTTP "deflate" is the zlib format
            Codec::Deflate => Box::new(ZlibEncoder::new(quality.into())),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.content_encoding())
    }
}

/// [`EncoderProvider`] for a built-in [`Codec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecProvider {
    codec: Codec,
    level: Option<i32>,
}

impl CodecProvider {
    /// The codec this provider builds encoders for.
    pub fn codec(&self) -> Codec {
        self.codec
    }
}

impl EncoderProvider for CodecProvider {
    fn encoder(&self) -> Box<dyn Encoder> {
        Box::new(CodecEncoder::new(self.codec, self.level))
    }
}

/// Adapts a `compression-codecs` state machine to [`Encoder`].
struct CodecEncoder {
    codec: Codec,
    level: Option<i32>,
    encoder: Box<dyn EncodeV2 + Send>,
    output_buffer: Vec<u8>,
}

impl CodecEncoder {
    fn new(codec: Codec, level: Option<i32>) -> Self {
        Self {
            codec,
            level,
            encoder: codec.raw_encoder(level),
            output_buffer: vec![0u8; OUTPUT_BUFFER_SIZE],
        }
    }
}

impl Encoder for CodecEncoder {
    fn encode(&mut self, input: &[u8], output: &mut BytesMut) -> io::Result<()> {
        let mut input_buf = PartialBuffer::new(input);

        // Keep encoding until all input is consumed
        loop {
            let mut out = WriteBuffer::new_initialized(self.output_buffer.as_mut_slice());
            self.encoder
                .encode(&mut input_buf, &mut out)
                .map_err(io::Error::other)?;

            let written = out.written_len();
            output.extend_from_slice(&self.output_buffer[..written]);

            if input_buf.written_len() >= input.len() {
                return Ok(());
            }
            if written == 0 && input_buf.written_len() == 0 {
                return Err(io::Error::other(format!(
                    "{} encoder made no progress",
                    self.codec
                )));
            }
        }
    }

    fn flush(&mut self, output: &mut BytesMut) -> io::Result<()> {
        loop {
            let mut out = WriteBuffer::new_initialized(self.output_buffer.as_mut_slice());
            let done = self.encoder.flush(&mut out).map_err(io::Error::other)?;
            let written = out.written_len();
            output.extend_from_slice(&self.output_buffer[..written]);
            if done {
                return Ok(());
            }
        }
    }

    fn finish(&mut self, output: &mut BytesMut) -> io::Result<()> {
        loop {
            let mut out = WriteBuffer::new_initialized(self.output_buffer.as_mut_slice());
            let done = self.encoder.finish(&mut out).map_err(io::Error::other)?;
            let written = out.written_len();
            output.extend_from_slice(&self.output_buffer[..written]);
            if done {
                return Ok(());
            }
        }
    }

    fn reset(&mut self) {
        // codec states cannot be rewound, so start a new stream and keep the scratch buffer
        self.encoder = self.codec.raw_encoder(self.level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_encoding() {
        #[cfg(feature = "zstd")]
        assert_eq!(Codec::Zstd.content_encoding(), "zstd");
        #[cfg(feature = "brotli")]
        assert_eq!(Codec::Brotli.content_encoding(), "br");
        #[cfg(feature = "gzip")]
        assert_eq!(Codec::Gzip.content_encoding(), "gzip");
        #[cfg(feature = "deflate")]
        assert_eq!(Codec::Deflate.content_encoding(), "deflate");
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_gzip_level_out_of_range() {
        let err = Codec::Gzip.with_level(10).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidLevel { codec: "gzip", level: 10, .. }
        ));
        assert!(Codec::Gzip.with_level(9).is_ok());
    }

    #[test]
    #[cfg(feature = "brotli")]
    fn test_brotli_level_out_of_range() {
        assert!(Codec::Brotli.with_level(12).is_err());
        assert!(Codec::Brotli.with_level(-1).is_err());
        assert!(Codec::Brotli.with_level(4).is_ok());
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_gzip_encoder_round_trip() {
        use std::io::Read;

        let provider = Codec::Gzip.with_level(6).unwrap();
        let mut encoder = provider.encoder();
        let mut output = BytesMut::new();
        encoder.encode(b"hello ", &mut output).unwrap();
        encoder.encode(b"world", &mut output).unwrap();
        encoder.finish(&mut output).unwrap();
        assert_eq!(&output[..2], &[0x1f, 0x8b]);

        let mut decoded = String::new();
        flate2::read::GzDecoder::new(&output[..])
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, "hello world");
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_reset_starts_a_fresh_stream() {
        use std::io::Read;

        let mut encoder = Codec::Gzip.provider().encoder();
        let mut discarded = BytesMut::new();
        encoder.encode(b"secret from a previous response", &mut discarded).unwrap();
        encoder.reset();

        let mut output = BytesMut::new();
        encoder.encode(b"fresh", &mut output).unwrap();
        encoder.finish(&mut output).unwrap();

        let mut decoded = String::new();
        flate2::read::GzDecoder::new(&output[..])
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, "fresh");
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_flush_makes_prefix_decodable() {
        use std::io::Read;

        let mut encoder = Codec::Gzip.provider().encoder();
        let mut output = BytesMut::new();
        encoder.encode(b"data: first event\n\n", &mut output).unwrap();
        encoder.flush(&mut output).unwrap();

        let mut decoded = vec![0u8; 64];
        let n = flate2::read::GzDecoder::new(&output[..])
            .read(&mut decoded)
            .unwrap();
        assert_eq!(&decoded[..n], b"data: first event\n\n");
    }
}
