use crate::accept::AcceptedEncodings;
use crate::registry::CodecRegistry;
use std::cmp::Ordering;

/// Whose ranking decides between several acceptable codings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Preference {
    /// Highest server priority wins; client quality only accepts or rejects.
    #[default]
    Server,
    /// Highest client quality wins; server priority breaks ties.
    Client,
}

/// A coding both sides can use.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Common {
    /// Index into the [`CodecRegistry`].
    pub index: usize,
    /// Quality the client assigned, explicitly or through `*`.
    pub quality: f32,
    /// Server priority of the registration.
    pub priority: i32,
}

/// Codings acceptable to the client that the server can produce.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommonEncodings {
    entries: Vec<Common>,
}

impl CommonEncodings {
    /// Picks one coding according to `preference`, or `None` when nothing is
    /// acceptable.
    pub fn select(&self, preference: Preference) -> Option<usize> {
        // max_by keeps the last of equal elements; iterate in reverse so the
        // earliest registration wins ties.
        let best = match preference {
            Preference::Server => self
                .entries
                .iter()
                .rev()
                .max_by_key(|c| c.priority),
            Preference::Client => self.entries.iter().rev().max_by(|a, b| {
                a.quality
                    .partial_cmp(&b.quality)
                    .unwrap_or(Ordering::Equal)
                    .then(a.priority.cmp(&b.priority))
            }),
        };
        best.map(|c| c.index)
    }

    /// Iterates in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Common> {
        self.entries.iter()
    }

    /// Returns `true` if no coding is shared.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of shared codings.
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Intersects the client's accepted codings with the registry.
///
/// A coding is acceptable if the client lists it, or lists `*`, with a
/// non-zero quality. An explicit `q=0` rejects the coding even when `*` would
/// accept it.
pub fn negotiate(accepted: &AcceptedEncodings, registry: &CodecRegistry) -> CommonEncodings {
    let wildcard = accepted.wildcard();
    let entries = registry
        .iter()
        .enumerate()
        .filter_map(|(index, registration)| {
            let quality = accepted.get(registration.token()).or(wildcard)?;
            (quality > 0.0).then_some(Common {
                index,
                quality,
                priority: registration.priority(),
            })
        })
        .collect();
    CommonEncodings { entries }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Encoder, EncoderProvider};
    use bytes::BytesMut;
    use std::io;
    use std::sync::Arc;

    struct Noop;

    impl Encoder for Noop {
        fn encode(&mut self, input: &[u8], output: &mut BytesMut) -> io::Result<()> {
            output.extend_from_slice(input);
            Ok(())
        }
        fn flush(&mut self, _output: &mut BytesMut) -> io::Result<()> {
            Ok(())
        }
        fn finish(&mut self, _output: &mut BytesMut) -> io::Result<()> {
            Ok(())
        }
        fn reset(&mut self) {}
    }

    fn registry(codecs: &[(&str, i32)]) -> CodecRegistry {
        let mut registry = CodecRegistry::new();
        for &(token, priority) in codecs {
            let provider: Arc<dyn EncoderProvider> =
                Arc::new(|| Box::new(Noop) as Box<dyn Encoder>);
            registry.register(token, priority, provider, None).unwrap();
        }
        registry
    }

    fn choose(header: &str, registry: &CodecRegistry, preference: Preference) -> Option<String> {
        let common = negotiate(&AcceptedEncodings::parse(header), registry);
        common
            .select(preference)
            .and_then(|i| registry.entry(i))
            .map(|r| r.token().to_owned())
    }

    #[test]
    fn test_server_preference_ranks_by_priority() {
        let registry = registry(&[("gzip", 0), ("br", 1)]);
        assert_eq!(
            choose("gzip;q=0.5, br;q=0.8", &registry, Preference::Server).as_deref(),
            Some("br")
        );
        assert_eq!(
            choose("gzip;q=1.0, br;q=0.1", &registry, Preference::Server).as_deref(),
            Some("br")
        );
    }

    #[test]
    fn test_client_preference_ranks_by_quality() {
        let registry = registry(&[("gzip", 0), ("br", 1)]);
        assert_eq!(
            choose("gzip;q=1.0, br;q=0.1", &registry, Preference::Client).as_deref(),
            Some("gzip")
        );
        // equal quality falls back to priority
        assert_eq!(
            choose("gzip, br", &registry, Preference::Client).as_deref(),
            Some("br")
        );
    }

    #[test]
    fn test_ties_broken_by_registration_order() {
        let registry = registry(&[("zstd", 1), ("gzip", 1)]);
        assert_eq!(
            choose("gzip, zstd", &registry, Preference::Server).as_deref(),
            Some("zstd")
        );
        assert_eq!(
            choose("gzip, zstd", &registry, Preference::Client).as_deref(),
            Some("zstd")
        );
    }

    #[test]
    fn test_explicit_zero_overrides_wildcard() {
        let registry = registry(&[("gzip", 0), ("br", 1)]);
        assert_eq!(
            choose("*;q=0.5, br;q=0", &registry, Preference::Server).as_deref(),
            Some("gzip")
        );
        assert_eq!(choose("*, br;q=0, gzip;q=0", &registry, Preference::Client), None);
    }

    #[test]
    fn test_wildcard_accepts_unlisted() {
        let registry = registry(&[("gzip", 0), ("br", 1)]);
        let common = negotiate(&AcceptedEncodings::parse("*"), &registry);
        assert_eq!(common.len(), 2);
        assert_eq!(
            choose("*;q=0", &registry, Preference::Server),
            None,
            "a rejecting wildcard accepts nothing"
        );
    }

    #[test]
    fn test_no_header_means_identity_only() {
        let registry = registry(&[("gzip", 0)]);
        assert!(negotiate(&AcceptedEncodings::parse(""), &registry).is_empty());
        assert_eq!(choose("identity", &registry, Preference::Server), None);
    }

    #[test]
    fn test_unsupported_codings_are_ignored() {
        let registry = registry(&[("gzip", 0)]);
        assert_eq!(choose("compress, sdch", &registry, Preference::Server), None);
    }

    #[test]
    fn test_chosen_is_always_registered() {
        let registry = registry(&[("gzip", 0), ("br", 1), ("zstd", 2)]);
        let headers = [
            "",
            "*",
            "gzip",
            "deflate, compress",
            "br;q=0.2, gzip;q=0.9, *;q=0",
            "zstd;q=0, *",
            ",,;q=1",
        ];
        for header in headers {
            for preference in [Preference::Server, Preference::Client] {
                if let Some(token) = choose(header, &registry, preference) {
                    assert!(registry.get(&token).is_some(), "{header:?} chose {token}");
                }
            }
        }
    }

    #[test]
    fn test_policies_agree_when_orders_agree() {
        let registry = registry(&[("gzip", 0), ("br", 1)]);
        let header = "gzip;q=0.4, br;q=0.9";
        assert_eq!(
            choose(header, &registry, Preference::Server),
            choose(header, &registry, Preference::Client)
        );
    }
}
